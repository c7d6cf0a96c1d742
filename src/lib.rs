//! # cartox: CAR-T toxicity dataset preparation
//!
//! cartox turns raw clinical tables into leakage-safe, model-ready
//! datasets for CAR-T toxicity prediction: patient-level stratified
//! train/test splitting, group-stratified cross-validation folds, and
//! time-window aggregation of per-patient longitudinal lab series.
//!
//! ## Features
//!
//! - Stratified splitting at the patient granularity (no patient ever
//!   straddles the train/test boundary)
//! - Group-stratified K-fold generation over the train partition
//! - Longitudinal aggregation (mean, std, min, max, slope, AUC) over a
//!   configurable observation window
//! - A fit/transform preprocessing pipeline whose statistics are learned
//!   from training rows only
//! - Support for CSV/TSV input, plain or gzipped
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use cartox::data::loader::StaticTableLoader;
//! use cartox::split::{split_with_cv, SplitConfig};
//!
//! let table = StaticTableLoader::load("static.csv").unwrap();
//! let (train, test, folds) = split_with_cv(&table, SplitConfig::default(), 5).unwrap();
//!
//! for fold in &folds {
//!     let fold_train = train.select_rows(&fold.train_positions);
//!     let fold_val = train.select_rows(&fold.val_positions);
//!     // fit a pipeline on fold_train, evaluate on fold_val
//! }
//! # let _ = test;
//! ```

pub mod cli;
pub mod data;
pub mod error;
pub mod features;
pub mod pipeline;
pub mod split;
pub mod utils;

/// Re-export commonly used types
pub use data::loader::StaticTableLoader;
pub use data::{ColumnSchema, ObservationWindow, StaticTable, Value};
pub use error::{PipelineError, Result};
pub use features::{AggregatorConfig, FeatureMatrix, LongitudinalFeatureAggregator};
pub use pipeline::{LeakageSafePreprocessingPipeline, PipelineConfig};
pub use split::folds::{Fold, FoldConfig, GroupStratifiedFoldGenerator};
pub use split::{Partition, SplitConfig, StratifiedPartitioner};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!("{} v{} - CAR-T toxicity dataset preparation", NAME, VERSION)
}
