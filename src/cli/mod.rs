use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// cartox: leakage-safe dataset preparation for CAR-T toxicity prediction
#[derive(Parser, Debug)]
#[command(name = "cartox")]
#[command(about = "Patient-level dataset splitting and longitudinal feature aggregation")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Produce a stratified patient-level train/test split with CV folds
    Split(SplitArgs),

    /// Aggregate per-patient longitudinal files into a joined feature table
    Aggregate(AggregateArgs),

    /// Fit the preprocessing pipeline and emit model-ready matrices
    Prepare(PrepareArgs),
}

/// Splitting arguments
#[derive(Parser, Debug)]
pub struct SplitArgs {
    /// Static patient table (CSV or TSV, optionally gzipped)
    #[arg(short, long, required = true)]
    pub input: PathBuf,

    /// Output directory for split artifacts
    #[arg(short, long, default_value = "./split_output")]
    pub output: PathBuf,

    /// Outcome label column
    #[arg(short, long, default_value = "label")]
    pub label_col: String,

    /// Patient identifier column
    #[arg(short, long, default_value = "patient_id")]
    pub patient_id_col: String,

    /// Binarize the label column at this grade threshold before splitting
    #[arg(long)]
    pub label_threshold: Option<f64>,

    /// Fraction of patients held out for the test set
    #[arg(long, default_value = "0.3")]
    pub test_fraction: f64,

    /// Number of cross-validation folds over the train partition
    #[arg(short, long, default_value = "5")]
    pub n_folds: usize,

    /// Random seed
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Directory of per-patient longitudinal files to copy per partition
    #[arg(long)]
    pub dynamic_dir: Option<PathBuf>,
}

/// Aggregation arguments
#[derive(Parser, Debug)]
pub struct AggregateArgs {
    /// Static patient table (CSV or TSV, optionally gzipped)
    #[arg(short, long, required = true)]
    pub input: PathBuf,

    /// Directory of per-patient longitudinal files
    #[arg(short, long, required = true)]
    pub dynamic_dir: PathBuf,

    /// Output CSV for the joined static+dynamic table
    #[arg(short, long, default_value = "aggregated.csv")]
    pub output: PathBuf,

    /// Patient identifier column
    #[arg(short, long, default_value = "patient_id")]
    pub patient_id_col: String,

    /// First day offset of the observation window (inclusive)
    #[arg(long, default_value = "-15", allow_hyphen_values = true)]
    pub window_start: i32,

    /// Last day offset of the observation window (inclusive)
    #[arg(long, default_value = "2", allow_hyphen_values = true)]
    pub window_end: i32,

    /// Also compute time-to-peak, observation count and last value
    #[arg(long)]
    pub extended: bool,
}

/// Preparation arguments
#[derive(Parser, Debug)]
pub struct PrepareArgs {
    /// Training static table the pipeline is fitted on
    #[arg(short, long, required = true)]
    pub train: PathBuf,

    /// Held-out static table transformed under the fitted statistics
    #[arg(long)]
    pub apply: Option<PathBuf>,

    /// Output directory for feature matrices and labels
    #[arg(short, long, default_value = "./prepared")]
    pub output: PathBuf,

    /// Outcome label column
    #[arg(short, long, default_value = "label")]
    pub label_col: String,

    /// Grade threshold for label binarization
    #[arg(long, default_value = "2")]
    pub label_threshold: f64,

    /// Patient identifier column
    #[arg(short, long, default_value = "patient_id")]
    pub patient_id_col: String,

    /// Numeric covariate columns (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub numeric: Vec<String>,

    /// Nominal covariate columns (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub nominal: Vec<String>,

    /// Ordinal covariate columns (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub ordinal: Vec<String>,

    /// Directory of per-patient longitudinal files
    #[arg(short, long)]
    pub dynamic_dir: Option<PathBuf>,

    /// First day offset of the observation window (inclusive)
    #[arg(long, default_value = "-15", allow_hyphen_values = true)]
    pub window_start: i32,

    /// Last day offset of the observation window (inclusive)
    #[arg(long, default_value = "2", allow_hyphen_values = true)]
    pub window_end: i32,

    /// Also compute time-to-peak, observation count and last value
    #[arg(long)]
    pub extended: bool,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity
pub fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
