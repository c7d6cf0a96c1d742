//! Longitudinal feature aggregation.
//!
//! Converts each patient's day-indexed lab series, restricted to an
//! observation window, into a fixed-width vector of summary statistics.
//! The column schema is frozen at `fit` time from one representative
//! patient so the matrix shape can never drift between the train and
//! validation/test calls of one fold.

use tracing::{debug, info, warn};

use crate::data::loader::SeriesStore;
use crate::data::{LongitudinalSeries, ObservationWindow};
use crate::error::{PipelineError, Result};

/// Aggregator configuration.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Directory of per-patient `{patient_id}.csv` files.
    pub dynamic_dir: std::path::PathBuf,
    pub window: ObservationWindow,
    /// Adds `time_to_peak`, `count` and `last` to the base statistics.
    pub extended: bool,
}

impl AggregatorConfig {
    pub fn new<P: Into<std::path::PathBuf>>(dynamic_dir: P) -> Self {
        Self {
            dynamic_dir: dynamic_dir.into(),
            window: ObservationWindow::default(),
            extended: false,
        }
    }

    pub fn with_window(mut self, window: ObservationWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }
}

/// Numeric feature matrix: rows in caller order, NaN for anything
/// missing. Recomputed per fit/transform call, never cached across
/// partitions or folds.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|c| c == name)
    }

    /// Horizontal concatenation; both sides must have equal row counts.
    pub fn hstack(mut self, other: FeatureMatrix) -> Result<FeatureMatrix> {
        if self.n_rows() != other.n_rows() {
            return Err(PipelineError::invariant(format!(
                "cannot join feature blocks of {} and {} rows",
                self.n_rows(),
                other.n_rows()
            )));
        }
        self.feature_names.extend(other.feature_names);
        for (row, extra) in self.rows.iter_mut().zip(other.rows) {
            row.extend(extra);
        }
        Ok(self)
    }
}

/// Summary statistics of one variable inside the window.
#[derive(Debug, Clone, Copy)]
struct VariableStats {
    mean: f64,
    std: f64,
    min: f64,
    max: f64,
    slope: f64,
    auc: f64,
    time_to_peak: f64,
    count: f64,
    last: f64,
}

impl VariableStats {
    fn nan() -> Self {
        Self {
            mean: f64::NAN,
            std: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            slope: f64::NAN,
            auc: f64::NAN,
            time_to_peak: f64::NAN,
            count: f64::NAN,
            last: f64::NAN,
        }
    }
}

/// Compute all statistics for one variable's windowed `(day, value)`
/// observations. Empty input yields all-NaN.
fn variable_stats(obs: &[(i32, f64)]) -> VariableStats {
    if obs.is_empty() {
        return VariableStats::nan();
    }

    let n = obs.len() as f64;
    let values: Vec<f64> = obs.iter().map(|(_, v)| *v).collect();
    let mean = values.iter().sum::<f64>() / n;
    // Population standard deviation, matching the original aggregation.
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let (peak_day, _) = obs
        .iter()
        .fold((obs[0].0, f64::NEG_INFINITY), |(pd, pv), &(d, v)| {
            if v > pv {
                (d, v)
            } else {
                (pd, pv)
            }
        });
    let last = obs.iter().max_by_key(|(d, _)| *d).map(|(_, v)| *v).unwrap_or(f64::NAN);

    VariableStats {
        mean,
        std,
        min,
        max,
        slope: regression_slope(obs),
        auc: trapezoid_auc(obs),
        time_to_peak: peak_day as f64,
        count: n,
        last,
    }
}

/// Least-squares slope of value against day. NaN with fewer than two
/// observations or fewer than two distinct days.
fn regression_slope(obs: &[(i32, f64)]) -> f64 {
    if obs.len() < 2 {
        return f64::NAN;
    }
    let n = obs.len() as f64;
    let mean_x = obs.iter().map(|(d, _)| *d as f64).sum::<f64>() / n;
    let mean_y = obs.iter().map(|(_, v)| *v).sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for &(d, v) in obs {
        let dx = d as f64 - mean_x;
        sxx += dx * dx;
        sxy += dx * (v - mean_y);
    }
    if sxx == 0.0 {
        // All observations on the same day.
        return f64::NAN;
    }
    sxy / sxx
}

/// Trapezoidal integral of value over day, honoring the actual (possibly
/// irregular) day spacing. NaN with fewer than two observations.
fn trapezoid_auc(obs: &[(i32, f64)]) -> f64 {
    if obs.len() < 2 {
        return f64::NAN;
    }
    let mut sorted: Vec<(i32, f64)> = obs.to_vec();
    sorted.sort_by_key(|(d, _)| *d);
    if sorted.first().map(|(d, _)| *d) == sorted.last().map(|(d, _)| *d) {
        return f64::NAN;
    }
    sorted
        .windows(2)
        .map(|w| {
            let (d0, v0) = w[0];
            let (d1, v1) = w[1];
            (d1 - d0) as f64 * (v0 + v1) / 2.0
        })
        .sum()
}

const BASE_STATS: &[&str] = &["mean", "std", "min", "max", "slope", "auc"];
const EXTENDED_STATS: &[&str] = &["time_to_peak", "count", "last"];

/// Per-patient time-window feature aggregator.
///
/// `fit` freezes the feature-name schema from the first patient whose
/// series file exists; `transform` reproduces exactly that schema for
/// every patient, filling NaN for anything absent.
#[derive(Debug, Clone)]
pub struct LongitudinalFeatureAggregator {
    config: AggregatorConfig,
    store: SeriesStore,
    feature_names: Option<Vec<String>>,
    variables: Vec<String>,
}

impl LongitudinalFeatureAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        let store = SeriesStore::new(&config.dynamic_dir);
        Self {
            config,
            store,
            feature_names: None,
            variables: Vec::new(),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Fitted schema, in matrix column order.
    pub fn feature_names(&self) -> Option<&[String]> {
        self.feature_names.as_deref()
    }

    fn stat_names(&self) -> Vec<&'static str> {
        let mut stats: Vec<&'static str> = BASE_STATS.to_vec();
        if self.config.extended {
            stats.extend(EXTENDED_STATS);
        }
        stats
    }

    /// Discover the feature schema from one representative patient's
    /// series. Patients without a file are skipped; if nobody has one,
    /// aggregation cannot proceed.
    pub fn fit(&mut self, patient_ids: &[String]) -> Result<&mut Self> {
        // Refitting starts clean so statistics never carry across folds.
        self.feature_names = None;
        self.variables.clear();

        let mut representative = None;
        for id in patient_ids {
            if let Some(series) = self.store.load(id)? {
                representative = Some((id.clone(), series));
                break;
            }
        }
        let Some((id, series)) = representative else {
            return Err(PipelineError::data(format!(
                "none of the {} patients has a longitudinal file under {:?}",
                patient_ids.len(),
                self.config.dynamic_dir
            )));
        };

        let stats = self.stat_names();
        let mut names = Vec::with_capacity(series.variables.len() * stats.len());
        for var in &series.variables {
            for stat in &stats {
                names.push(format!("{var}_{stat}"));
            }
        }
        info!(
            "Aggregator fitted on patient {}: {} variables, {} features, window [{}, {}]",
            id,
            series.variables.len(),
            names.len(),
            self.config.window.start,
            self.config.window.end
        );
        self.variables = series.variables;
        self.feature_names = Some(names);
        Ok(self)
    }

    /// One feature row per patient, in the given order, under the fitted
    /// schema.
    pub fn transform(&self, patient_ids: &[String]) -> Result<FeatureMatrix> {
        let feature_names = self
            .feature_names
            .as_ref()
            .ok_or(PipelineError::NotFitted("LongitudinalFeatureAggregator"))?;

        let mut rows = Vec::with_capacity(patient_ids.len());
        let mut n_missing_files = 0usize;
        for id in patient_ids {
            match self.store.load(id)? {
                Some(series) => rows.push(self.patient_row(&series)),
                None => {
                    // Absent file degrades to an all-NaN row so downstream
                    // imputation can treat it uniformly.
                    n_missing_files += 1;
                    rows.push(vec![f64::NAN; feature_names.len()]);
                }
            }
        }
        if n_missing_files > 0 {
            warn!(
                "{} of {} patients had no longitudinal file; rows filled with NaN",
                n_missing_files,
                patient_ids.len()
            );
        }
        debug!(
            "Aggregated {} patients x {} features",
            rows.len(),
            feature_names.len()
        );

        Ok(FeatureMatrix {
            feature_names: feature_names.clone(),
            rows,
        })
    }

    fn patient_row(&self, series: &LongitudinalSeries) -> Vec<f64> {
        let stats = self.stat_names();
        let mut row = Vec::with_capacity(self.variables.len() * stats.len());
        for var in &self.variables {
            let obs = series.windowed(var, self.config.window);
            let s = variable_stats(&obs);
            for stat in &stats {
                row.push(match *stat {
                    "mean" => s.mean,
                    "std" => s.std,
                    "min" => s.min,
                    "max" => s.max,
                    "slope" => s.slope,
                    "auc" => s.auc,
                    "time_to_peak" => s.time_to_peak,
                    "count" => s.count,
                    "last" => s.last,
                    _ => unreachable!(),
                });
            }
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_series(dir: &std::path::Path, id: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(format!("{id}.csv"))).unwrap();
        write!(f, "{contents}").unwrap();
    }

    #[test]
    fn test_two_point_aggregation() {
        // Single variable X observed at day -15 and day 0, default
        // window [-15, 2].
        let dir = TempDir::new().unwrap();
        write_series(dir.path(), "1", "Day,X\n-15,1.0\n0,3.0\n");

        let mut agg = LongitudinalFeatureAggregator::new(AggregatorConfig::new(dir.path()));
        let ids = vec!["1".to_string()];
        let matrix = agg.fit(&ids).unwrap().transform(&ids).unwrap();

        let get = |name: &str| matrix.rows[0][matrix.column_index(name).unwrap()];
        assert_relative_eq!(get("X_mean"), 2.0);
        assert_relative_eq!(get("X_min"), 1.0);
        assert_relative_eq!(get("X_max"), 3.0);
        assert_relative_eq!(get("X_slope"), 2.0 / 15.0, epsilon = 1e-12);
        assert_relative_eq!(get("X_std"), 1.0);
        // Trapezoid over [-15, 0]: 15 * (1 + 3) / 2.
        assert_relative_eq!(get("X_auc"), 30.0);
    }

    #[test]
    fn test_window_excludes_out_of_range_days() {
        let dir = TempDir::new().unwrap();
        write_series(dir.path(), "1", "Day,X\n-20,99.0\n-15,1.0\n0,3.0\n10,99.0\n");

        let mut agg = LongitudinalFeatureAggregator::new(AggregatorConfig::new(dir.path()));
        let ids = vec!["1".to_string()];
        let matrix = agg.fit(&ids).unwrap().transform(&ids).unwrap();
        let mean = matrix.rows[0][matrix.column_index("X_mean").unwrap()];
        assert_relative_eq!(mean, 2.0);
    }

    #[test]
    fn test_missing_file_gives_nan_row() {
        let dir = TempDir::new().unwrap();
        write_series(dir.path(), "1", "Day,X,Y\n-1,1.0,2.0\n0,2.0,3.0\n");

        let mut agg = LongitudinalFeatureAggregator::new(AggregatorConfig::new(dir.path()));
        let fit_ids = vec!["1".to_string()];
        agg.fit(&fit_ids).unwrap();

        let matrix = agg
            .transform(&["1".to_string(), "ghost".to_string()])
            .unwrap();
        assert_eq!(matrix.n_rows(), 2);
        assert_eq!(matrix.rows[0].len(), matrix.rows[1].len());
        assert!(matrix.rows[1].iter().all(|v| v.is_nan()));
        assert!(matrix.rows[0].iter().any(|v| !v.is_nan()));
    }

    #[test]
    fn test_schema_stable_across_patients() {
        let dir = TempDir::new().unwrap();
        write_series(dir.path(), "1", "Day,X,Y\n-1,1.0,2.0\n0,2.0,3.0\n");
        // Patient 2 lacks Y and carries an extra variable Z.
        write_series(dir.path(), "2", "Day,X,Z\n-1,5.0,7.0\n1,6.0,8.0\n");

        let mut agg = LongitudinalFeatureAggregator::new(AggregatorConfig::new(dir.path()));
        let ids: Vec<String> = vec!["1".into(), "2".into()];
        let matrix = agg.fit(&ids).unwrap().transform(&ids).unwrap();

        // Schema comes from patient 1; Z is ignored, Y is NaN for patient 2.
        assert!(matrix.column_index("Z_mean").is_none());
        let y_mean = matrix.column_index("Y_mean").unwrap();
        assert!(matrix.rows[1][y_mean].is_nan());
        let x_mean = matrix.column_index("X_mean").unwrap();
        assert_relative_eq!(matrix.rows[1][x_mean], 5.5);
    }

    #[test]
    fn test_single_point_slope_and_auc_nan() {
        let obs = vec![(0, 4.0)];
        let s = variable_stats(&obs);
        assert_relative_eq!(s.mean, 4.0);
        assert_relative_eq!(s.std, 0.0);
        assert!(s.slope.is_nan());
        assert!(s.auc.is_nan());
    }

    #[test]
    fn test_same_day_observations_have_no_slope() {
        let obs = vec![(0, 4.0), (0, 6.0)];
        let s = variable_stats(&obs);
        assert!(s.slope.is_nan());
        assert!(s.auc.is_nan());
        assert_relative_eq!(s.mean, 5.0);
    }

    #[test]
    fn test_irregular_day_spacing_auc() {
        // Days -3, -1, 2: widths 2 and 3.
        let obs = vec![(-3, 1.0), (-1, 3.0), (2, 2.0)];
        let s = variable_stats(&obs);
        assert_relative_eq!(s.auc, 2.0 * (1.0 + 3.0) / 2.0 + 3.0 * (3.0 + 2.0) / 2.0);
    }

    #[test]
    fn test_extended_stats() {
        let dir = TempDir::new().unwrap();
        write_series(dir.path(), "1", "Day,X\n-3,1.0\n-1,9.0\n2,4.0\n");

        let mut agg = LongitudinalFeatureAggregator::new(
            AggregatorConfig::new(dir.path()).with_extended(true),
        );
        let ids = vec!["1".to_string()];
        let matrix = agg.fit(&ids).unwrap().transform(&ids).unwrap();

        let get = |name: &str| matrix.rows[0][matrix.column_index(name).unwrap()];
        assert_relative_eq!(get("X_time_to_peak"), -1.0);
        assert_relative_eq!(get("X_count"), 3.0);
        assert_relative_eq!(get("X_last"), 4.0);
    }

    #[test]
    fn test_fit_with_no_files_fails() {
        let dir = TempDir::new().unwrap();
        let mut agg = LongitudinalFeatureAggregator::new(AggregatorConfig::new(dir.path()));
        let result = agg.fit(&["a".to_string(), "b".to_string()]);
        assert!(matches!(result, Err(PipelineError::Data(_))));
    }

    #[test]
    fn test_transform_before_fit_fails() {
        let dir = TempDir::new().unwrap();
        let agg = LongitudinalFeatureAggregator::new(AggregatorConfig::new(dir.path()));
        assert!(matches!(
            agg.transform(&["a".to_string()]),
            Err(PipelineError::NotFitted(_))
        ));
    }

    #[test]
    fn test_refit_resets_schema() {
        let dir = TempDir::new().unwrap();
        write_series(dir.path(), "1", "Day,X\n0,1.0\n");
        write_series(dir.path(), "2", "Day,A,B\n0,1.0,2.0\n");

        let mut agg = LongitudinalFeatureAggregator::new(AggregatorConfig::new(dir.path()));
        agg.fit(&["1".to_string()]).unwrap();
        assert_eq!(agg.feature_names().unwrap().len(), BASE_STATS.len());

        agg.fit(&["2".to_string()]).unwrap();
        assert_eq!(agg.feature_names().unwrap().len(), 2 * BASE_STATS.len());
    }
}
