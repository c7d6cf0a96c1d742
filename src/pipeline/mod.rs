//! Leakage-safe preprocessing pipeline.
//!
//! Composes constant-column removal, label binarization, columnwise
//! static encoding and longitudinal aggregation into one fit/transform
//! unit. Every fitted statistic (imputation medians, scaler moments,
//! category sets, the aggregation schema) derives exclusively from the
//! rows passed to `fit`; `transform` replays them unchanged on any row
//! set, including validation and test rows never seen during `fit`.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::data::{ColumnSchema, StaticTable, Value};
use crate::error::{PipelineError, Result};
use crate::features::{AggregatorConfig, FeatureMatrix, LongitudinalFeatureAggregator};

/// Drops static columns with at most one distinct non-missing value.
///
/// Identified on the training rows only; the same column list is then
/// removed from every frame the pipeline transforms, so train and
/// validation/test always share one feature set.
#[derive(Debug, Clone, Default)]
pub struct ConstantColumnDropper {
    constant_cols: Vec<String>,
}

impl ConstantColumnDropper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant_cols(&self) -> &[String] {
        &self.constant_cols
    }

    /// Identify constant columns, ignoring the named exempt columns
    /// (identifier and label columns are never feature candidates).
    pub fn fit(&mut self, table: &StaticTable, exempt: &[&str]) -> Result<&mut Self> {
        self.constant_cols.clear();
        for col in table.columns() {
            if exempt.contains(&col.as_str()) {
                continue;
            }
            let mut distinct: Vec<String> = Vec::new();
            for value in table.column(col)? {
                if let Some(s) = value.as_str() {
                    if !distinct.contains(&s) {
                        distinct.push(s);
                        if distinct.len() > 1 {
                            break;
                        }
                    }
                }
            }
            if distinct.len() <= 1 {
                self.constant_cols.push(col.clone());
            }
        }
        if !self.constant_cols.is_empty() {
            info!(
                "Dropping {} constant column(s): {:?}",
                self.constant_cols.len(),
                self.constant_cols
            );
        }
        Ok(self)
    }

    pub fn transform(&self, table: &StaticTable) -> StaticTable {
        table.drop_columns(&self.constant_cols)
    }
}

/// Binarizes ordinal outcome grades against per-column thresholds:
/// `grade <= threshold` becomes 0, `grade > threshold` becomes 1, and
/// missing grades stay missing.
#[derive(Debug, Clone)]
pub struct LabelBinarizer {
    thresholds: Vec<(String, f64)>,
}

impl LabelBinarizer {
    pub fn new(thresholds: Vec<(String, f64)>) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &[(String, f64)] {
        &self.thresholds
    }

    /// Validate that every configured grade column exists and is numeric
    /// where present.
    pub fn fit(&self, table: &StaticTable) -> Result<()> {
        for (col, threshold) in &self.thresholds {
            let idx = table.require_column(col)?;
            for pos in 0..table.n_rows() {
                let cell = table.cell(pos, idx);
                if !cell.is_missing() && cell.as_f64().is_none() {
                    return Err(PipelineError::schema(format!(
                        "label column '{col}' holds a non-numeric value at row {pos}"
                    )));
                }
            }
            debug!("Label '{}': grade <= {} -> 0, > {} -> 1", col, threshold, threshold);
        }
        Ok(())
    }

    /// Replace each configured grade column with its binarized form.
    pub fn transform(&self, table: &StaticTable) -> Result<StaticTable> {
        let mut out = table.clone();
        for (col, threshold) in &self.thresholds {
            let idx = out.require_column(col)?;
            for pos in 0..out.n_rows() {
                let binary = match out.cell(pos, idx).as_f64() {
                    Some(grade) if grade > *threshold => Value::Num(1.0),
                    Some(_) => Value::Num(0.0),
                    None => Value::Missing,
                };
                out.set_cell(pos, idx, binary);
            }
        }
        Ok(out)
    }

    /// Binarized values of one grade column; `None` where missing.
    pub fn binarize_column(&self, table: &StaticTable, col: &str) -> Result<Vec<Option<u8>>> {
        let threshold = self
            .thresholds
            .iter()
            .find(|(c, _)| c == col)
            .map(|(_, t)| *t)
            .ok_or_else(|| {
                PipelineError::configuration(format!("no threshold configured for label '{col}'"))
            })?;
        let idx = table.require_column(col)?;
        Ok((0..table.n_rows())
            .map(|pos| {
                table
                    .cell(pos, idx)
                    .as_f64()
                    .map(|grade| u8::from(grade > threshold))
            })
            .collect())
    }
}

/// Fitted state of one numeric column: train-only median for imputation,
/// train-only moments for standardization.
#[derive(Debug, Clone)]
struct NumericStats {
    median: f64,
    mean: f64,
    std: f64,
}

/// Fitted state of one categorical column.
#[derive(Debug, Clone)]
struct CategoryStats {
    most_frequent: String,
    /// Sorted for a deterministic encoding.
    categories: Vec<String>,
}

/// Columnwise static transformer: median-impute + standardize numerics,
/// most-frequent-impute + one-hot nominals, most-frequent-impute + rank
/// encode ordinals. All statistics come from the fit rows.
#[derive(Debug, Clone, Default)]
pub struct StaticEncoder {
    schema: ColumnSchema,
    numeric: HashMap<String, NumericStats>,
    nominal: HashMap<String, CategoryStats>,
    ordinal: HashMap<String, CategoryStats>,
    fitted: bool,
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn most_frequent(values: &[String]) -> Option<String> {
    let mut counts: HashMap<&String, usize> = HashMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    // Ties break toward the lexicographically smallest category.
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(v, _)| v.clone())
}

impl StaticEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fit all per-column statistics on the given rows. The schema is
    /// the effective one: constant columns have already been removed
    /// from it.
    pub fn fit(&mut self, table: &StaticTable, schema: ColumnSchema) -> Result<&mut Self> {
        self.numeric.clear();
        self.nominal.clear();
        self.ordinal.clear();
        schema.validate(table)?;

        for col in &schema.numeric {
            let mut present: Vec<f64> = table
                .column(col)?
                .iter()
                .filter_map(|v| v.as_f64())
                .collect();
            if present.is_empty() {
                return Err(PipelineError::data(format!(
                    "numeric column '{col}' has no observed training values to impute from"
                )));
            }
            present.sort_by(|a, b| a.total_cmp(b));
            let med = median(&present);

            // Scaler moments are computed over the imputed training
            // column, matching an impute-then-scale pipeline.
            let n = table.n_rows() as f64;
            let imputed: Vec<f64> = table
                .column(col)?
                .iter()
                .map(|v| v.as_f64().unwrap_or(med))
                .collect();
            let mean = imputed.iter().sum::<f64>() / n;
            let mut std = (imputed.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            if std < 1e-12 {
                std = 1.0;
            }
            self.numeric.insert(
                col.clone(),
                NumericStats {
                    median: med,
                    mean,
                    std,
                },
            );
        }

        for (cols, target) in [
            (&schema.nominal, &mut self.nominal),
            (&schema.ordinal, &mut self.ordinal),
        ] {
            for col in cols {
                let present: Vec<String> = table
                    .column(col)?
                    .iter()
                    .filter_map(|v| v.as_str())
                    .collect();
                let Some(mode) = most_frequent(&present) else {
                    return Err(PipelineError::data(format!(
                        "categorical column '{col}' has no observed training values to impute from"
                    )));
                };
                let mut categories: Vec<String> = present;
                categories.sort();
                categories.dedup();
                target.insert(
                    col.clone(),
                    CategoryStats {
                        most_frequent: mode,
                        categories,
                    },
                );
            }
        }

        self.schema = schema;
        self.fitted = true;
        Ok(self)
    }

    /// Encoded feature names, in schema order: scaled numerics, one-hot
    /// nominal indicators, ordinal ranks.
    pub fn feature_names(&self) -> Result<Vec<String>> {
        if !self.fitted {
            return Err(PipelineError::NotFitted("StaticEncoder"));
        }
        let mut names = self.schema.numeric.clone();
        for col in &self.schema.nominal {
            for cat in &self.nominal[col].categories {
                names.push(format!("{col}_{cat}"));
            }
        }
        names.extend(self.schema.ordinal.iter().cloned());
        Ok(names)
    }

    /// Encode any frame under the fitted statistics.
    pub fn transform(&self, table: &StaticTable) -> Result<FeatureMatrix> {
        if !self.fitted {
            return Err(PipelineError::NotFitted("StaticEncoder"));
        }
        self.schema.validate(table)?;

        let mut rows: Vec<Vec<f64>> = vec![Vec::new(); table.n_rows()];

        for col in &self.schema.numeric {
            let stats = &self.numeric[col];
            for (pos, value) in table.column(col)?.iter().enumerate() {
                let v = value.as_f64().unwrap_or(stats.median);
                rows[pos].push((v - stats.mean) / stats.std);
            }
        }

        for col in &self.schema.nominal {
            let stats = &self.nominal[col];
            for (pos, value) in table.column(col)?.iter().enumerate() {
                let category = value
                    .as_str()
                    .unwrap_or_else(|| stats.most_frequent.clone());
                for cat in &stats.categories {
                    // An unseen category one-hots to all zeros.
                    rows[pos].push(if *cat == category { 1.0 } else { 0.0 });
                }
            }
        }

        for col in &self.schema.ordinal {
            let stats = &self.ordinal[col];
            let fallback = stats
                .categories
                .iter()
                .position(|c| *c == stats.most_frequent)
                .unwrap_or(0);
            for (pos, value) in table.column(col)?.iter().enumerate() {
                let category = value
                    .as_str()
                    .unwrap_or_else(|| stats.most_frequent.clone());
                let rank = stats
                    .categories
                    .iter()
                    .position(|c| *c == category)
                    .unwrap_or(fallback);
                rows[pos].push(rank as f64);
            }
        }

        Ok(FeatureMatrix {
            feature_names: self.feature_names()?,
            rows,
        })
    }
}

/// Pipeline configuration: which columns carry identity, outcome grades
/// and covariates, and how to aggregate the longitudinal series.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub patient_id_col: String,
    /// `(grade column, threshold)` pairs; the first entry is the primary
    /// outcome exposed by [`LeakageSafePreprocessingPipeline::labels`].
    pub label_thresholds: Vec<(String, f64)>,
    pub schema: ColumnSchema,
    pub aggregator: Option<AggregatorConfig>,
}

impl PipelineConfig {
    pub fn new(
        patient_id_col: impl Into<String>,
        label_col: impl Into<String>,
        threshold: f64,
        schema: ColumnSchema,
    ) -> Self {
        Self {
            patient_id_col: patient_id_col.into(),
            label_thresholds: vec![(label_col.into(), threshold)],
            schema,
            aggregator: None,
        }
    }

    pub fn with_aggregator(mut self, config: AggregatorConfig) -> Self {
        self.aggregator = Some(config);
        self
    }

    pub fn with_label_threshold(mut self, col: impl Into<String>, threshold: f64) -> Self {
        self.label_thresholds.push((col.into(), threshold));
        self
    }

    fn primary_label(&self) -> &str {
        &self.label_thresholds[0].0
    }
}

/// The composed fit/transform unit fed to the downstream classifier.
///
/// Refitting fully resets every fitted statistic, so one instance can be
/// refit per CV fold. Pipelines must never be shared across folds that
/// are trained concurrently.
#[derive(Debug, Clone)]
pub struct LeakageSafePreprocessingPipeline {
    config: PipelineConfig,
    dropper: ConstantColumnDropper,
    binarizer: LabelBinarizer,
    encoder: StaticEncoder,
    aggregator: Option<LongitudinalFeatureAggregator>,
    fitted: bool,
}

impl LeakageSafePreprocessingPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let binarizer = LabelBinarizer::new(config.label_thresholds.clone());
        let aggregator = config
            .aggregator
            .clone()
            .map(LongitudinalFeatureAggregator::new);
        Self {
            config,
            dropper: ConstantColumnDropper::new(),
            binarizer,
            encoder: StaticEncoder::new(),
            aggregator,
            fitted: false,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Fit every stage on the given training rows only.
    pub fn fit(&mut self, train: &StaticTable) -> Result<&mut Self> {
        self.fitted = false;

        // Structural validation happens before any statistic is touched.
        train.require_column(&self.config.patient_id_col)?;
        self.config.schema.validate(train)?;
        self.binarizer.fit(train)?;

        let mut exempt: Vec<&str> = vec![&self.config.patient_id_col];
        exempt.extend(self.config.label_thresholds.iter().map(|(c, _)| c.as_str()));
        self.dropper.fit(train, &exempt)?;

        // Constant columns leave the effective schema entirely.
        let dropped = self.dropper.constant_cols();
        let keep = |cols: &[String]| -> Vec<String> {
            cols.iter()
                .filter(|c| !dropped.contains(c))
                .cloned()
                .collect()
        };
        let effective = ColumnSchema {
            numeric: keep(&self.config.schema.numeric),
            nominal: keep(&self.config.schema.nominal),
            ordinal: keep(&self.config.schema.ordinal),
        };
        self.encoder.fit(train, effective)?;

        if let Some(agg) = self.aggregator.as_mut() {
            let ids = train.patient_ids(&self.config.patient_id_col)?;
            agg.fit(&ids)?;
        }

        self.fitted = true;
        info!(
            "Pipeline fitted on {} rows; {} static features{}",
            train.n_rows(),
            self.encoder.feature_names()?.len(),
            self.aggregator
                .as_ref()
                .and_then(|a| a.feature_names())
                .map(|f| format!(" + {} dynamic features", f.len()))
                .unwrap_or_default()
        );
        Ok(self)
    }

    /// Apply every fitted stage to any row set.
    pub fn transform(&self, table: &StaticTable) -> Result<FeatureMatrix> {
        if !self.fitted {
            return Err(PipelineError::NotFitted("LeakageSafePreprocessingPipeline"));
        }

        let narrowed = self.dropper.transform(table);
        let matrix = self.encoder.transform(&narrowed)?;

        match &self.aggregator {
            Some(agg) => {
                let ids = table.patient_ids(&self.config.patient_id_col)?;
                matrix.hstack(agg.transform(&ids)?)
            }
            None => Ok(matrix),
        }
    }

    pub fn fit_transform(&mut self, train: &StaticTable) -> Result<FeatureMatrix> {
        self.fit(train)?;
        self.transform(train)
    }

    /// Binarized primary outcome for the given rows; `None` where the
    /// grade is missing.
    pub fn labels(&self, table: &StaticTable) -> Result<Vec<Option<u8>>> {
        self.binarizer
            .binarize_column(table, self.config.primary_label())
    }

    /// Full feature schema of the transformed matrix.
    pub fn feature_names(&self) -> Result<Vec<String>> {
        let mut names = self.encoder.feature_names()?;
        if let Some(agg) = &self.aggregator {
            let dynamic = agg
                .feature_names()
                .ok_or(PipelineError::NotFitted("LongitudinalFeatureAggregator"))?;
            names.extend(dynamic.iter().cloned());
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;
    use tempfile::TempDir;

    fn table() -> StaticTable {
        StaticTable::new(
            vec![
                "patient_id".into(),
                "disease".into(),
                "age".into(),
                "sex".into(),
                "ecog".into(),
                "crs_grade".into(),
            ],
            vec![
                vec![
                    Value::Text("p0".into()),
                    Value::Text("B-NHL".into()),
                    Value::Num(50.0),
                    Value::Text("F".into()),
                    Value::Text("0".into()),
                    Value::Num(1.0),
                ],
                vec![
                    Value::Text("p1".into()),
                    Value::Text("B-NHL".into()),
                    Value::Num(60.0),
                    Value::Text("M".into()),
                    Value::Text("1".into()),
                    Value::Num(3.0),
                ],
                vec![
                    Value::Text("p2".into()),
                    Value::Text("B-NHL".into()),
                    Value::Missing,
                    Value::Missing,
                    Value::Text("1".into()),
                    Value::Num(0.0),
                ],
                vec![
                    Value::Text("p3".into()),
                    Value::Text("B-NHL".into()),
                    Value::Num(70.0),
                    Value::Text("M".into()),
                    Value::Text("2".into()),
                    Value::Missing,
                ],
            ],
        )
        .unwrap()
    }

    fn schema() -> ColumnSchema {
        ColumnSchema::new()
            .with_numeric(["age"])
            .with_nominal(["sex", "disease"])
            .with_ordinal(["ecog"])
    }

    fn config() -> PipelineConfig {
        PipelineConfig::new("patient_id", "crs_grade", 2.0, schema())
    }

    #[test]
    fn test_constant_column_dropped() {
        let mut pipeline = LeakageSafePreprocessingPipeline::new(config());
        pipeline.fit(&table()).unwrap();
        // disease is constant after cohort filtering and must vanish.
        assert_eq!(pipeline.dropper.constant_cols(), &["disease".to_string()]);
        let names = pipeline.feature_names().unwrap();
        assert!(!names.iter().any(|n| n.starts_with("disease")));
    }

    #[test]
    fn test_label_binarization() {
        let pipeline = {
            let mut p = LeakageSafePreprocessingPipeline::new(config());
            p.fit(&table()).unwrap();
            p
        };
        let labels = pipeline.labels(&table()).unwrap();
        // Grades 1, 3, 0, missing with threshold 2.
        assert_eq!(labels, vec![Some(0), Some(1), Some(0), None]);
    }

    #[test]
    fn test_binarizer_transform_in_place() {
        let binarizer = LabelBinarizer::new(vec![("crs_grade".into(), 2.0)]);
        let out = binarizer.transform(&table()).unwrap();
        let idx = out.require_column("crs_grade").unwrap();
        assert_eq!(out.cell(0, idx), &Value::Num(0.0));
        assert_eq!(out.cell(1, idx), &Value::Num(1.0));
        assert_eq!(out.cell(3, idx), &Value::Missing);
    }

    #[test]
    fn test_numeric_impute_and_scale() {
        let mut encoder = StaticEncoder::new();
        encoder
            .fit(&table(), ColumnSchema::new().with_numeric(["age"]))
            .unwrap();
        let matrix = encoder.transform(&table()).unwrap();

        // Train ages 50, 60, 70 -> median 60; imputed column
        // [50, 60, 60, 70] -> mean 60, population std sqrt(50).
        let std = 50.0f64.sqrt();
        assert_relative_eq!(matrix.rows[0][0], (50.0 - 60.0) / std, epsilon = 1e-12);
        assert_relative_eq!(matrix.rows[2][0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(matrix.rows[3][0], (70.0 - 60.0) / std, epsilon = 1e-12);
    }

    #[test]
    fn test_one_hot_and_unknown_category() {
        let mut encoder = StaticEncoder::new();
        encoder
            .fit(&table(), ColumnSchema::new().with_nominal(["sex"]))
            .unwrap();
        let names = encoder.feature_names().unwrap();
        assert_eq!(names, vec!["sex_F".to_string(), "sex_M".to_string()]);

        // Missing sex imputes to the most frequent (M).
        let matrix = encoder.transform(&table()).unwrap();
        assert_eq!(matrix.rows[2], vec![0.0, 1.0]);

        // An unseen category encodes to all zeros.
        let unseen = StaticTable::new(
            vec!["sex".into()],
            vec![vec![Value::Text("X".into())]],
        )
        .unwrap();
        let matrix = encoder.transform(&unseen).unwrap();
        assert_eq!(matrix.rows[0], vec![0.0, 0.0]);
    }

    #[test]
    fn test_ordinal_ranks() {
        let mut encoder = StaticEncoder::new();
        encoder
            .fit(&table(), ColumnSchema::new().with_ordinal(["ecog"]))
            .unwrap();
        let matrix = encoder.transform(&table()).unwrap();
        // Categories sort to ["0", "1", "2"].
        assert_eq!(matrix.rows[0], vec![0.0]);
        assert_eq!(matrix.rows[1], vec![1.0]);
        assert_eq!(matrix.rows[3], vec![2.0]);
    }

    #[test]
    fn test_missing_configured_column_is_schema_error() {
        let bad = PipelineConfig::new(
            "patient_id",
            "crs_grade",
            2.0,
            ColumnSchema::new().with_numeric(["ldh"]),
        );
        let mut pipeline = LeakageSafePreprocessingPipeline::new(bad);
        assert!(matches!(
            pipeline.fit(&table()),
            Err(PipelineError::Schema(_))
        ));
    }

    #[test]
    fn test_transform_before_fit_fails() {
        let pipeline = LeakageSafePreprocessingPipeline::new(config());
        assert!(matches!(
            pipeline.transform(&table()),
            Err(PipelineError::NotFitted(_))
        ));
    }

    #[test]
    fn test_no_leakage_from_validation_rows() {
        // Fitted statistics must be a function of the training rows
        // alone: perturbing the other rows cannot move the encoding of
        // a fixed train row.
        let full = table();
        let train = full.select_rows(&[0, 1]);

        let mut pipeline = LeakageSafePreprocessingPipeline::new(config());
        pipeline.fit(&train).unwrap();
        let before = pipeline.transform(&train).unwrap();

        let mut perturbed = full.clone();
        let age_idx = perturbed.require_column("age").unwrap();
        perturbed.set_cell(2, age_idx, Value::Num(9999.0));
        perturbed.set_cell(3, age_idx, Value::Num(-9999.0));
        let perturbed_train = perturbed.select_rows(&[0, 1]);

        let mut refit = LeakageSafePreprocessingPipeline::new(config());
        refit.fit(&perturbed_train).unwrap();
        let after = refit.transform(&perturbed_train).unwrap();

        assert_eq!(before.feature_names, after.feature_names);
        for (a, b) in before.rows.iter().flatten().zip(after.rows.iter().flatten()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_refit_is_independent() {
        let full = table();
        let mut pipeline = LeakageSafePreprocessingPipeline::new(config());

        pipeline.fit(&full.select_rows(&[0, 1])).unwrap();
        let first = pipeline.encoder.numeric["age"].median;

        pipeline.fit(&full.select_rows(&[1, 3])).unwrap();
        let second = pipeline.encoder.numeric["age"].median;

        assert_relative_eq!(first, 55.0);
        assert_relative_eq!(second, 65.0);
    }

    #[test]
    fn test_pipeline_with_aggregator() {
        let dir = TempDir::new().unwrap();
        for (id, day0) in [("p0", 1.0), ("p1", 2.0), ("p2", 3.0)] {
            let mut f = std::fs::File::create(dir.path().join(format!("{id}.csv"))).unwrap();
            writeln!(f, "Day,crp").unwrap();
            writeln!(f, "-1,{day0}").unwrap();
            writeln!(f, "1,{}", day0 * 2.0).unwrap();
        }

        let cfg = config().with_aggregator(AggregatorConfig::new(dir.path()));
        let mut pipeline = LeakageSafePreprocessingPipeline::new(cfg);
        let full = table();
        let matrix = pipeline.fit_transform(&full).unwrap();

        let names = pipeline.feature_names().unwrap();
        assert!(names.contains(&"crp_mean".to_string()));
        assert_eq!(matrix.n_features(), names.len());

        // p3 has no file: its dynamic block is NaN, its static block is not.
        let crp_mean = matrix.column_index("crp_mean").unwrap();
        assert!(matrix.rows[3][crp_mean].is_nan());
        assert!(!matrix.rows[3][0].is_nan());
        assert_relative_eq!(matrix.rows[0][crp_mean], 1.5);
    }
}
