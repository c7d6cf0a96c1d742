use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cartox::cli::{parse_args, setup_logging, AggregateArgs, Commands, PrepareArgs, SplitArgs};
use cartox::data::loader::{SeriesStore, StaticTableLoader};
use cartox::data::{ColumnSchema, ObservationWindow, StaticTable, Value};
use cartox::features::{AggregatorConfig, FeatureMatrix, LongitudinalFeatureAggregator};
use cartox::pipeline::{LabelBinarizer, LeakageSafePreprocessingPipeline, PipelineConfig};
use cartox::split::folds::{FoldConfig, GroupStratifiedFoldGenerator};
use cartox::split::{SplitConfig, StratifiedPartitioner};
use serde::Serialize;
use tracing::{error, info, warn};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", cartox::info());

    let result = match cli.command {
        Commands::Split(args) => run_split(args),
        Commands::Aggregate(args) => run_aggregate(args),
        Commands::Prepare(args) => run_prepare(args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Provenance document written next to the split artifacts.
#[derive(Debug, Serialize)]
struct SplitMetadata {
    input: PathBuf,
    label_col: String,
    patient_id_col: String,
    label_threshold: Option<f64>,
    test_fraction: f64,
    n_folds: usize,
    seed: u64,
    n_train_patients: usize,
    n_test_patients: usize,
}

/// Feature schema document written next to the prepared matrices.
#[derive(Debug, Serialize)]
struct PrepareMetadata {
    train: PathBuf,
    label_col: String,
    label_threshold: f64,
    window: [i32; 2],
    extended: bool,
    feature_names: Vec<String>,
}

fn run_split(args: SplitArgs) -> Result<()> {
    info!("Starting split...");
    info!("Input file: {:?}", args.input);
    info!("Output directory: {:?}", args.output);

    cartox::utils::ensure_dir(&args.output)?;

    let mut table = StaticTableLoader::load(&args.input)
        .with_context(|| format!("Failed to load static table from {:?}", args.input))?;

    if let Some(threshold) = args.label_threshold {
        info!(
            "Binarizing '{}' at grade threshold {}",
            args.label_col, threshold
        );
        let binarizer = LabelBinarizer::new(vec![(args.label_col.clone(), threshold)]);
        binarizer.fit(&table)?;
        table = binarizer.transform(&table)?;
    }

    let split_config = SplitConfig {
        label_col: args.label_col.clone(),
        patient_id_col: args.patient_id_col.clone(),
        test_fraction: args.test_fraction,
        seed: args.seed,
    };
    let partition = StratifiedPartitioner::new(split_config)?
        .split(&table)
        .context("Stratified split failed")?;

    let fold_config = FoldConfig {
        label_col: args.label_col.clone(),
        patient_id_col: args.patient_id_col.clone(),
        n_folds: args.n_folds,
        seed: args.seed,
    };
    let folds = GroupStratifiedFoldGenerator::new(fold_config)?
        .split(&partition.train)
        .context("Fold generation failed")?;

    StaticTableLoader::save(&partition.train, args.output.join("train_static.csv"))?;
    StaticTableLoader::save(&partition.test, args.output.join("test_static.csv"))?;
    cartox::utils::write_lines(args.output.join("train_ids.txt"), &partition.train_ids)?;
    cartox::utils::write_lines(args.output.join("test_ids.txt"), &partition.test_ids)?;

    let fold_dir = args.output.join("fold_splits");
    cartox::utils::ensure_dir(&fold_dir)?;
    let train_row_ids = partition.train.patient_ids(&args.patient_id_col)?;
    for (i, fold) in folds.iter().enumerate() {
        let ids_at = |positions: &[usize]| -> Vec<String> {
            let mut seen = std::collections::HashSet::new();
            positions
                .iter()
                .map(|&p| train_row_ids[p].clone())
                .filter(|id| seen.insert(id.clone()))
                .collect()
        };
        cartox::utils::write_lines(
            fold_dir.join(format!("fold{}_train_ids.txt", i + 1)),
            ids_at(&fold.train_positions),
        )?;
        cartox::utils::write_lines(
            fold_dir.join(format!("fold{}_val_ids.txt", i + 1)),
            ids_at(&fold.val_positions),
        )?;
    }

    let metadata = SplitMetadata {
        input: args.input.clone(),
        label_col: args.label_col.clone(),
        patient_id_col: args.patient_id_col.clone(),
        label_threshold: args.label_threshold,
        test_fraction: args.test_fraction,
        n_folds: args.n_folds,
        seed: args.seed,
        n_train_patients: partition.train_ids.len(),
        n_test_patients: partition.test_ids.len(),
    };
    std::fs::write(
        args.output.join("metadata.json"),
        serde_json::to_string_pretty(&metadata)?,
    )?;

    if let Some(ref dynamic_dir) = args.dynamic_dir {
        copy_dynamic_files(dynamic_dir, &partition.train_ids, &args.output.join("train_dynamic"))?;
        copy_dynamic_files(dynamic_dir, &partition.test_ids, &args.output.join("test_dynamic"))?;
    }

    info!(
        "Split complete: {} train / {} test patients, {} folds",
        partition.train_ids.len(),
        partition.test_ids.len(),
        folds.len()
    );

    Ok(())
}

/// Copy each patient's longitudinal file into a per-partition directory.
/// Patients without a file are skipped; partial coverage is expected.
fn copy_dynamic_files<'a, I>(dynamic_dir: &Path, ids: I, dest: &Path) -> Result<()>
where
    I: IntoIterator<Item = &'a String>,
{
    cartox::utils::ensure_dir(dest)?;
    let store = SeriesStore::new(dynamic_dir);
    let mut copied = 0usize;
    let mut missing = 0usize;
    for id in ids {
        let src = store.path_for(id);
        if cartox::utils::file_exists(&src) {
            std::fs::copy(&src, dest.join(format!("{id}.csv")))
                .with_context(|| format!("Failed to copy {:?}", src))?;
            copied += 1;
        } else {
            missing += 1;
        }
    }
    if missing > 0 {
        warn!(
            "{} patient(s) had no longitudinal file under {:?}",
            missing, dynamic_dir
        );
    }
    info!("Copied {} longitudinal file(s) to {:?}", copied, dest);
    Ok(())
}

fn run_aggregate(args: AggregateArgs) -> Result<()> {
    info!("Starting aggregation...");
    info!("Input file: {:?}", args.input);
    info!("Dynamic directory: {:?}", args.dynamic_dir);

    let table = StaticTableLoader::load(&args.input)
        .with_context(|| format!("Failed to load static table from {:?}", args.input))?;
    let ids = table.patient_ids(&args.patient_id_col)?;

    let window = ObservationWindow::new(args.window_start, args.window_end)?;
    let config = AggregatorConfig::new(&args.dynamic_dir)
        .with_window(window)
        .with_extended(args.extended);

    let mut aggregator = LongitudinalFeatureAggregator::new(config);
    aggregator.fit(&ids).context("Aggregation schema discovery failed")?;
    let matrix = aggregator.transform(&ids)?;

    // Joined output: patient id, s_-prefixed static covariates, then the
    // aggregated dynamic features.
    let mut columns = vec![args.patient_id_col.clone()];
    let static_cols: Vec<String> = table
        .columns()
        .iter()
        .filter(|c| **c != args.patient_id_col)
        .cloned()
        .collect();
    columns.extend(static_cols.iter().map(|c| format!("s_{c}")));
    columns.extend(matrix.feature_names.iter().cloned());

    let mut rows = Vec::with_capacity(table.n_rows());
    for pos in 0..table.n_rows() {
        let mut row = vec![Value::Text(ids[pos].clone())];
        for col in &static_cols {
            let idx = table.require_column(col)?;
            row.push(table.cell(pos, idx).clone());
        }
        row.extend(matrix.rows[pos].iter().map(|&v| {
            if v.is_nan() {
                Value::Missing
            } else {
                Value::Num(v)
            }
        }));
        rows.push(row);
    }

    let joined = StaticTable::new(columns, rows)?;
    StaticTableLoader::save(&joined, &args.output)?;

    info!(
        "Aggregation complete: {} patients x {} dynamic features -> {:?}",
        matrix.n_rows(),
        matrix.n_features(),
        args.output
    );

    Ok(())
}

fn run_prepare(args: PrepareArgs) -> Result<()> {
    info!("Starting preparation...");
    info!("Training table: {:?}", args.train);
    info!("Output directory: {:?}", args.output);

    cartox::utils::ensure_dir(&args.output)?;

    let train = StaticTableLoader::load(&args.train)
        .with_context(|| format!("Failed to load training table from {:?}", args.train))?;

    let schema = ColumnSchema::new()
        .with_numeric(args.numeric.clone())
        .with_nominal(args.nominal.clone())
        .with_ordinal(args.ordinal.clone());

    let mut config = PipelineConfig::new(
        args.patient_id_col.clone(),
        args.label_col.clone(),
        args.label_threshold,
        schema,
    );
    if let Some(ref dynamic_dir) = args.dynamic_dir {
        let window = ObservationWindow::new(args.window_start, args.window_end)?;
        config = config.with_aggregator(
            AggregatorConfig::new(dynamic_dir)
                .with_window(window)
                .with_extended(args.extended),
        );
    }

    let mut pipeline = LeakageSafePreprocessingPipeline::new(config);
    let train_matrix = pipeline
        .fit_transform(&train)
        .context("Pipeline fitting failed")?;
    write_prepared(&args, &train, &pipeline, &train_matrix, "train")?;

    if let Some(ref apply_path) = args.apply {
        let held_out = StaticTableLoader::load(apply_path)
            .with_context(|| format!("Failed to load held-out table from {:?}", apply_path))?;
        let matrix = pipeline
            .transform(&held_out)
            .context("Pipeline transform of held-out table failed")?;
        write_prepared(&args, &held_out, &pipeline, &matrix, "test")?;
    }

    let metadata = PrepareMetadata {
        train: args.train.clone(),
        label_col: args.label_col.clone(),
        label_threshold: args.label_threshold,
        window: [args.window_start, args.window_end],
        extended: args.extended,
        feature_names: pipeline.feature_names()?,
    };
    std::fs::write(
        args.output.join("metadata.json"),
        serde_json::to_string_pretty(&metadata)?,
    )?;

    info!("Preparation complete: {} features", train_matrix.n_features());

    Ok(())
}

/// Write one partition's feature matrix and binarized labels.
fn write_prepared(
    args: &PrepareArgs,
    table: &StaticTable,
    pipeline: &LeakageSafePreprocessingPipeline,
    matrix: &FeatureMatrix,
    stem: &str,
) -> Result<()> {
    let ids = table.patient_ids(&args.patient_id_col)?;

    let mut columns = vec![args.patient_id_col.clone()];
    columns.extend(matrix.feature_names.iter().cloned());
    let rows: Vec<Vec<Value>> = matrix
        .rows
        .iter()
        .zip(&ids)
        .map(|(row, id)| {
            let mut out = vec![Value::Text(id.clone())];
            out.extend(row.iter().map(|&v| {
                if v.is_nan() {
                    Value::Missing
                } else {
                    Value::Num(v)
                }
            }));
            out
        })
        .collect();
    let features = StaticTable::new(columns, rows)?;
    StaticTableLoader::save(&features, args.output.join(format!("{stem}_features.csv")))?;

    let labels = pipeline.labels(table)?;
    let label_rows: Vec<Vec<Value>> = labels
        .iter()
        .zip(&ids)
        .map(|(label, id)| {
            vec![
                Value::Text(id.clone()),
                match label {
                    Some(v) => Value::Num(f64::from(*v)),
                    None => Value::Missing,
                },
            ]
        })
        .collect();
    let label_table = StaticTable::new(
        vec![args.patient_id_col.clone(), args.label_col.clone()],
        label_rows,
    )?;
    StaticTableLoader::save(&label_table, args.output.join(format!("{stem}_labels.csv")))?;

    Ok(())
}
