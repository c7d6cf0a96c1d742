//! Patient-level stratified partitioning.
//!
//! Splitting happens at the patient granularity, never the row
//! granularity: all rows belonging to one patient land on the same side
//! of the split, so no patient can leak between train and test.

pub mod folds;

use std::collections::{BTreeSet, HashMap};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::data::StaticTable;
use crate::error::{PipelineError, Result};
use folds::{Fold, FoldConfig, GroupStratifiedFoldGenerator};

/// Partitioning configuration. Immutable once constructed; a fresh RNG is
/// derived from `seed` on every `split` call, so identical inputs always
/// reproduce identical partitions.
#[derive(Debug, Clone)]
pub struct SplitConfig {
    pub label_col: String,
    pub patient_id_col: String,
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            label_col: "label".to_string(),
            patient_id_col: "patient_id".to_string(),
            test_fraction: 0.3,
            seed: 42,
        }
    }
}

impl SplitConfig {
    pub fn with_test_fraction(mut self, test_fraction: f64) -> Self {
        self.test_fraction = test_fraction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_label_col(mut self, col: impl Into<String>) -> Self {
        self.label_col = col.into();
        self
    }

    pub fn with_patient_id_col(mut self, col: impl Into<String>) -> Self {
        self.patient_id_col = col.into();
        self
    }
}

/// Immutable result of one stratified split: disjoint patient id sets and
/// the materialized train/test tables, both with reset positional
/// indices.
#[derive(Debug, Clone)]
pub struct Partition {
    pub train: StaticTable,
    pub test: StaticTable,
    pub train_ids: BTreeSet<String>,
    pub test_ids: BTreeSet<String>,
}

/// One label per patient, in first-appearance order.
///
/// A patient appearing with two different label values is a data error:
/// the label is a patient-level attribute and must never be averaged or
/// silently resolved.
pub(crate) fn patient_labels(
    table: &StaticTable,
    patient_id_col: &str,
    label_col: &str,
) -> Result<Vec<(String, f64)>> {
    let label_idx = table.require_column(label_col)?;
    let ids = table.patient_ids(patient_id_col)?;

    let mut seen: HashMap<String, f64> = HashMap::new();
    let mut ordered = Vec::new();
    for (pos, id) in ids.into_iter().enumerate() {
        let label = table.cell(pos, label_idx).as_f64().ok_or_else(|| {
            PipelineError::data(format!("patient '{id}' has a missing or non-numeric label"))
        })?;
        match seen.get(&id) {
            None => {
                seen.insert(id.clone(), label);
                ordered.push((id, label));
            }
            Some(&prev) if prev != label => {
                return Err(PipelineError::data(format!(
                    "patient '{id}' appears with conflicting labels {prev} and {label}"
                )));
            }
            Some(_) => {}
        }
    }
    Ok(ordered)
}

/// Group patients by label class, preserving the given patient order
/// within each class. Classes come out sorted by label value so iteration
/// order is deterministic.
pub(crate) fn classes_by_label(patients: &[(String, f64)]) -> Vec<(f64, Vec<String>)> {
    let mut classes: Vec<(f64, Vec<String>)> = Vec::new();
    for (id, label) in patients {
        match classes.iter_mut().find(|(l, _)| l == label) {
            Some((_, members)) => members.push(id.clone()),
            None => classes.push((*label, vec![id.clone()])),
        }
    }
    classes.sort_by(|a, b| a.0.total_cmp(&b.0));
    classes
}

/// Patient-level stratified train/test splitter.
///
/// Equivalent in spirit to a stratified shuffle split run over one row
/// per patient: class proportions are preserved exactly at the patient
/// level up to integer rounding, and every row of a patient follows its
/// patient.
#[derive(Debug, Clone)]
pub struct StratifiedPartitioner {
    config: SplitConfig,
}

impl StratifiedPartitioner {
    pub fn new(config: SplitConfig) -> Result<Self> {
        if !(config.test_fraction > 0.0 && config.test_fraction < 1.0) {
            return Err(PipelineError::configuration(format!(
                "test_fraction must be in (0, 1), got {}",
                config.test_fraction
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }

    /// Split the table into disjoint train/test partitions.
    pub fn split(&self, table: &StaticTable) -> Result<Partition> {
        let cfg = &self.config;
        if table.is_empty() {
            return Err(PipelineError::data("cannot split an empty table"));
        }

        let patients = patient_labels(table, &cfg.patient_id_col, &cfg.label_col)?;
        let mut classes = classes_by_label(&patients);
        info!(
            "Stratified split: {} patients, {} label classes, test_fraction={}, seed={}",
            patients.len(),
            classes.len(),
            cfg.test_fraction,
            cfg.seed
        );

        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        for (_, members) in classes.iter_mut() {
            members.shuffle(&mut rng);
        }

        let test_counts = allocate_test_counts(&classes, cfg.test_fraction)?;

        let mut test_ids = BTreeSet::new();
        let mut train_ids = BTreeSet::new();
        for ((label, members), n_test) in classes.iter().zip(&test_counts) {
            debug!(
                "class {}: {} patients, {} to test",
                label,
                members.len(),
                n_test
            );
            for (i, id) in members.iter().enumerate() {
                if i < *n_test {
                    test_ids.insert(id.clone());
                } else {
                    train_ids.insert(id.clone());
                }
            }
        }

        let id_idx = table.require_column(&cfg.patient_id_col)?;
        let mut train_rows = Vec::new();
        let mut test_rows = Vec::new();
        for pos in 0..table.n_rows() {
            let id = table.cell(pos, id_idx).as_str().unwrap_or_default();
            if test_ids.contains(&id) {
                test_rows.push(pos);
            } else {
                train_rows.push(pos);
            }
        }

        let train = table.select_rows(&train_rows);
        let test = table.select_rows(&test_rows);
        info!(
            "Split complete: train={} rows ({} patients), test={} rows ({} patients)",
            train.n_rows(),
            train_ids.len(),
            test.n_rows(),
            test_ids.len()
        );

        Ok(Partition {
            train,
            test,
            train_ids,
            test_ids,
        })
    }
}

/// Per-class test-set sizes by largest-remainder allocation.
///
/// The grand total is pinned to `round(n * fraction)` so the overall test
/// share is exact up to rounding, then distributed so each class's share
/// tracks its quota. Every class must land at least one patient on each
/// side.
fn allocate_test_counts(classes: &[(f64, Vec<String>)], fraction: f64) -> Result<Vec<usize>> {
    let n_total: usize = classes.iter().map(|(_, m)| m.len()).sum();
    let target_total = ((n_total as f64) * fraction).round() as usize;

    let mut counts: Vec<usize> = Vec::with_capacity(classes.len());
    let mut remainders: Vec<(usize, f64)> = Vec::with_capacity(classes.len());
    for (i, (label, members)) in classes.iter().enumerate() {
        if members.len() < 2 {
            return Err(PipelineError::data(format!(
                "label class {} has only {} patient(s); cannot place one in both train and test",
                label,
                members.len()
            )));
        }
        let quota = members.len() as f64 * fraction;
        counts.push(quota.floor() as usize);
        remainders.push((i, quota - quota.floor()));
    }

    // Hand out the leftover seats to the largest fractional remainders;
    // ties go to the larger class so the allocation is deterministic.
    let assigned: usize = counts.iter().sum();
    let leftover = target_total.saturating_sub(assigned);
    remainders.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then_with(|| classes[b.0].1.len().cmp(&classes[a.0].1.len()))
            .then_with(|| a.0.cmp(&b.0))
    });
    for &(i, _) in remainders.iter().take(leftover) {
        counts[i] += 1;
    }

    // Both sides must see every class.
    for (count, (_, members)) in counts.iter_mut().zip(classes) {
        *count = (*count).clamp(1, members.len() - 1);
    }
    Ok(counts)
}

/// Convenience wrapper around [`StratifiedPartitioner::split`].
pub fn split(table: &StaticTable, config: SplitConfig) -> Result<(StaticTable, StaticTable)> {
    let partition = StratifiedPartitioner::new(config)?.split(table)?;
    Ok((partition.train, partition.test))
}

/// Main split plus K-fold cross-validation over the train partition.
///
/// Folds index into the returned train table positionally; the test
/// table never participates in fold generation.
pub fn split_with_cv(
    table: &StaticTable,
    split_config: SplitConfig,
    n_folds: usize,
) -> Result<(StaticTable, StaticTable, Vec<Fold>)> {
    let fold_config = FoldConfig {
        label_col: split_config.label_col.clone(),
        patient_id_col: split_config.patient_id_col.clone(),
        n_folds,
        seed: split_config.seed,
    };
    let partition = StratifiedPartitioner::new(split_config)?.split(table)?;
    let folds = GroupStratifiedFoldGenerator::new(fold_config)?.split(&partition.train)?;
    Ok((partition.train, partition.test, folds))
}
