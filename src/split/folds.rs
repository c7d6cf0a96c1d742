//! Group-stratified K-fold generation over the train partition.
//!
//! No standard primitive guarantees grouping (a patient never straddles a
//! fold boundary) and stratification (label balance across folds) at the
//! same time, so this is the usual approximation: shuffle patients once,
//! chunk each label class into K near-equal groups, and take the union of
//! the i-th chunks as fold i's validation set.

use std::collections::{BTreeSet, HashMap, HashSet};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use crate::data::StaticTable;
use crate::error::{PipelineError, Result};
use crate::split::{classes_by_label, patient_labels};

/// Fold generation configuration.
#[derive(Debug, Clone)]
pub struct FoldConfig {
    pub label_col: String,
    pub patient_id_col: String,
    pub n_folds: usize,
    pub seed: u64,
}

impl Default for FoldConfig {
    fn default() -> Self {
        Self {
            label_col: "label".to_string(),
            patient_id_col: "patient_id".to_string(),
            n_folds: 5,
            seed: 42,
        }
    }
}

impl FoldConfig {
    pub fn with_n_folds(mut self, n_folds: usize) -> Self {
        self.n_folds = n_folds;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// One train/validation split of the training rows, expressed as sorted
/// row-position arrays into the positionally reset train table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train_positions: Vec<usize>,
    pub val_positions: Vec<usize>,
}

/// Read-only arena mapping each patient id to every row position it owns
/// in one positionally reset table. Built once per partition and reused
/// across all folds derived from it.
#[derive(Debug, Clone)]
pub struct PatientIndex {
    positions: HashMap<String, Vec<usize>>,
    n_rows: usize,
}

impl PatientIndex {
    pub fn build(table: &StaticTable, patient_id_col: &str) -> Result<Self> {
        Ok(Self {
            positions: table.patient_positions(patient_id_col)?,
            n_rows: table.n_rows(),
        })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn positions(&self, patient_id: &str) -> Option<&[usize]> {
        self.positions.get(patient_id).map(Vec::as_slice)
    }

    /// Union of the row positions owned by the given patients, sorted.
    pub fn resolve<'a, I>(&self, patient_ids: I) -> Vec<usize>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut out: Vec<usize> = patient_ids
            .into_iter()
            .filter_map(|id| self.positions.get(id))
            .flatten()
            .copied()
            .collect();
        out.sort_unstable();
        out
    }
}

/// K-fold generator combining grouping and stratification at the patient
/// level.
#[derive(Debug, Clone)]
pub struct GroupStratifiedFoldGenerator {
    config: FoldConfig,
}

impl GroupStratifiedFoldGenerator {
    pub fn new(config: FoldConfig) -> Result<Self> {
        if config.n_folds < 2 {
            return Err(PipelineError::configuration(format!(
                "n_folds must be >= 2, got {}",
                config.n_folds
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &FoldConfig {
        &self.config
    }

    /// Produce `n_folds` (train, validation) position-array pairs over
    /// the given train table.
    pub fn split(&self, train: &StaticTable) -> Result<Vec<Fold>> {
        let cfg = &self.config;
        let patients = patient_labels(train, &cfg.patient_id_col, &cfg.label_col)?;
        if patients.is_empty() {
            return Err(PipelineError::data("cannot fold an empty train table"));
        }

        // Shuffle once so chunk boundaries are not driven by row order.
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let mut shuffled = patients;
        shuffled.shuffle(&mut rng);

        let classes = classes_by_label(&shuffled);
        for (label, members) in &classes {
            if members.len() < cfg.n_folds {
                return Err(PipelineError::data(format!(
                    "label class {} has {} patient(s), fewer than n_folds={}; some folds would \
                     have no validation example of this class",
                    label,
                    members.len(),
                    cfg.n_folds
                )));
            }
            if members.len() < cfg.n_folds * 2 {
                warn!(
                    "label class {} has only {} patients across {} folds; per-fold counts will be thin",
                    label,
                    members.len(),
                    cfg.n_folds
                );
            }
        }

        // Near-equal chunking: the first len % k chunks carry one extra.
        let chunked: Vec<Vec<&[String]>> = classes
            .iter()
            .map(|(_, members)| array_split(members, cfg.n_folds))
            .collect();

        let index = PatientIndex::build(train, &cfg.patient_id_col)?;
        let all_ids: Vec<String> = classes
            .iter()
            .flat_map(|(_, members)| members.iter().cloned())
            .collect();

        let mut folds = Vec::with_capacity(cfg.n_folds);
        for i in 0..cfg.n_folds {
            let val_ids: BTreeSet<String> = chunked
                .iter()
                .flat_map(|chunks| chunks[i].iter().cloned())
                .collect();
            let train_ids: Vec<String> = all_ids
                .iter()
                .filter(|id| !val_ids.contains(*id))
                .cloned()
                .collect();

            let fold = Fold {
                train_positions: index.resolve(train_ids.iter()),
                val_positions: index.resolve(val_ids.iter()),
            };
            info!(
                "Fold {}: train={} rows ({} patients), val={} rows ({} patients)",
                i + 1,
                fold.train_positions.len(),
                train_ids.len(),
                fold.val_positions.len(),
                val_ids.len()
            );
            folds.push(fold);
        }

        verify_folds(&folds, index.n_rows())?;
        Ok(folds)
    }
}

/// `numpy.array_split` semantics: `k` contiguous chunks whose lengths
/// differ by at most one.
fn array_split<T>(items: &[T], k: usize) -> Vec<&[T]> {
    let base = items.len() / k;
    let extra = items.len() % k;
    let mut chunks = Vec::with_capacity(k);
    let mut start = 0;
    for i in 0..k {
        let len = base + usize::from(i < extra);
        chunks.push(&items[start..start + len]);
        start += len;
    }
    chunks
}

/// Post-conditions of fold generation. A failure here is a generator bug,
/// not caller misuse.
fn verify_folds(folds: &[Fold], n_rows: usize) -> Result<()> {
    let mut seen_val: HashSet<usize> = HashSet::new();
    for (i, fold) in folds.iter().enumerate() {
        let train: HashSet<usize> = fold.train_positions.iter().copied().collect();
        let val: HashSet<usize> = fold.val_positions.iter().copied().collect();
        if !train.is_disjoint(&val) {
            return Err(PipelineError::invariant(format!(
                "fold {} has overlapping train/val positions",
                i + 1
            )));
        }
        if train.len() + val.len() != n_rows {
            return Err(PipelineError::invariant(format!(
                "fold {} covers {} rows, expected {}",
                i + 1,
                train.len() + val.len(),
                n_rows
            )));
        }
        for pos in &fold.val_positions {
            if !seen_val.insert(*pos) {
                return Err(PipelineError::invariant(format!(
                    "row position {pos} appears in more than one validation fold"
                )));
            }
        }
    }
    if seen_val.len() != n_rows {
        return Err(PipelineError::invariant(format!(
            "validation folds cover {} rows, expected {}",
            seen_val.len(),
            n_rows
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;
    use crate::split::tests::synthetic_table;
    use crate::split::{SplitConfig, StratifiedPartitioner};

    fn train_table() -> StaticTable {
        StratifiedPartitioner::new(SplitConfig::default())
            .unwrap()
            .split(&synthetic_table(15, 85))
            .unwrap()
            .train
    }

    #[test]
    fn test_fold_cover() {
        let train = train_table();
        let folds = GroupStratifiedFoldGenerator::new(FoldConfig::default())
            .unwrap()
            .split(&train)
            .unwrap();

        assert_eq!(folds.len(), 5);
        let mut all_val: Vec<usize> = Vec::new();
        for fold in &folds {
            assert_eq!(
                fold.train_positions.len() + fold.val_positions.len(),
                train.n_rows()
            );
            all_val.extend(&fold.val_positions);
        }
        all_val.sort_unstable();
        let expected: Vec<usize> = (0..train.n_rows()).collect();
        assert_eq!(all_val, expected);
    }

    #[test]
    fn test_per_fold_positive_counts() {
        // Train partition of the 15/85 scenario keeps 10-11 positives;
        // 5 folds of those give each validation fold 2 or 3 positives.
        let train = train_table();
        let folds = GroupStratifiedFoldGenerator::new(FoldConfig::default())
            .unwrap()
            .split(&train)
            .unwrap();

        let label_idx = train.require_column("label").unwrap();
        for fold in &folds {
            let pos = fold
                .val_positions
                .iter()
                .filter(|&&p| train.cell(p, label_idx).as_f64() == Some(1.0))
                .count();
            assert!((2..=3).contains(&pos), "validation positives {pos}");
        }
    }

    #[test]
    fn test_determinism() {
        let train = train_table();
        let generator = GroupStratifiedFoldGenerator::new(FoldConfig::default()).unwrap();
        assert_eq!(
            generator.split(&train).unwrap(),
            generator.split(&train).unwrap()
        );

        let other = GroupStratifiedFoldGenerator::new(FoldConfig::default().with_seed(7))
            .unwrap()
            .split(&train)
            .unwrap();
        assert_ne!(generator.split(&train).unwrap(), other);
    }

    #[test]
    fn test_class_smaller_than_n_folds_rejected() {
        let train = synthetic_table(3, 40);
        let result = GroupStratifiedFoldGenerator::new(FoldConfig::default())
            .unwrap()
            .split(&train);
        assert!(matches!(result, Err(PipelineError::Data(_))));
    }

    #[test]
    fn test_n_folds_too_small_rejected() {
        let result = GroupStratifiedFoldGenerator::new(FoldConfig::default().with_n_folds(1));
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_multi_row_patient_positions_resolve_together() {
        let mut rows = Vec::new();
        for i in 0..20 {
            let label = if i < 6 { 1.0 } else { 0.0 };
            for _ in 0..2 {
                rows.push(vec![Value::Text(format!("p{i}")), Value::Num(label)]);
            }
        }
        let train = StaticTable::new(vec!["patient_id".into(), "label".into()], rows).unwrap();

        let folds = GroupStratifiedFoldGenerator::new(FoldConfig::default().with_n_folds(3))
            .unwrap()
            .split(&train)
            .unwrap();

        let index = PatientIndex::build(&train, "patient_id").unwrap();
        for fold in &folds {
            let val: HashSet<usize> = fold.val_positions.iter().copied().collect();
            for i in 0..20 {
                let owned = index.positions(&format!("p{i}")).unwrap();
                let in_val = owned.iter().filter(|p| val.contains(p)).count();
                assert!(
                    in_val == 0 || in_val == owned.len(),
                    "patient p{i} straddles a fold boundary"
                );
            }
        }
    }

    #[test]
    fn test_array_split_near_equal() {
        let items: Vec<u32> = (0..13).collect();
        let chunks = array_split(&items, 5);
        let lens: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lens, vec![3, 3, 3, 2, 2]);
        assert_eq!(chunks.concat(), items);
    }
}
