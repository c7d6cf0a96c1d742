pub mod loader;

use std::collections::HashMap;

use crate::error::{PipelineError, Result};

/// One cell of the static table.
///
/// Columns are duck-typed at load time: anything that parses as a float is
/// `Num`, empty/NA markers become `Missing`, everything else stays `Text`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Text(String),
    Missing,
}

impl Value {
    /// Numeric view of the cell. `Text` is re-parsed so a numeric column
    /// that arrived quoted still reads correctly.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Num(v) => Some(*v),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            Value::Missing => None,
        }
    }

    /// Categorical view of the cell.
    pub fn as_str(&self) -> Option<String> {
        match self {
            Value::Num(v) => Some(format!("{v}")),
            Value::Text(s) => Some(s.clone()),
            Value::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }
}

impl std::fmt::Display for Value {
    /// CSV rendering: missing cells become empty fields.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Num(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Missing => Ok(()),
        }
    }
}

/// Kind of a static covariate column. Validated eagerly when a
/// [`ColumnSchema`] is checked against a concrete table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Continuous; median-imputed and standardized.
    Numeric,
    /// Unordered categorical; most-frequent-imputed and one-hot encoded.
    Nominal,
    /// Ordered categorical; most-frequent-imputed and rank encoded.
    Ordinal,
}

/// Explicit typing of the static covariate columns.
///
/// Replaces the loosely-typed dict configs of the original scripts: every
/// column the pipeline touches is named once, under exactly one kind.
#[derive(Debug, Clone, Default)]
pub struct ColumnSchema {
    pub numeric: Vec<String>,
    pub nominal: Vec<String>,
    pub ordinal: Vec<String>,
}

impl ColumnSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_numeric<I, S>(mut self, cols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.numeric = cols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_nominal<I, S>(mut self, cols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nominal = cols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ordinal<I, S>(mut self, cols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ordinal = cols.into_iter().map(Into::into).collect();
        self
    }

    /// Iterate over every configured column with its kind.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ColumnKind)> {
        self.numeric
            .iter()
            .map(|c| (c.as_str(), ColumnKind::Numeric))
            .chain(self.nominal.iter().map(|c| (c.as_str(), ColumnKind::Nominal)))
            .chain(self.ordinal.iter().map(|c| (c.as_str(), ColumnKind::Ordinal)))
    }

    /// Fail fast if any configured column is absent from the table.
    pub fn validate(&self, table: &StaticTable) -> Result<()> {
        for (name, _) in self.iter() {
            if table.column_index(name).is_none() {
                return Err(PipelineError::schema(format!(
                    "configured column '{name}' is absent from the static table"
                )));
            }
        }
        Ok(())
    }
}

/// Closed day-offset interval bounding which observations of a
/// longitudinal series contribute to aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationWindow {
    pub start: i32,
    pub end: i32,
}

impl ObservationWindow {
    pub fn new(start: i32, end: i32) -> Result<Self> {
        if start > end {
            return Err(PipelineError::configuration(format!(
                "observation window start ({start}) must not exceed end ({end})"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, day: i32) -> bool {
        day >= self.start && day <= self.end
    }
}

impl Default for ObservationWindow {
    /// The pre-infusion-to-early-post-infusion window used for toxicity
    /// prediction.
    fn default() -> Self {
        Self { start: -15, end: 2 }
    }
}

/// Day-indexed measurement table owned by one patient.
///
/// `days` and each variable column have equal length; a `None` entry is a
/// measurement that was not taken that day.
#[derive(Debug, Clone)]
pub struct LongitudinalSeries {
    pub days: Vec<i32>,
    pub variables: Vec<String>,
    values: Vec<Vec<Option<f64>>>,
}

impl LongitudinalSeries {
    pub fn new(days: Vec<i32>, variables: Vec<String>, values: Vec<Vec<Option<f64>>>) -> Self {
        debug_assert_eq!(variables.len(), values.len());
        Self {
            days,
            variables,
            values,
        }
    }

    /// Column of one variable, aligned with `days`. `None` if the
    /// variable does not exist in this series.
    pub fn variable(&self, name: &str) -> Option<&[Option<f64>]> {
        self.variables
            .iter()
            .position(|v| v == name)
            .map(|i| self.values[i].as_slice())
    }

    /// `(day, value)` observations of one variable restricted to the
    /// window, missing entries dropped. Days outside the window are never
    /// read.
    pub fn windowed(&self, name: &str, window: ObservationWindow) -> Vec<(i32, f64)> {
        let Some(col) = self.variable(name) else {
            return Vec::new();
        };
        self.days
            .iter()
            .zip(col)
            .filter(|(day, _)| window.contains(**day))
            .filter_map(|(day, v)| v.map(|v| (*day, v)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

/// In-memory static table: one row per patient record, dense positional
/// index `0..n_rows-1` by construction.
#[derive(Debug, Clone, Default)]
pub struct StaticTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl StaticTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(PipelineError::data(format!(
                    "row {i} has {} cells, expected {}",
                    row.len(),
                    columns.len()
                )));
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Positional index of a column, or a schema error naming it.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name).ok_or_else(|| {
            PipelineError::schema(format!("static table is missing column '{name}'"))
        })
    }

    pub fn row(&self, pos: usize) -> &[Value] {
        &self.rows[pos]
    }

    pub fn cell(&self, pos: usize, col: usize) -> &Value {
        &self.rows[pos][col]
    }

    /// All values of one column, by name.
    pub fn column(&self, name: &str) -> Result<Vec<&Value>> {
        let idx = self.require_column(name)?;
        Ok(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Patient identifiers in row order, as strings.
    pub fn patient_ids(&self, patient_id_col: &str) -> Result<Vec<String>> {
        let idx = self.require_column(patient_id_col)?;
        self.rows
            .iter()
            .enumerate()
            .map(|(pos, row)| {
                row[idx].as_str().ok_or_else(|| {
                    PipelineError::data(format!("row {pos} has a missing patient id"))
                })
            })
            .collect()
    }

    /// New table containing the given rows, in the given order, with a
    /// freshly reset positional index.
    pub fn select_rows(&self, positions: &[usize]) -> StaticTable {
        StaticTable {
            columns: self.columns.clone(),
            rows: positions.iter().map(|&p| self.rows[p].clone()).collect(),
        }
    }

    /// New table without the named columns. Unknown names are ignored so
    /// a fitted dropper can be replayed against narrower frames.
    pub fn drop_columns(&self, names: &[String]) -> StaticTable {
        let keep: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !names.contains(c))
            .map(|(i, _)| i)
            .collect();
        StaticTable {
            columns: keep.iter().map(|&i| self.columns[i].clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| keep.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        }
    }

    /// Replace one cell. Used by the label binarizer.
    pub fn set_cell(&mut self, pos: usize, col: usize, value: Value) {
        self.rows[pos][col] = value;
    }

    /// Map each patient id to every row position it owns, preserving row
    /// order. Built once per partition and shared read-only across folds.
    pub fn patient_positions(&self, patient_id_col: &str) -> Result<HashMap<String, Vec<usize>>> {
        let ids = self.patient_ids(patient_id_col)?;
        let mut map: HashMap<String, Vec<usize>> = HashMap::new();
        for (pos, id) in ids.into_iter().enumerate() {
            map.entry(id).or_default().push(pos);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StaticTable {
        StaticTable::new(
            vec!["patient_id".into(), "age".into(), "label".into()],
            vec![
                vec![Value::Text("p1".into()), Value::Num(61.0), Value::Num(0.0)],
                vec![Value::Text("p2".into()), Value::Missing, Value::Num(1.0)],
                vec![Value::Text("p1".into()), Value::Num(61.0), Value::Num(0.0)],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_value_views() {
        assert_eq!(Value::Num(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::Text("3.5".into()).as_f64(), Some(3.5));
        assert_eq!(Value::Text("m".into()).as_f64(), None);
        assert_eq!(Value::Missing.as_f64(), None);
        assert_eq!(Value::Text("m".into()).as_str(), Some("m".into()));
    }

    #[test]
    fn test_require_column() {
        let t = table();
        assert_eq!(t.require_column("age").unwrap(), 1);
        assert!(matches!(
            t.require_column("sex"),
            Err(PipelineError::Schema(_))
        ));
    }

    #[test]
    fn test_select_rows_resets_positions() {
        let t = table();
        let s = t.select_rows(&[2, 0]);
        assert_eq!(s.n_rows(), 2);
        assert_eq!(s.cell(0, 0), &Value::Text("p1".into()));
        assert_eq!(s.cell(1, 0), &Value::Text("p1".into()));
    }

    #[test]
    fn test_patient_positions_multi_row() {
        let t = table();
        let map = t.patient_positions("patient_id").unwrap();
        assert_eq!(map["p1"], vec![0, 2]);
        assert_eq!(map["p2"], vec![1]);
    }

    #[test]
    fn test_drop_columns_ignores_unknown() {
        let t = table();
        let d = t.drop_columns(&["age".into(), "ghost".into()]);
        assert_eq!(d.columns(), &["patient_id".to_string(), "label".to_string()]);
    }

    #[test]
    fn test_window_contains() {
        let w = ObservationWindow::default();
        assert!(w.contains(-15));
        assert!(w.contains(2));
        assert!(!w.contains(3));
        assert!(ObservationWindow::new(3, 1).is_err());
    }

    #[test]
    fn test_series_windowed() {
        let s = LongitudinalSeries::new(
            vec![-20, -15, 0, 5],
            vec!["crp".into()],
            vec![vec![Some(9.0), Some(1.0), None, Some(4.0)]],
        );
        let w = ObservationWindow::default();
        assert_eq!(s.windowed("crp", w), vec![(-15, 1.0)]);
        assert!(s.windowed("il6", w).is_empty());
    }

    #[test]
    fn test_schema_validation() {
        let t = table();
        let ok = ColumnSchema::new().with_numeric(["age"]);
        assert!(ok.validate(&t).is_ok());
        let bad = ColumnSchema::new().with_nominal(["sex"]);
        assert!(matches!(bad.validate(&t), Err(PipelineError::Schema(_))));
    }
}
