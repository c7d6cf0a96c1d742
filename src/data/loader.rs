use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use crate::data::{LongitudinalSeries, StaticTable, Value};
use crate::error::{PipelineError, Result};

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    Csv,
    Tsv,
    GzippedCsv,
    GzippedTsv,
}

impl FileFormat {
    /// Detect file format from path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str());
        let stem = path.file_stem().and_then(|s| s.to_str());

        match (ext, stem) {
            (Some("gz"), Some(stem)) => {
                if stem.ends_with(".csv") {
                    Ok(FileFormat::GzippedCsv)
                } else if stem.ends_with(".tsv") || stem.ends_with(".txt") {
                    Ok(FileFormat::GzippedTsv)
                } else {
                    Err(PipelineError::configuration(format!(
                        "cannot determine format of gzipped file {path:?}"
                    )))
                }
            }
            (Some("csv"), _) => Ok(FileFormat::Csv),
            (Some("tsv"), _) | (Some("txt"), _) => Ok(FileFormat::Tsv),
            _ => Err(PipelineError::configuration(format!(
                "unsupported file format: {path:?}"
            ))),
        }
    }

    /// Get delimiter character
    pub fn delimiter(&self) -> u8 {
        match self {
            FileFormat::Csv | FileFormat::GzippedCsv => b',',
            FileFormat::Tsv | FileFormat::GzippedTsv => b'\t',
        }
    }

    /// Check if format is gzipped
    pub fn is_gzipped(&self) -> bool {
        matches!(self, FileFormat::GzippedCsv | FileFormat::GzippedTsv)
    }
}

/// Cell markers treated as missing, matching the encoders upstream.
const NA_MARKERS: &[&str] = &["", "NA", "N/A", "NaN", "nan", "null", "None"];

fn parse_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if NA_MARKERS.contains(&trimmed) {
        return Value::Missing;
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.is_finite() => Value::Num(v),
        _ => Value::Text(trimmed.to_string()),
    }
}

/// Loader for the static patient table (one row per patient record).
pub struct StaticTableLoader;

impl StaticTableLoader {
    /// Load a static table from a CSV/TSV file, gzipped or plain.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<StaticTable> {
        let path = path.as_ref();
        info!("Loading static table from {:?}", path);

        let format = FileFormat::from_path(path)?;
        debug!("Detected file format: {:?}", format);

        let file = File::open(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let table = if format.is_gzipped() {
            Self::parse(BufReader::new(GzDecoder::new(file)), format, path)?
        } else {
            Self::parse(BufReader::new(file), format, path)?
        };

        info!(
            "Loaded static table: {} rows, {} columns",
            table.n_rows(),
            table.columns().len()
        );
        Ok(table)
    }

    /// Write a table as plain CSV. Missing cells become empty fields, so
    /// a saved table reloads to the same values.
    pub fn save<P: AsRef<Path>>(table: &StaticTable, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path).map_err(|source| PipelineError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

        let io_err = |source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        };
        writer
            .write_record(table.columns())
            .map_err(|source| PipelineError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
        for pos in 0..table.n_rows() {
            let record: Vec<String> = table.row(pos).iter().map(|v| v.to_string()).collect();
            writer
                .write_record(&record)
                .map_err(|source| PipelineError::Csv {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        writer.flush().map_err(io_err)?;
        info!("Wrote {} rows to {:?}", table.n_rows(), path);
        Ok(())
    }

    fn parse<R: Read>(reader: R, format: FileFormat, path: &Path) -> Result<StaticTable> {
        let mut csv_reader = ReaderBuilder::new()
            .delimiter(format.delimiter())
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let columns: Vec<String> = csv_reader
            .headers()
            .map_err(|source| PipelineError::Csv {
                path: path.to_path_buf(),
                source,
            })?
            .iter()
            .map(|s| s.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for result in csv_reader.records() {
            let record = result.map_err(|source| PipelineError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            let mut row: Vec<Value> = record.iter().map(parse_cell).collect();
            // Short records are padded so every row matches the header.
            row.resize(columns.len(), Value::Missing);
            row.truncate(columns.len());
            rows.push(row);
        }

        StaticTable::new(columns, rows)
    }
}

/// Reader for per-patient longitudinal measurement files.
///
/// Each patient owns at most one file named `{patient_id}.csv` inside a
/// shared directory. The first column is the integer day offset relative
/// to infusion, regardless of how it is titled; the remaining columns are
/// measurement variables.
#[derive(Debug, Clone)]
pub struct SeriesStore {
    dir: PathBuf,
}

impl SeriesStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a patient's series file would have, whether or not it exists.
    pub fn path_for(&self, patient_id: &str) -> PathBuf {
        self.dir.join(format!("{patient_id}.csv"))
    }

    /// Load one patient's series. `Ok(None)` when the file is absent;
    /// incomplete longitudinal coverage is expected, not an error.
    pub fn load(&self, patient_id: &str) -> Result<Option<LongitudinalSeries>> {
        let path = self.path_for(patient_id);
        if !path.is_file() {
            debug!("No longitudinal file for patient {}", patient_id);
            return Ok(None);
        }

        let file = File::open(&path).map_err(|source| PipelineError::Io {
            path: path.clone(),
            source,
        })?;
        let mut csv_reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let headers: Vec<String> = csv_reader
            .headers()
            .map_err(|source| PipelineError::Csv {
                path: path.clone(),
                source,
            })?
            .iter()
            .map(|s| s.trim().to_string())
            .collect();

        if headers.len() < 2 {
            warn!(
                "Longitudinal file for patient {} has no measurement columns",
                patient_id
            );
            return Ok(Some(LongitudinalSeries::new(
                Vec::new(),
                Vec::new(),
                Vec::new(),
            )));
        }

        let variables: Vec<String> = headers[1..].to_vec();
        let mut days = Vec::new();
        let mut values: Vec<Vec<Option<f64>>> = vec![Vec::new(); variables.len()];

        for result in csv_reader.records() {
            let record = result.map_err(|source| PipelineError::Csv {
                path: path.clone(),
                source,
            })?;

            let day = record
                .get(0)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(|d| d.round() as i32);
            let Some(day) = day else {
                warn!(
                    "Skipping row with unparseable day offset in {:?}",
                    path.file_name()
                );
                continue;
            };

            days.push(day);
            for (i, slot) in values.iter_mut().enumerate() {
                let cell = record.get(i + 1).unwrap_or("");
                slot.push(match parse_cell(cell) {
                    Value::Num(v) => Some(v),
                    _ => None,
                });
            }
        }

        Ok(Some(LongitudinalSeries::new(days, variables, values)))
    }
}
