use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use flate2::read::GzDecoder;
use log::{debug, error, info, warn};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::LoadError;
use crate::types::{Blob, ImageSize, MeasurementRecord, Timestamp};

/// Columns before the blob triples, in file order.
const FIXED_FIELDS: [&str; 9] = [
    "ref_x", "ref_y", "ref_z", "ref_qw", "ref_qx", "ref_qy", "ref_qz", "sec", "usec",
];
const BLOB_FIELDS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub delimiter: char,
    /// Resolution every blob in the file was measured against
    pub image_size: ImageSize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            image_size: ImageSize::default(),
        }
    }
}

/// Why a data line was dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RowIssue {
    #[error("missing field {field}")]
    MissingField { field: &'static str },

    #[error("field {field} is not a valid number: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("ground truth quaternion has zero norm")]
    DegenerateQuaternion,

    #[error("could not tokenize line: {0}")]
    Tokenizer(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RejectedRow {
    /// 1-based line number in the source, header included
    pub line: u64,
    pub issue: RowIssue,
}

/// A kept row whose trailing blob values did not form a whole triple.
#[derive(Clone, Debug, PartialEq)]
pub struct StructuralIssue {
    pub line: u64,
    pub leftover_values: usize,
    pub blobs_kept: usize,
}

/// A kept row whose blob list stopped at a value that is not a number.
#[derive(Clone, Debug, PartialEq)]
pub struct InvalidBlobValue {
    pub line: u64,
    /// Index of the blob the bad value belongs to
    pub blob: usize,
    pub value: String,
    pub blobs_kept: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadReport {
    /// Non-blank data lines seen
    pub rows_read: usize,
    pub rejected: Vec<RejectedRow>,
    pub structural: Vec<StructuralIssue>,
    pub invalid_blobs: Vec<InvalidBlobValue>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadSummary {
    pub rows_read: usize,
    pub rows_accepted: usize,
    pub rows_rejected: usize,
    pub structural_issues: usize,
    pub truncated_blob_lists: usize,
}

impl LoadReport {
    pub fn summary(&self) -> LoadSummary {
        LoadSummary {
            rows_read: self.rows_read,
            rows_accepted: self.rows_read - self.rejected.len(),
            rows_rejected: self.rejected.len(),
            structural_issues: self.structural.len(),
            truncated_blob_lists: self.invalid_blobs.len(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoadedMeasurements {
    pub records: Vec<MeasurementRecord>,
    pub report: LoadReport,
}

struct ParsedRow {
    record: MeasurementRecord,
    leftover_values: usize,
    /// (blob index, text) of the value that ended the blob list
    invalid_blob: Option<(usize, String)>,
}

/// Reads ground truth plus blob measurements, one frame per line.
pub struct MeasurementLoader {
    config: LoaderConfig,
}

impl MeasurementLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Load a file, decompressing it first when the name ends in `.gz`.
    pub fn load_path(&self, path: &Path) -> Result<LoadedMeasurements, LoadError> {
        let file = File::open(path).map_err(|source| LoadError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let reader: Box<dyn BufRead> = if path.extension().map(|e| e == "gz").unwrap_or(false) {
            Box::new(BufReader::new(GzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        self.load_reader(reader)
    }

    /// Like `load_path`, but failures become an empty sequence.
    pub fn load_or_empty(&self, path: &Path) -> LoadedMeasurements {
        match self.load_path(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("[loader] {}", e);
                LoadedMeasurements::default()
            }
        }
    }

    pub fn load_reader<R: BufRead>(&self, mut reader: R) -> Result<LoadedMeasurements, LoadError> {
        let mut header = String::new();
        reader
            .read_line(&mut header)
            .map_err(LoadError::HeaderRead)?;
        if header.trim().is_empty() {
            return Err(LoadError::EmptyHeader);
        }

        if !self.config.delimiter.is_ascii() {
            return Err(LoadError::InvalidDelimiter(self.config.delimiter));
        }
        let delimiter = self.config.delimiter as u8;

        let mut csv_reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .delimiter(delimiter)
            .from_reader(reader);

        let mut loaded = LoadedMeasurements::default();
        let mut fields = StringRecord::new();
        loop {
            match csv_reader.read_record(&mut fields) {
                Ok(false) => break,
                Ok(true) => {}
                Err(e) => {
                    if e.is_io_error() {
                        warn!("[loader] read failed, keeping rows so far: {}", e);
                        break;
                    }
                    let line = e.position().map(|p| p.line() + 1).unwrap_or(0);
                    loaded.report.rows_read += 1;
                    self.reject(&mut loaded.report, line, RowIssue::Tokenizer(e.to_string()));
                    continue;
                }
            }

            // Blank and whitespace-only lines are not rows
            if fields.iter().all(|f| f.is_empty()) {
                continue;
            }

            // Header was consumed before the csv reader saw the input
            let line = fields.position().map(|p| p.line() + 1).unwrap_or(0);
            loaded.report.rows_read += 1;

            match self.parse_row(&fields) {
                Ok(parsed) => {
                    debug!("[loader] row has {} blobs", parsed.record.blobs.len());
                    if let Some((blob, value)) = parsed.invalid_blob {
                        warn!(
                            "[loader] line {}: blob {} has invalid value {:?}, kept {} blobs",
                            line,
                            blob,
                            value,
                            parsed.record.blobs.len()
                        );
                        loaded.report.invalid_blobs.push(InvalidBlobValue {
                            line,
                            blob,
                            value,
                            blobs_kept: parsed.record.blobs.len(),
                        });
                    }
                    if parsed.leftover_values > 0 {
                        warn!(
                            "[loader] line {}: {} trailing blob value(s) do not form a triple, kept {} blobs",
                            line,
                            parsed.leftover_values,
                            parsed.record.blobs.len()
                        );
                        loaded.report.structural.push(StructuralIssue {
                            line,
                            leftover_values: parsed.leftover_values,
                            blobs_kept: parsed.record.blobs.len(),
                        });
                    }
                    loaded.records.push(parsed.record);
                }
                Err(issue) => self.reject(&mut loaded.report, line, issue),
            }
        }

        info!(
            "[loader] total of {} rows ({} rejected, {} structural issues, {} truncated blob lists)",
            loaded.records.len(),
            loaded.report.rejected.len(),
            loaded.report.structural.len(),
            loaded.report.invalid_blobs.len()
        );
        Ok(loaded)
    }

    fn reject(&self, report: &mut LoadReport, line: u64, issue: RowIssue) {
        warn!("[loader] line {} rejected: {}", line, issue);
        report.rejected.push(RejectedRow { line, issue });
    }

    fn parse_row(&self, fields: &StringRecord) -> Result<ParsedRow, RowIssue> {
        let mut values: Vec<&str> = fields.iter().collect();
        // A line written with a trailing delimiter ends in one empty field
        if values.len() > FIXED_FIELDS.len() && values.last() == Some(&"") {
            values.pop();
        }

        let mut reals = [0.0f64; 7];
        for (i, slot) in reals.iter_mut().enumerate() {
            *slot = parse_real(&values, i)?;
        }
        let seconds = parse_integer(&values, 7)?;
        let microseconds = parse_integer(&values, 8)?;

        let rotation = UnitQuaternion::try_new(
            Quaternion::new(reals[3], reals[4], reals[5], reals[6]),
            1e-12,
        )
        .ok_or(RowIssue::DegenerateQuaternion)?;

        // Blobs are read until the first value that is not a number; the
        // ground truth and every complete blob before it are kept
        let blob_values = &values[FIXED_FIELDS.len()..];
        let mut blobs = Vec::with_capacity(blob_values.len() / BLOB_FIELDS);
        let mut pending = Vec::with_capacity(BLOB_FIELDS);
        let mut invalid_blob = None;
        for (i, text) in blob_values.iter().enumerate() {
            let Some(value) = text.parse::<f64>().ok().filter(|v| v.is_finite()) else {
                invalid_blob = Some((i / BLOB_FIELDS, text.to_string()));
                break;
            };
            pending.push(value);
            if pending.len() == BLOB_FIELDS {
                blobs.push(Blob::new(
                    pending[0],
                    pending[1],
                    pending[2],
                    self.config.image_size,
                ));
                pending.clear();
            }
        }

        Ok(ParsedRow {
            record: MeasurementRecord {
                timestamp: Timestamp::new(seconds, microseconds),
                ground_truth_position: Vector3::new(reals[0], reals[1], reals[2]),
                ground_truth_rotation: rotation,
                blobs,
            },
            leftover_values: pending.len(),
            invalid_blob,
        })
    }
}

fn field<'a>(values: &[&'a str], index: usize) -> Result<&'a str, RowIssue> {
    values
        .get(index)
        .copied()
        .filter(|v| !v.is_empty())
        .ok_or(RowIssue::MissingField {
            field: FIXED_FIELDS[index],
        })
}

fn parse_real(values: &[&str], index: usize) -> Result<f64, RowIssue> {
    let text = field(values, index)?;
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| RowIssue::InvalidField {
            field: FIXED_FIELDS[index],
            value: text.to_string(),
        })
}

fn parse_integer(values: &[&str], index: usize) -> Result<i64, RowIssue> {
    let text = field(values, index)?;
    text.parse::<i64>().map_err(|_| RowIssue::InvalidField {
        field: FIXED_FIELDS[index],
        value: text.to_string(),
    })
}
