//! CSV parser contract and the headered-CSV implementation used by the service.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use thiserror::Error;
use toll_core::{CanonicalRecord, RawRecord};

pub const CRATE_NAME: &str = "toll-parser";

pub const REQUIRED_COLUMNS: [&str; 8] = [
    "entry_date",
    "entry_time",
    "exit_date",
    "exit_time",
    "entry_ic",
    "exit_ic",
    "vehicle_class",
    "amount",
];

/// Failure that prevents a whole payload from producing records.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("missing required column '{0}'")]
    MissingColumn(&'static str),
    #[error("line {line}: {source}")]
    Csv {
        line: u64,
        #[source]
        source: csv::Error,
    },
    #[error("line {line}: invalid amount '{value}'")]
    Amount { line: u64, value: String },
}

/// Failure scoped to a single record. `field` is best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct RecordError {
    pub field: &'static str,
    pub message: String,
}

impl RecordError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub trait RecordParser: Send + Sync {
    fn parse_file(&self, path: &Path) -> Result<Vec<RawRecord>, ParseError>;
    fn parse(&self, reader: &mut dyn Read) -> Result<Vec<RawRecord>, ParseError>;
    fn validate(&self, record: &RawRecord) -> Result<(), RecordError>;
    fn to_canonical(&self, record: &RawRecord) -> Result<CanonicalRecord, RecordError>;
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    entry_date: String,
    entry_time: String,
    exit_date: String,
    exit_time: String,
    entry_ic: String,
    exit_ic: String,
    vehicle_class: String,
    amount: String,
    #[serde(default)]
    card_number: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvRecordParser;

impl CsvRecordParser {
    pub fn new() -> Self {
        Self
    }
}

impl RecordParser for CsvRecordParser {
    fn parse_file(&self, path: &Path) -> Result<Vec<RawRecord>, ParseError> {
        let mut file = File::open(path).map_err(|source| ParseError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.parse(&mut file)
    }

    fn parse(&self, reader: &mut dyn Read) -> Result<Vec<RawRecord>, ParseError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .map_err(|source| ParseError::Csv { line: 1, source })?
            .clone();
        for column in REQUIRED_COLUMNS {
            if !headers.iter().any(|h| h == column) {
                return Err(ParseError::MissingColumn(column));
            }
        }

        let mut records = Vec::new();
        for (idx, row) in csv_reader.deserialize::<CsvRow>().enumerate() {
            let fallback_line = idx as u64 + 2;
            let row = row.map_err(|source| ParseError::Csv {
                line: source
                    .position()
                    .map(|p| p.line())
                    .unwrap_or(fallback_line),
                source,
            })?;
            let amount = parse_amount(&row.amount).ok_or_else(|| ParseError::Amount {
                line: fallback_line,
                value: row.amount.clone(),
            })?;
            records.push(RawRecord {
                entry_date: row.entry_date,
                entry_time: row.entry_time,
                exit_date: row.exit_date,
                exit_time: row.exit_time,
                entry_ic: row.entry_ic,
                exit_ic: row.exit_ic,
                vehicle_class: row.vehicle_class,
                amount,
                card_number: row.card_number,
            });
        }
        Ok(records)
    }

    fn validate(&self, record: &RawRecord) -> Result<(), RecordError> {
        if record.exit_date.is_empty() {
            return Err(RecordError::new("exit_date", "is required"));
        }
        if parse_record_date(&record.exit_date).is_none() {
            return Err(RecordError::new(
                "exit_date",
                format!("unrecognized date '{}'", record.exit_date),
            ));
        }
        if !record.entry_date.is_empty() && parse_record_date(&record.entry_date).is_none() {
            return Err(RecordError::new(
                "entry_date",
                format!("unrecognized date '{}'", record.entry_date),
            ));
        }
        for (field, value) in [
            ("entry_time", &record.entry_time),
            ("exit_time", &record.exit_time),
        ] {
            if !value.is_empty() && parse_record_time(value).is_none() {
                return Err(RecordError::new(field, format!("unrecognized time '{value}'")));
            }
        }
        if record.exit_ic.is_empty() {
            return Err(RecordError::new("exit_ic", "is required"));
        }
        if record.amount < 0 {
            return Err(RecordError::new(
                "amount",
                format!("must not be negative, got {}", record.amount),
            ));
        }
        if record.vehicle_class.parse::<i32>().is_err() {
            return Err(RecordError::new(
                "vehicle_class",
                format!("must be an integer, got '{}'", record.vehicle_class),
            ));
        }
        if !record.card_number.is_empty() {
            let digits = card_digits(&record.card_number);
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(RecordError::new(
                    "card_number",
                    format!("must contain only digits, got '{}'", record.card_number),
                ));
            }
        }
        Ok(())
    }

    fn to_canonical(&self, record: &RawRecord) -> Result<CanonicalRecord, RecordError> {
        self.validate(record)?;

        let date = parse_record_date(&record.exit_date)
            .ok_or_else(|| RecordError::new("exit_date", "unrecognized date"))?;
        let vehicle_class = record
            .vehicle_class
            .parse::<i32>()
            .map_err(|err| RecordError::new("vehicle_class", err.to_string()))?;
        let route = if record.entry_ic.is_empty() {
            record.exit_ic.clone()
        } else {
            format!("{} - {}", record.entry_ic, record.exit_ic)
        };
        let card_number = (!record.card_number.is_empty()).then(|| record.card_number.clone());

        Ok(CanonicalRecord {
            date,
            entry_location: record.entry_ic.clone(),
            exit_location: record.exit_ic.clone(),
            route,
            vehicle_class,
            amount: record.amount,
            card_number,
        })
    }
}

/// Accepts `YYYY/MM/DD`, `YY/MM/DD` and `YYYY-MM-DD`.
pub fn parse_record_date(value: &str) -> Option<NaiveDate> {
    let format = if value.contains('-') {
        "%Y-%m-%d"
    } else if value.split('/').next().map(str::len) == Some(2) {
        "%y/%m/%d"
    } else {
        "%Y/%m/%d"
    };
    NaiveDate::parse_from_str(value, format).ok()
}

fn parse_record_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

fn parse_amount(value: &str) -> Option<i64> {
    let cleaned = value.replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn card_digits(value: &str) -> String {
    value.chars().filter(|c| *c != ' ' && *c != '-').collect()
}
