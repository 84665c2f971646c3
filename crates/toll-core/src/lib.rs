//! Core data model for toll transaction ingest: parsed rows, canonical
//! records, save payloads, batch statistics and the request/response shapes.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "toll-core";

/// One CSV row as produced by the parser, before any normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawRecord {
    pub entry_date: String,
    pub entry_time: String,
    pub exit_date: String,
    pub exit_time: String,
    pub entry_ic: String,
    pub exit_ic: String,
    pub vehicle_class: String,
    pub amount: i64,
    #[serde(default)]
    pub card_number: String,
}

/// Normalized, save-ready projection of a [`RawRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub date: NaiveDate,
    pub entry_location: String,
    pub exit_location: String,
    pub route: String,
    pub vehicle_class: i32,
    pub amount: i64,
    pub card_number: Option<String>,
}

/// Field mapping handed to the store: a canonical record plus the batch's account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavePayload {
    pub account_id: String,
    /// Calendar form, `YYYY-MM-DD`.
    pub date: String,
    pub entry_location: String,
    pub exit_location: String,
    pub route: String,
    pub vehicle_class: i32,
    pub amount: i64,
    /// Empty when the source row had no card number.
    pub card_number: String,
}

impl SavePayload {
    pub fn from_canonical(record: &CanonicalRecord, account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            date: record.date.format("%Y-%m-%d").to_string(),
            entry_location: record.entry_location.clone(),
            exit_location: record.exit_location.clone(),
            route: record.route.clone(),
            vehicle_class: record.vehicle_class,
            amount: record.amount,
            card_number: record.card_number.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProcessingStats {
    pub total_records: u32,
    pub saved_records: u32,
    pub skipped_records: u32,
    pub error_records: u32,
}

impl ProcessingStats {
    pub fn new(total_records: u32) -> Self {
        Self {
            total_records,
            ..Default::default()
        }
    }

    /// `total = saved + skipped + errored`.
    pub fn is_balanced(&self) -> bool {
        self.total_records == self.saved_records + self.skipped_records + self.error_records
    }
}

/// Structured failure reported by validate-only requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Record index + 2 (header row, 1-based); 0 for whole-payload failures.
    pub line_number: u32,
    pub field: String,
    pub message: String,
    pub record_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProcessCsvFileRequest {
    #[serde(default)]
    pub csv_file_path: String,
    #[serde(default)]
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProcessCsvDataRequest {
    #[serde(default)]
    pub csv_data: String,
    #[serde(default)]
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValidateCsvDataRequest {
    #[serde(default)]
    pub csv_data: String,
    #[serde(default)]
    pub account_id: String,
}

/// Shared view over the three inbound request shapes.
pub trait IngestRequest {
    fn account_id(&self) -> &str;

    fn csv_data(&self) -> Option<&str> {
        None
    }

    fn csv_file_path(&self) -> Option<&str> {
        None
    }
}

impl IngestRequest for ProcessCsvFileRequest {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn csv_file_path(&self) -> Option<&str> {
        Some(&self.csv_file_path)
    }
}

impl IngestRequest for ProcessCsvDataRequest {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn csv_data(&self) -> Option<&str> {
        Some(&self.csv_data)
    }
}

impl IngestRequest for ValidateCsvDataRequest {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn csv_data(&self) -> Option<&str> {
        Some(&self.csv_data)
    }
}

/// Response for both processing request shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCsvResponse {
    pub success: bool,
    pub message: String,
    pub stats: ProcessingStats,
    pub errors: Vec<String>,
}

impl ProcessCsvResponse {
    /// Response for a request that failed before any record was looked at.
    pub fn failed(message: String, error: String) -> Self {
        Self {
            success: false,
            message,
            stats: ProcessingStats::default(),
            errors: vec![error],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateCsvDataResponse {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub duplicate_count: u32,
    pub total_records: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub version: String,
    pub timestamp: i64,
    pub details: BTreeMap<String, String>,
}
