//! Persistence side of the pipeline: date normalization, content hashing and
//! the store clients that receive save payloads.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use toll_core::SavePayload;
use tracing::debug;

pub const CRATE_NAME: &str = "toll-storage";

/// Joins hash fields; the ASCII unit separator never occurs in CSV text fields.
pub const HASH_FIELD_DELIMITER: &str = "\u{1f}";

pub const SAVE_PATH: &str = "etc-meisai";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot parse date '{input}': {reason}")]
    MalformedDate { input: String, reason: String },
    #[error("missing or invalid '{0}' field")]
    MissingField(&'static str),
    #[error("request to db service failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("db service returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("record with hash {0} already stored")]
    Duplicate(String),
}

/// RFC 3339 input keeps its time and offset; a bare `YYYY-MM-DD` becomes UTC midnight.
pub fn normalize_date(input: &str) -> Result<String, StorageError> {
    if input.contains('T') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
            return Ok(ts.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }

    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d").map_err(|err| {
        StorageError::MalformedDate {
            input: input.to_string(),
            reason: err.to_string(),
        }
    })?;
    let midnight = Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
    Ok(midnight.to_rfc3339_opts(SecondsFormat::Secs, true))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fingerprint used by the downstream store for its own duplicate suppression.
pub fn content_hash(
    timestamp: &str,
    entry_location: Option<&str>,
    exit_location: &str,
    amount: i64,
    card_number: &str,
) -> String {
    let amount = amount.to_string();
    let fields = [
        timestamp,
        entry_location.unwrap_or_default(),
        exit_location,
        amount.as_str(),
        card_number,
    ];
    let joined = fields.join(HASH_FIELD_DELIMITER);
    sha256_hex(joined.as_bytes())
}

/// Representation handed to the db service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub account_id: String,
    /// RFC 3339, UTC midnight for calendar dates.
    pub timestamp: String,
    pub date: String,
    /// `None` when the row had no entry location.
    pub entry_location: Option<String>,
    pub exit_location: String,
    pub route: String,
    pub vehicle_class: i32,
    pub amount: i64,
    pub card_number: String,
    pub hash: String,
}

impl PersistedRecord {
    pub fn from_payload(payload: &SavePayload) -> Result<Self, StorageError> {
        if payload.date.is_empty() {
            return Err(StorageError::MissingField("date"));
        }
        let timestamp = normalize_date(&payload.date)?;
        let entry_location =
            (!payload.entry_location.is_empty()).then(|| payload.entry_location.clone());

        let mut record = Self {
            account_id: payload.account_id.clone(),
            timestamp,
            date: payload.date.clone(),
            entry_location,
            exit_location: payload.exit_location.clone(),
            route: payload.route.clone(),
            vehicle_class: payload.vehicle_class,
            amount: payload.amount,
            card_number: payload.card_number.clone(),
            hash: String::new(),
        };
        record.hash = record.compute_hash();
        Ok(record)
    }

    /// Hash over the pre-hash fields; `self.hash` never participates.
    pub fn compute_hash(&self) -> String {
        content_hash(
            &self.timestamp,
            self.entry_location.as_deref(),
            &self.exit_location,
            self.amount,
            &self.card_number,
        )
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save(&self, payload: &SavePayload) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl HttpStoreConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Posts each record as JSON to the db service, without retry.
#[derive(Debug)]
pub struct HttpRecordStore {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpRecordStore {
    pub fn new(config: HttpStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        let endpoint = format!("{}/{}", config.base_url.trim_end_matches('/'), SAVE_PATH);
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn save(&self, payload: &SavePayload) -> Result<(), StorageError> {
        let record = PersistedRecord::from_payload(payload)?;
        let resp = self.client.post(&self.endpoint).json(&record).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StorageError::HttpStatus {
                status: status.as_u16(),
                url: self.endpoint.clone(),
            });
        }
        debug!(hash = %record.hash, "record saved to db service");
        Ok(())
    }
}

/// In-process store that suppresses records whose content hash it has seen.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<PersistedRecord>,
    hashes: HashSet<String>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<PersistedRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save(&self, payload: &SavePayload) -> Result<(), StorageError> {
        let record = PersistedRecord::from_payload(payload)?;
        let mut state = self.state.lock().await;
        if !state.hashes.insert(record.hash.clone()) {
            return Err(StorageError::Duplicate(record.hash));
        }
        state.records.push(record);
        Ok(())
    }
}
