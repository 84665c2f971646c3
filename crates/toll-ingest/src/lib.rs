//! Batch ingestion pipeline: request validation, source resolution, duplicate
//! tracking and the per-record processing loop.

use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use toll_core::{
    HealthCheckResponse, IngestRequest, ProcessCsvDataRequest, ProcessCsvFileRequest,
    ProcessCsvResponse, ProcessingStats, RawRecord, SavePayload, ValidateCsvDataRequest,
    ValidateCsvDataResponse, ValidationError,
};
use toll_parser::{CsvRecordParser, RecordParser};
use toll_storage::{HttpRecordStore, HttpStoreConfig, RecordStore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "toll-ingest";
pub const SERVICE_NAME: &str = "toll-ingest";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const MIN_ACCOUNT_ID_LEN: usize = 3;
pub const MIN_CSV_DATA_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
    #[error("malformed date: {0}")]
    MalformedDate(String),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::InvalidArgument(_) => "invalid_argument",
            IngestError::NotFound(_) => "not_found",
            IngestError::Internal(_) => "internal",
            IngestError::MalformedDate(_) => "malformed_date",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            IngestError::InvalidArgument(m)
            | IngestError::NotFound(m)
            | IngestError::Internal(m)
            | IngestError::MalformedDate(m) => m,
        }
    }
}

fn invalid(message: impl Into<String>) -> IngestError {
    IngestError::InvalidArgument(message.into())
}

/// Process-wide settings, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub skip_duplicates: bool,
    pub csv_base_path: Option<PathBuf>,
    /// Base URL of the db service; no store is used when unset.
    pub db_service_url: Option<String>,
    pub store_timeout_secs: u64,
    pub request_timeout_secs: Option<u64>,
    pub listen_port: u16,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            skip_duplicates: true,
            csv_base_path: None,
            db_service_url: None,
            store_timeout_secs: 5,
            request_timeout_secs: None,
            listen_port: 50051,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            skip_duplicates: lookup("SKIP_DUPLICATES")
                .map(|v| !matches!(v.as_str(), "false" | "0"))
                .unwrap_or(defaults.skip_duplicates),
            csv_base_path: lookup("CSV_BASE_PATH")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            db_service_url: lookup("DB_SERVICE_URL").filter(|v| !v.is_empty()),
            store_timeout_secs: lookup("DB_SERVICE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.store_timeout_secs),
            request_timeout_secs: lookup("REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            listen_port: lookup("TOLL_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.listen_port),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(text).context("parsing ingest config")?;
        config.csv_base_path = config
            .csv_base_path
            .filter(|p| !p.as_os_str().is_empty());
        config.db_service_url = config.db_service_url.filter(|u| !u.is_empty());
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn request_deadline(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Per-call settings handed to the batch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    pub account_id: String,
    pub skip_duplicates: bool,
}

/// Cooperative cancellation, polled once per record.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl CancelSignal {
    pub fn never() -> Self {
        Self::default()
    }

    pub fn from_watch(rx: watch::Receiver<bool>) -> Self {
        Self {
            rx: Some(rx),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return true;
        }
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

pub trait RequestValidator: Send + Sync {
    fn validate_csv_file_path(&self, path: &str) -> Result<(), IngestError>;
    fn validate_account_id(&self, account_id: &str) -> Result<(), IngestError>;
    fn validate_csv_data(&self, data: &str) -> Result<(), IngestError>;
    fn check_file_exists(&self, path: &str) -> Result<(), IngestError>;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultValidator {
    csv_base_path: Option<PathBuf>,
}

impl DefaultValidator {
    pub fn new(csv_base_path: Option<PathBuf>) -> Self {
        Self { csv_base_path }
    }
}

impl RequestValidator for DefaultValidator {
    fn validate_csv_file_path(&self, path: &str) -> Result<(), IngestError> {
        // The override directory supplies the path when the caller leaves it empty.
        if path.is_empty() && self.csv_base_path.is_none() {
            return Err(invalid(
                "csv_file_path is required when CSV_BASE_PATH is not set",
            ));
        }
        Ok(())
    }

    fn validate_account_id(&self, account_id: &str) -> Result<(), IngestError> {
        if account_id.is_empty() {
            return Ok(());
        }
        if account_id.chars().count() < MIN_ACCOUNT_ID_LEN {
            return Err(invalid(format!(
                "account_id must be at least {MIN_ACCOUNT_ID_LEN} characters"
            )));
        }
        Ok(())
    }

    fn validate_csv_data(&self, data: &str) -> Result<(), IngestError> {
        if data.is_empty() {
            return Err(invalid("csv_data is required"));
        }
        if data.chars().count() < MIN_CSV_DATA_LEN {
            return Err(invalid("csv_data is too short"));
        }
        Ok(())
    }

    fn check_file_exists(&self, path: &str) -> Result<(), IngestError> {
        match std::fs::metadata(path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(IngestError::NotFound(format!("file not found: {path}")))
            }
            Err(err) => Err(IngestError::Internal(format!("failed to check file: {err}"))),
        }
    }
}

pub fn validate_process_file_request<R: IngestRequest>(
    req: Option<&R>,
    validator: &dyn RequestValidator,
    config: &IngestConfig,
) -> Result<(), IngestError> {
    let req = req.ok_or_else(|| invalid("request is missing"))?;
    let path = req
        .csv_file_path()
        .ok_or_else(|| invalid("request does not carry csv_file_path"))?;

    validator.validate_csv_file_path(path)?;
    validator.validate_account_id(req.account_id())?;

    // A discovered override path was just listed from disk; only caller paths are probed.
    if !path.is_empty() && config.csv_base_path.is_none() {
        validator.check_file_exists(path)?;
    }
    Ok(())
}

pub fn validate_process_data_request<R: IngestRequest>(
    req: Option<&R>,
    validator: &dyn RequestValidator,
) -> Result<(), IngestError> {
    let req = req.ok_or_else(|| invalid("request is missing"))?;
    let data = req
        .csv_data()
        .ok_or_else(|| invalid("request does not carry csv_data"))?;

    validator.validate_csv_data(data)?;
    validator.validate_account_id(req.account_id())?;
    Ok(())
}

pub fn validate_validate_data_request<R: IngestRequest>(
    req: Option<&R>,
    validator: &dyn RequestValidator,
) -> Result<(), IngestError> {
    let req = req.ok_or_else(|| invalid("request is missing"))?;
    let data = req
        .csv_data()
        .ok_or_else(|| invalid("request does not carry csv_data"))?;

    validator.validate_csv_data(data)?;
    validator.validate_account_id(req.account_id())?;
    Ok(())
}

/// Directory access used by [`SourcePathResolver`].
pub trait DirectoryListing: Send + Sync {
    fn subdirectories(&self, base: &Path) -> std::io::Result<Vec<String>>;
    fn csv_files(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsDirectoryListing;

impl DirectoryListing for FsDirectoryListing {
    fn subdirectories(&self, base: &Path) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(base)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(names)
    }

    fn csv_files(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "csv") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Sub-directory names under the base are expected to be sortable dates (`2024-01-15`).
pub struct SourcePathResolver {
    base: Option<PathBuf>,
    listing: Arc<dyn DirectoryListing>,
}

impl SourcePathResolver {
    pub fn new(base: Option<PathBuf>, listing: Arc<dyn DirectoryListing>) -> Self {
        Self { base, listing }
    }

    pub fn resolve(&self, provided: &str) -> Result<PathBuf, IngestError> {
        let Some(base) = &self.base else {
            return Ok(PathBuf::from(provided));
        };

        let mut dirs = self.listing.subdirectories(base).map_err(|err| {
            let message = format!("failed to read base path {}: {err}", base.display());
            if err.kind() == std::io::ErrorKind::NotFound {
                IngestError::NotFound(message)
            } else {
                IngestError::Internal(message)
            }
        })?;
        if dirs.is_empty() {
            return Err(IngestError::NotFound(format!(
                "no directories found in base path: {}",
                base.display()
            )));
        }

        dirs.sort_by(|a, b| b.cmp(a));
        let latest_dir = base.join(&dirs[0]);

        let csv_files = self.listing.csv_files(&latest_dir).map_err(|err| {
            IngestError::Internal(format!("failed to search for CSV files: {err}"))
        })?;
        let first = csv_files.into_iter().next().ok_or_else(|| {
            IngestError::NotFound(format!(
                "no CSV files found in latest directory: {}",
                latest_dir.display()
            ))
        })?;
        debug!(path = %first.display(), "resolved csv source from override base");
        Ok(first)
    }
}

/// Key used by validate-only requests to count duplicates. Card number is not part of it.
pub fn validation_key(record: &RawRecord) -> String {
    format!(
        "{}_{}_{}_{}_{}",
        record.entry_date, record.entry_time, record.exit_date, record.exit_time, record.amount
    )
}

/// Key used while processing to decide whether a record is skipped.
pub fn processing_key(record: &RawRecord) -> String {
    format!(
        "{}_{}_{}_{}_{}_{}",
        record.entry_date,
        record.entry_time,
        record.exit_date,
        record.exit_time,
        record.amount,
        record.card_number
    )
}

/// Keys seen so far in one batch. Never shared between batches.
#[derive(Debug, Default)]
pub struct DuplicateTracker {
    seen: HashSet<String>,
}

impl DuplicateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn mark(&mut self, key: String) {
        self.seen.insert(key);
    }

    /// Records `key` and reports whether it had been seen before.
    pub fn observe(&mut self, key: String) -> bool {
        !self.seen.insert(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub stats: ProcessingStats,
    /// One line per failed record, in record order.
    pub errors: Vec<String>,
}

pub struct BatchProcessor<'a> {
    parser: &'a dyn RecordParser,
    store: Option<&'a dyn RecordStore>,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(parser: &'a dyn RecordParser, store: Option<&'a dyn RecordStore>) -> Self {
        Self { parser, store }
    }

    pub async fn run(
        &self,
        records: &[RawRecord],
        options: &BatchOptions,
        cancel: &CancelSignal,
    ) -> BatchOutcome {
        let batch_id = Uuid::new_v4();
        let span = info_span!("ingest_batch", %batch_id, record_count = records.len());
        self.run_inner(records, options, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        records: &[RawRecord],
        options: &BatchOptions,
        cancel: &CancelSignal,
    ) -> BatchOutcome {
        let mut stats = ProcessingStats::new(records.len() as u32);
        let mut errors = Vec::new();
        let mut tracker = DuplicateTracker::new();

        if self.store.is_none() {
            info!("no record store configured; records are counted but not persisted");
        }

        for (idx, record) in records.iter().enumerate() {
            let position = idx + 1;

            if cancel.is_cancelled() {
                let remaining = records.len() - idx;
                stats.error_records += remaining as u32;
                errors.push(format!(
                    "Processing cancelled at record {position}: {remaining} records not processed"
                ));
                warn!(position, remaining, "batch cancelled");
                break;
            }

            let key = processing_key(record);
            if options.skip_duplicates && tracker.contains(&key) {
                debug!(position, "skipping duplicate record");
                stats.skipped_records += 1;
                continue;
            }

            let canonical = match self
                .parser
                .validate(record)
                .and_then(|()| self.parser.to_canonical(record))
            {
                Ok(canonical) => canonical,
                Err(err) => {
                    warn!(position, field = err.field, error = %err, "record failed validation");
                    errors.push(format!("Record {position}: validation failed: {err}"));
                    stats.error_records += 1;
                    continue;
                }
            };

            let payload = SavePayload::from_canonical(&canonical, &options.account_id);
            if let Some(store) = self.store {
                if let Err(err) = store.save(&payload).await {
                    warn!(position, error = %err, "record save failed");
                    errors.push(format!("Record {position}: save failed: {err}"));
                    stats.error_records += 1;
                    continue;
                }
            }

            tracker.mark(key);
            stats.saved_records += 1;
        }

        info!(
            total = stats.total_records,
            saved = stats.saved_records,
            skipped = stats.skipped_records,
            errored = stats.error_records,
            "batch finished"
        );
        BatchOutcome { stats, errors }
    }
}

/// Validates every record, duplicates included. Nothing is persisted.
pub fn validate_records(
    parser: &dyn RecordParser,
    records: &[RawRecord],
) -> ValidateCsvDataResponse {
    let mut tracker = DuplicateTracker::new();
    let mut duplicate_count = 0u32;
    let mut errors = Vec::new();

    for (idx, record) in records.iter().enumerate() {
        if tracker.observe(validation_key(record)) {
            duplicate_count += 1;
        }

        if let Err(err) = parser.validate(record) {
            errors.push(ValidationError {
                line_number: idx as u32 + 2,
                field: err.field.to_string(),
                message: err.to_string(),
                record_data: format!("{record:?}"),
            });
        }
    }

    ValidateCsvDataResponse {
        is_valid: errors.is_empty(),
        errors,
        duplicate_count,
        total_records: records.len() as u32,
    }
}

pub struct IngestService {
    config: Arc<IngestConfig>,
    parser: Arc<dyn RecordParser>,
    store: Option<Arc<dyn RecordStore>>,
    validator: Arc<dyn RequestValidator>,
    resolver: SourcePathResolver,
}

impl IngestService {
    pub fn new(config: IngestConfig, store: Option<Arc<dyn RecordStore>>) -> Self {
        let validator = DefaultValidator::new(config.csv_base_path.clone());
        let resolver =
            SourcePathResolver::new(config.csv_base_path.clone(), Arc::new(FsDirectoryListing));
        Self {
            config: Arc::new(config),
            parser: Arc::new(CsvRecordParser::new()),
            store,
            validator: Arc::new(validator),
            resolver,
        }
    }

    /// Builds the service with an HTTP store when `db_service_url` is configured.
    pub fn from_config(config: IngestConfig) -> Result<Self> {
        let store: Option<Arc<dyn RecordStore>> = match &config.db_service_url {
            Some(url) => {
                let http = HttpRecordStore::new(HttpStoreConfig {
                    base_url: url.clone(),
                    timeout: Duration::from_secs(config.store_timeout_secs),
                })
                .context("creating db service client")?;
                info!(endpoint = http.endpoint(), "db service store configured");
                Some(Arc::new(http))
            }
            None => {
                warn!("DB_SERVICE_URL not set; running without a record store");
                None
            }
        };
        Ok(Self::new(config, store))
    }

    pub fn with_parser(mut self, parser: Arc<dyn RecordParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn RequestValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_listing(mut self, listing: Arc<dyn DirectoryListing>) -> Self {
        self.resolver = SourcePathResolver::new(self.config.csv_base_path.clone(), listing);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn request_signal(&self) -> CancelSignal {
        match self.config.request_deadline() {
            Some(timeout) => CancelSignal::never().with_deadline(Instant::now() + timeout),
            None => CancelSignal::never(),
        }
    }

    pub fn batch_options(&self, account_id: &str) -> BatchOptions {
        BatchOptions {
            account_id: account_id.to_string(),
            skip_duplicates: self.config.skip_duplicates,
        }
    }

    pub async fn process_csv_file(
        &self,
        req: Option<&ProcessCsvFileRequest>,
        cancel: &CancelSignal,
    ) -> Result<ProcessCsvResponse, IngestError> {
        validate_process_file_request(req, self.validator.as_ref(), &self.config)?;
        let req = req.ok_or_else(|| invalid("request is missing"))?;

        let path = match self.resolver.resolve(&req.csv_file_path) {
            Ok(path) => path,
            Err(err) => {
                warn!(error = %err, "failed to resolve csv file path");
                return Ok(ProcessCsvResponse::failed(
                    format!("Failed to resolve CSV file path: {err}"),
                    err.to_string(),
                ));
            }
        };

        let records = match self.parser.parse_file(&path) {
            Ok(records) => records,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to parse csv file");
                return Ok(ProcessCsvResponse::failed(
                    format!("Failed to parse CSV file: {err}"),
                    err.to_string(),
                ));
            }
        };
        info!(path = %path.display(), records = records.len(), "processing csv file");

        let outcome = self.run_batch(&records, &req.account_id, cancel).await;
        Ok(ProcessCsvResponse {
            success: outcome.stats.saved_records > 0,
            message: format!("Processed {} records from file", outcome.stats.total_records),
            stats: outcome.stats,
            errors: outcome.errors,
        })
    }

    pub async fn process_csv_data(
        &self,
        req: Option<&ProcessCsvDataRequest>,
        cancel: &CancelSignal,
    ) -> Result<ProcessCsvResponse, IngestError> {
        validate_process_data_request(req, self.validator.as_ref())?;
        let req = req.ok_or_else(|| invalid("request is missing"))?;

        let mut reader = Cursor::new(req.csv_data.as_bytes());
        let records = self
            .parser
            .parse(&mut reader)
            .map_err(|err| invalid(format!("invalid CSV format: {err}")))?;

        let outcome = self.run_batch(&records, &req.account_id, cancel).await;
        Ok(ProcessCsvResponse {
            success: outcome.stats.saved_records > 0,
            message: format!("Processed {} records", outcome.stats.total_records),
            stats: outcome.stats,
            errors: outcome.errors,
        })
    }

    pub fn validate_csv_data(
        &self,
        req: Option<&ValidateCsvDataRequest>,
    ) -> Result<ValidateCsvDataResponse, IngestError> {
        validate_validate_data_request(req, self.validator.as_ref())?;
        let req = req.ok_or_else(|| invalid("request is missing"))?;

        let mut reader = Cursor::new(req.csv_data.as_bytes());
        let records = match self.parser.parse(&mut reader) {
            Ok(records) => records,
            Err(err) => {
                return Ok(ValidateCsvDataResponse {
                    is_valid: false,
                    errors: vec![ValidationError {
                        line_number: 0,
                        field: "csv".to_string(),
                        message: err.to_string(),
                        record_data: String::new(),
                    }],
                    duplicate_count: 0,
                    total_records: 0,
                });
            }
        };

        Ok(validate_records(self.parser.as_ref(), &records))
    }

    pub fn health_check(&self) -> HealthCheckResponse {
        let details = BTreeMap::from([
            ("service".to_string(), SERVICE_NAME.to_string()),
            ("uptime".to_string(), "running".to_string()),
        ]);
        HealthCheckResponse {
            status: "healthy".to_string(),
            version: SERVICE_VERSION.to_string(),
            timestamp: Utc::now().timestamp(),
            details,
        }
    }

    async fn run_batch(
        &self,
        records: &[RawRecord],
        account_id: &str,
        cancel: &CancelSignal,
    ) -> BatchOutcome {
        let options = self.batch_options(account_id);
        let processor = BatchProcessor::new(self.parser.as_ref(), self.store.as_deref());
        processor.run(records, &options, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use toll_storage::{MemoryRecordStore, StorageError};

    const HEADER: &str =
        "entry_date,entry_time,exit_date,exit_time,entry_ic,exit_ic,vehicle_class,amount,card_number";

    fn raw(entry_time: &str, amount: i64, card: &str) -> RawRecord {
        RawRecord {
            entry_date: "2024/01/05".into(),
            entry_time: entry_time.into(),
            exit_date: "2024/01/05".into(),
            exit_time: "09:00".into(),
            entry_ic: "Tokyo".into(),
            exit_ic: "Yokohama".into(),
            vehicle_class: "1".into(),
            amount,
            card_number: card.into(),
        }
    }

    fn options(skip_duplicates: bool) -> BatchOptions {
        BatchOptions {
            account_id: "acct-01".into(),
            skip_duplicates,
        }
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    /// Fails every save whose amount is listed.
    #[derive(Default)]
    struct FailingStore {
        fail_amounts: Vec<i64>,
        saved: Mutex<Vec<SavePayload>>,
    }

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn save(&self, payload: &SavePayload) -> Result<(), StorageError> {
            if self.fail_amounts.contains(&payload.amount) {
                return Err(StorageError::HttpStatus {
                    status: 503,
                    url: "http://db/etc-meisai".into(),
                });
            }
            self.saved.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    /// Fires the cancellation watch once `after` records were saved.
    struct CancellingStore {
        tx: watch::Sender<bool>,
        after: usize,
        saves: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for CancellingStore {
        async fn save(&self, _payload: &SavePayload) -> Result<(), StorageError> {
            let saves = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
            if saves >= self.after {
                let _ = self.tx.send(true);
            }
            Ok(())
        }
    }

    struct FakeListing {
        dirs: Vec<String>,
        files: HashMap<PathBuf, Vec<PathBuf>>,
    }

    impl DirectoryListing for FakeListing {
        fn subdirectories(&self, _base: &Path) -> std::io::Result<Vec<String>> {
            Ok(self.dirs.clone())
        }

        fn csv_files(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
            Ok(self.files.get(dir).cloned().unwrap_or_default())
        }
    }

    #[test]
    fn config_defaults_skip_duplicates_and_no_override() {
        let config = IngestConfig::from_lookup(lookup(&[]));
        assert_eq!(config, IngestConfig::default());
        assert!(config.skip_duplicates);
        assert!(config.csv_base_path.is_none());
    }

    #[test]
    fn config_reads_environment_values() {
        for (value, expected) in [("false", false), ("0", false), ("true", true), ("no", true)] {
            let config = IngestConfig::from_lookup(lookup(&[("SKIP_DUPLICATES", value)]));
            assert_eq!(config.skip_duplicates, expected, "SKIP_DUPLICATES={value}");
        }

        let config = IngestConfig::from_lookup(lookup(&[
            ("CSV_BASE_PATH", "/srv/etc"),
            ("DB_SERVICE_URL", "http://db:8080"),
            ("DB_SERVICE_TIMEOUT_SECS", "9"),
            ("REQUEST_TIMEOUT_SECS", "30"),
            ("TOLL_WEB_PORT", "8081"),
        ]));
        assert_eq!(config.csv_base_path, Some(PathBuf::from("/srv/etc")));
        assert_eq!(config.db_service_url.as_deref(), Some("http://db:8080"));
        assert_eq!(config.store_timeout_secs, 9);
        assert_eq!(config.request_deadline(), Some(Duration::from_secs(30)));
        assert_eq!(config.listen_port, 8081);

        let empty_base = IngestConfig::from_lookup(lookup(&[("CSV_BASE_PATH", "")]));
        assert!(empty_base.csv_base_path.is_none());
    }

    #[test]
    fn config_loads_from_yaml_with_defaults() {
        let config = IngestConfig::from_yaml_str(
            "skip_duplicates: false\ncsv_base_path: /data/etc\nlisten_port: 9000\n",
        )
        .expect("yaml");
        assert!(!config.skip_duplicates);
        assert_eq!(config.csv_base_path, Some(PathBuf::from("/data/etc")));
        assert_eq!(config.store_timeout_secs, 5);
        assert_eq!(config.listen_port, 9000);

        let blank = IngestConfig::from_yaml_str("csv_base_path: ''\n").expect("yaml");
        assert!(blank.csv_base_path.is_none());

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ingest.yaml");
        std::fs::write(&path, "db_service_url: http://db\n").unwrap();
        let from_file = IngestConfig::from_yaml_file(&path).expect("yaml file");
        assert_eq!(from_file.db_service_url.as_deref(), Some("http://db"));
        assert!(IngestConfig::from_yaml_file(dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn account_id_rules() {
        let v = DefaultValidator::default();
        assert!(v.validate_account_id("").is_ok());
        assert!(v.validate_account_id("abc").is_ok());
        assert!(matches!(
            v.validate_account_id("ab"),
            Err(IngestError::InvalidArgument(_))
        ));
    }

    #[test]
    fn csv_data_rules() {
        let v = DefaultValidator::default();
        assert_eq!(
            v.validate_csv_data(""),
            Err(IngestError::InvalidArgument("csv_data is required".into()))
        );
        assert_eq!(
            v.validate_csv_data("a,b,c"),
            Err(IngestError::InvalidArgument("csv_data is too short".into()))
        );
        assert!(v.validate_csv_data("0123456789").is_ok());
    }

    #[test]
    fn file_path_required_only_without_override() {
        assert!(matches!(
            DefaultValidator::new(None).validate_csv_file_path(""),
            Err(IngestError::InvalidArgument(_))
        ));
        assert!(DefaultValidator::new(Some("/base".into()))
            .validate_csv_file_path("")
            .is_ok());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let present = dir.path().join("a.csv");
        std::fs::write(&present, "x").unwrap();
        let v = DefaultValidator::default();
        assert!(v.check_file_exists(&present.display().to_string()).is_ok());
        let missing = dir.path().join("b.csv").display().to_string();
        assert!(matches!(
            v.check_file_exists(&missing),
            Err(IngestError::NotFound(_))
        ));
    }

    #[test]
    fn unreadable_path_is_internal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.csv");
        std::fs::write(&file, "x").unwrap();
        let nested = file.join("inner.csv").display().to_string();
        let err = DefaultValidator::default()
            .check_file_exists(&nested)
            .unwrap_err();
        assert!(matches!(err, IngestError::Internal(_)));
        assert!(err.message().starts_with("failed to check file:"));
    }

    #[test]
    fn absent_requests_are_invalid() {
        let v = DefaultValidator::default();
        let config = IngestConfig::default();
        assert_eq!(
            validate_process_file_request::<ProcessCsvFileRequest>(None, &v, &config),
            Err(IngestError::InvalidArgument("request is missing".into()))
        );
        assert!(validate_process_data_request::<ProcessCsvDataRequest>(None, &v).is_err());
        assert!(validate_validate_data_request::<ValidateCsvDataRequest>(None, &v).is_err());
    }

    #[test]
    fn request_shape_without_the_needed_field_is_invalid() {
        let v = DefaultValidator::default();
        let data_req = ProcessCsvDataRequest {
            csv_data: "0123456789abc".into(),
            account_id: String::new(),
        };
        assert!(matches!(
            validate_process_file_request(Some(&data_req), &v, &IngestConfig::default()),
            Err(IngestError::InvalidArgument(_))
        ));
    }

    #[test]
    fn file_request_checks_existence_only_without_override() {
        let missing = ProcessCsvFileRequest {
            csv_file_path: "/definitely/not/here.csv".into(),
            account_id: "acct".into(),
        };
        let v = DefaultValidator::default();
        assert!(matches!(
            validate_process_file_request(Some(&missing), &v, &IngestConfig::default()),
            Err(IngestError::NotFound(_))
        ));

        let config = IngestConfig {
            csv_base_path: Some("/base".into()),
            ..Default::default()
        };
        let v = DefaultValidator::new(config.csv_base_path.clone());
        assert!(validate_process_file_request(Some(&missing), &v, &config).is_ok());
    }

    #[test]
    fn file_request_with_short_account_is_rejected() {
        let req = ProcessCsvFileRequest {
            csv_file_path: String::new(),
            account_id: "ab".into(),
        };
        let config = IngestConfig {
            csv_base_path: Some("/base".into()),
            ..Default::default()
        };
        let v = DefaultValidator::new(config.csv_base_path.clone());
        assert!(matches!(
            validate_process_file_request(Some(&req), &v, &config),
            Err(IngestError::InvalidArgument(_))
        ));
    }

    #[test]
    fn resolver_passes_through_without_override() {
        let resolver = SourcePathResolver::new(None, Arc::new(FsDirectoryListing));
        assert_eq!(resolver.resolve("/in/put.csv").unwrap(), PathBuf::from("/in/put.csv"));
        assert_eq!(resolver.resolve("").unwrap(), PathBuf::from(""));
    }

    #[test]
    fn resolver_selects_greatest_directory_name() {
        let base = PathBuf::from("/base");
        let expected = base.join("2024-02-01").join("usage.csv");
        let listing = FakeListing {
            dirs: vec!["2024-01-15".into(), "2024-02-01".into(), "2024-01-01".into()],
            files: HashMap::from([
                (base.join("2024-02-01"), vec![expected.clone()]),
                (base.join("2024-01-15"), vec![base.join("2024-01-15/old.csv")]),
            ]),
        };
        let resolver = SourcePathResolver::new(Some(base), Arc::new(listing));
        assert_eq!(resolver.resolve("ignored.csv").unwrap(), expected);
    }

    #[test]
    fn resolver_fails_without_directories_or_csv_files() {
        let empty = SourcePathResolver::new(
            Some("/base".into()),
            Arc::new(FakeListing {
                dirs: vec![],
                files: HashMap::new(),
            }),
        );
        assert!(matches!(empty.resolve(""), Err(IngestError::NotFound(_))));

        let no_csv = SourcePathResolver::new(
            Some("/base".into()),
            Arc::new(FakeListing {
                dirs: vec!["2024-01-01".into()],
                files: HashMap::new(),
            }),
        );
        let err = no_csv.resolve("").unwrap_err();
        assert!(err.message().contains("no CSV files found"));
    }

    #[test]
    fn fs_listing_resolves_latest_dated_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["2024-01-01", "2024-01-15", "2024-02-01"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
            std::fs::write(dir.path().join(name).join("usage.csv"), "x").unwrap();
        }
        std::fs::write(dir.path().join("2024-02-01").join("notes.txt"), "x").unwrap();
        std::fs::write(dir.path().join("2099-12-31.csv"), "file, not a directory").unwrap();

        let resolver =
            SourcePathResolver::new(Some(dir.path().to_path_buf()), Arc::new(FsDirectoryListing));
        assert_eq!(
            resolver.resolve("").unwrap(),
            dir.path().join("2024-02-01").join("usage.csv")
        );

        let missing = SourcePathResolver::new(
            Some(dir.path().join("nope")),
            Arc::new(FsDirectoryListing),
        );
        assert!(matches!(missing.resolve(""), Err(IngestError::NotFound(_))));
    }

    #[test]
    fn fs_listing_reports_unreadable_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listing = FsDirectoryListing;
        assert!(listing.csv_files(&dir.path().join("gone")).is_err());
        assert!(listing.csv_files(dir.path()).expect("empty dir").is_empty());
    }

    #[test]
    fn keys_differ_only_in_card_number() {
        let a = raw("08:00", 100, "1111");
        let b = raw("08:00", 100, "2222");
        assert_eq!(validation_key(&a), validation_key(&b));
        assert_ne!(processing_key(&a), processing_key(&b));
        assert_eq!(validation_key(&a), "2024/01/05_08:00_2024/01/05_09:00_100");
        assert_eq!(processing_key(&a), "2024/01/05_08:00_2024/01/05_09:00_100_1111");
    }

    #[test]
    fn tracker_observe_reports_repeats() {
        let mut tracker = DuplicateTracker::new();
        assert!(tracker.is_empty());
        assert!(!tracker.observe("k".into()));
        assert!(tracker.observe("k".into()));
        assert!(tracker.contains("k"));
        assert_eq!(tracker.len(), 1);
        assert!(!tracker.is_empty());
    }

    #[tokio::test]
    async fn duplicate_records_are_skipped_when_enabled() {
        let parser = CsvRecordParser::new();
        let store = MemoryRecordStore::new();
        let records = vec![raw("08:00", 100, "1111"), raw("08:00", 100, "1111")];

        let outcome = BatchProcessor::new(&parser, Some(&store))
            .run(&records, &options(true), &CancelSignal::never())
            .await;
        assert_eq!(outcome.stats.saved_records, 1);
        assert_eq!(outcome.stats.skipped_records, 1);
        assert!(outcome.errors.is_empty());
        assert!(outcome.stats.is_balanced());
    }

    #[tokio::test]
    async fn duplicate_records_are_saved_when_disabled() {
        let parser = CsvRecordParser::new();
        let store = FailingStore::default();
        let records = vec![raw("08:00", 100, "1111"), raw("08:00", 100, "1111")];

        let outcome = BatchProcessor::new(&parser, Some(&store))
            .run(&records, &options(false), &CancelSignal::never())
            .await;
        assert_eq!(outcome.stats.saved_records, 2);
        assert_eq!(outcome.stats.skipped_records, 0);
        assert_eq!(store.saved.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_save_does_not_mark_key_as_seen() {
        let parser = CsvRecordParser::new();
        let store = FailingStore {
            fail_amounts: vec![100],
            ..Default::default()
        };
        let records = vec![raw("08:00", 100, ""), raw("08:00", 100, ""), raw("08:00", 200, "")];

        let outcome = BatchProcessor::new(&parser, Some(&store))
            .run(&records, &options(true), &CancelSignal::never())
            .await;
        assert_eq!(outcome.stats.error_records, 2);
        assert_eq!(outcome.stats.skipped_records, 0);
        assert_eq!(outcome.stats.saved_records, 1);
        assert!(outcome.errors[0].starts_with("Record 1: save failed:"));
        assert!(outcome.errors[1].starts_with("Record 2: save failed:"));
    }

    #[tokio::test]
    async fn invalid_record_yields_one_error_and_batch_continues() {
        let parser = CsvRecordParser::new();
        let store = MemoryRecordStore::new();
        let mut bad = raw("08:00", 200, "");
        bad.exit_ic.clear();
        let records = vec![raw("08:00", 100, ""), bad, raw("08:30", 300, "")];

        let outcome = BatchProcessor::new(&parser, Some(&store))
            .run(&records, &options(true), &CancelSignal::never())
            .await;
        assert_eq!(outcome.stats.saved_records, 2);
        assert_eq!(outcome.stats.error_records, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("Record 2: validation failed: exit_ic"));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn store_level_duplicates_are_independent_of_skip_mode() {
        // Same content hash, different processing key (entry time is not hashed).
        let parser = CsvRecordParser::new();
        let store = MemoryRecordStore::new();
        let records = vec![raw("08:00", 100, ""), raw("08:10", 100, "")];

        let outcome = BatchProcessor::new(&parser, Some(&store))
            .run(&records, &options(true), &CancelSignal::never())
            .await;
        assert_eq!(outcome.stats.saved_records, 1);
        assert_eq!(outcome.stats.skipped_records, 0);
        assert_eq!(outcome.stats.error_records, 1);
        assert!(outcome.errors[0].contains("already stored"));
    }

    #[tokio::test]
    async fn pre_cancelled_batch_counts_everything_as_errored() {
        let parser = CsvRecordParser::new();
        let (tx, rx) = watch::channel(true);
        let records = vec![raw("08:00", 100, ""), raw("08:10", 200, "")];

        let outcome = BatchProcessor::new(&parser, None)
            .run(&records, &options(true), &CancelSignal::from_watch(rx))
            .await;
        drop(tx);
        assert_eq!(outcome.stats.error_records, 2);
        assert_eq!(outcome.stats.saved_records, 0);
        assert_eq!(
            outcome.errors,
            vec!["Processing cancelled at record 1: 2 records not processed".to_string()]
        );
        assert!(outcome.stats.is_balanced());
    }

    #[tokio::test]
    async fn cancellation_is_observed_at_the_next_record() {
        let parser = CsvRecordParser::new();
        let (tx, rx) = watch::channel(false);
        let store = CancellingStore {
            tx,
            after: 2,
            saves: AtomicUsize::new(0),
        };
        let records = vec![
            raw("08:00", 100, ""),
            raw("08:00", 100, ""),
            raw("08:10", 200, ""),
            raw("08:20", 300, ""),
            raw("08:30", 400, ""),
        ];

        let outcome = BatchProcessor::new(&parser, Some(&store))
            .run(&records, &options(true), &CancelSignal::from_watch(rx))
            .await;
        assert_eq!(outcome.stats.saved_records, 2);
        assert_eq!(outcome.stats.skipped_records, 1);
        assert_eq!(outcome.stats.error_records, 2);
        assert!(outcome.stats.is_balanced());
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("Processing cancelled at record 4"));
    }

    #[tokio::test]
    async fn elapsed_deadline_cancels() {
        let signal = CancelSignal::never().with_deadline(Instant::now());
        assert!(signal.is_cancelled());
        assert!(!CancelSignal::never().is_cancelled());
    }

    #[tokio::test]
    async fn missing_store_counts_records_as_saved() {
        let parser = CsvRecordParser::new();
        let records = vec![raw("08:00", 100, ""), raw("08:10", 200, "")];
        let outcome = BatchProcessor::new(&parser, None)
            .run(&records, &options(true), &CancelSignal::never())
            .await;
        assert_eq!(outcome.stats.saved_records, 2);
    }

    #[test]
    fn validate_only_counts_duplicates_ignoring_card_number() {
        let parser = CsvRecordParser::new();
        let mut invalid_dup = raw("08:00", 100, "2222");
        invalid_dup.vehicle_class = "x".into();
        let records = vec![raw("08:00", 100, "1111"), invalid_dup];

        let report = validate_records(&parser, &records);
        assert_eq!(report.duplicate_count, 1);
        assert_eq!(report.total_records, 2);
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].line_number, 3);
        assert_eq!(report.errors[0].field, "vehicle_class");
    }

    #[test]
    fn validate_only_counts_every_repeat() {
        let parser = CsvRecordParser::new();
        let records = vec![raw("08:00", 100, ""); 3];
        let report = validate_records(&parser, &records);
        assert_eq!(report.duplicate_count, 2);
        assert!(report.is_valid);
    }

    fn csv_body(rows: &[&str]) -> String {
        let mut body = format!("{HEADER}\n");
        for row in rows {
            body.push_str(row);
            body.push('\n');
        }
        body
    }

    #[tokio::test]
    async fn short_inline_data_is_rejected_before_parsing() {
        let service = IngestService::new(IngestConfig::default(), None);
        let req = ProcessCsvDataRequest {
            csv_data: "a,b,c".into(),
            account_id: String::new(),
        };
        let err = service
            .process_csv_data(Some(&req), &CancelSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
    }

    #[tokio::test]
    async fn unparseable_inline_data_is_invalid_argument() {
        let service = IngestService::new(IngestConfig::default(), None);
        let req = ProcessCsvDataRequest {
            csv_data: "not,a,toll,csv\n1,2,3,4\n".into(),
            account_id: String::new(),
        };
        let err = service
            .process_csv_data(Some(&req), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(err.message().starts_with("invalid CSV format"));
    }

    #[tokio::test]
    async fn inline_data_is_processed_into_the_store() {
        let store = Arc::new(MemoryRecordStore::new());
        let service = IngestService::new(IngestConfig::default(), Some(store.clone()));
        let req = ProcessCsvDataRequest {
            csv_data: csv_body(&[
                "2024/01/05,08:00,2024/01/05,09:00,Tokyo,Yokohama,1,1320,1111",
                "2024/01/05,08:00,2024/01/05,09:00,Tokyo,Yokohama,1,1320,1111",
                ",,2024/01/06,10:00,,Kawasaki,2,500,",
            ]),
            account_id: "acct-01".into(),
        };
        let resp = service
            .process_csv_data(Some(&req), &CancelSignal::never())
            .await
            .expect("process");
        assert!(resp.success);
        assert_eq!(resp.message, "Processed 3 records");
        assert_eq!(resp.stats.saved_records, 2);
        assert_eq!(resp.stats.skipped_records, 1);

        let saved = store.records().await;
        assert_eq!(saved[0].account_id, "acct-01");
        assert_eq!(saved[1].entry_location, None);
        assert_eq!(saved[1].timestamp, "2024-01-06T00:00:00Z");
    }

    #[tokio::test]
    async fn unresolvable_source_is_a_failed_response_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = IngestConfig {
            csv_base_path: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let service = IngestService::new(config, None);
        let resp = service
            .process_csv_file(Some(&ProcessCsvFileRequest::default()), &CancelSignal::never())
            .await
            .expect("response");
        assert!(!resp.success);
        assert!(resp.message.starts_with("Failed to resolve CSV file path"));
        assert_eq!(resp.stats, ProcessingStats::default());
        assert_eq!(resp.errors.len(), 1);
    }

    #[tokio::test]
    async fn service_uses_injected_listing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let csv_path = dir.path().join("fake.csv");
        std::fs::write(
            &csv_path,
            csv_body(&["2024/01/05,08:00,2024/01/05,09:00,Tokyo,Yokohama,1,1320,"]),
        )
        .unwrap();
        let base = PathBuf::from("/virtual");
        let config = IngestConfig {
            csv_base_path: Some(base.clone()),
            ..Default::default()
        };
        let listing = FakeListing {
            dirs: vec!["2024-03-01".into()],
            files: HashMap::from([(base.join("2024-03-01"), vec![csv_path])]),
        };
        let service = IngestService::new(config, None).with_listing(Arc::new(listing));
        let resp = service
            .process_csv_file(Some(&ProcessCsvFileRequest::default()), &CancelSignal::never())
            .await
            .expect("response");
        assert!(resp.success);
        assert_eq!(resp.message, "Processed 1 records from file");
    }

    #[test]
    fn validate_only_reports_parse_failure_as_line_zero() {
        let service = IngestService::new(IngestConfig::default(), None);
        let req = ValidateCsvDataRequest {
            csv_data: "just,some,columns\n1,2,3\n".into(),
            account_id: String::new(),
        };
        let resp = service.validate_csv_data(Some(&req)).expect("response");
        assert!(!resp.is_valid);
        assert_eq!(resp.errors[0].line_number, 0);
        assert_eq!(resp.errors[0].field, "csv");
        assert_eq!(resp.total_records, 0);
    }

    #[test]
    fn health_check_reports_version() {
        let service = IngestService::new(IngestConfig::default(), None);
        let health = service.health_check();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.version, SERVICE_VERSION);
        assert_eq!(health.details["service"], SERVICE_NAME);
        assert!(health.timestamp > 0);
    }
}
