//! # Pipeline
//!
//! `RecordPipeline` runs one fetch, dedupe, transform and upload cycle for a single source. The
//! source and target specific parts are provided through the `Fetcher`, `Transformer`,
//! `PostProcessor` and `TargetApi` traits.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use http::StatusCode;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{SourceError, TargetError};
use crate::events::PumpLogger;
use crate::payload::{Payload, TestValue};

pub const DEFAULT_MISSING_DATA_PATTERN: &str = r#"Missing data for tests: (?P<tests>[^"\]\}]+)"#;

static DEFAULT_MISSING_DATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(DEFAULT_MISSING_DATA_PATTERN).unwrap());

#[async_trait]
pub trait Fetcher<R>: Send + Sync {
    /// Records to consider for upload, in processing order.
    async fn fetch_records(&self) -> Result<Vec<R>, SourceError>;
}

/// Turns a record into the pieces of an upload.
pub trait Transformer<R>: Send + Sync {
    /// Idempotency key of the record. Records describing the same event must map to the same key.
    fn id_for_record(&self, record: &R) -> String;

    /// Name of the unit the record belongs to, `None` if it cannot be determined.
    fn unit_for_record(&self, record: &R) -> Option<String>;

    fn test_list_for_record(&self, record: &R) -> String;

    fn work_datetimes_for_record(&self, record: &R) -> (NaiveDateTime, NaiveDateTime);

    fn test_values_from_record(
        &self,
        record: &R,
    ) -> Result<BTreeMap<String, TestValue>, SourceError>;

    fn comment_for_record(&self, _record: &R) -> Option<String> {
        None
    }
}

/// Side effect run after a record was uploaded, e.g. moving its source file away.
#[async_trait]
pub trait PostProcessor<R>: Send + Sync {
    async fn post_process(&self, record: &R) -> Result<(), SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResponse {
    pub status: StatusCode,
    pub body: String,
}

#[async_trait]
pub trait TargetApi: Send + Sync {
    async fn is_already_recorded(&self, key: &str) -> Result<bool, TargetError>;

    /// Reference of the single collection records of `unit` and `test_list` are uploaded into. Fails
    /// unless exactly one matches.
    async fn resolve_upload_target(&self, unit: &str, test_list: &str)
        -> Result<String, TargetError>;

    async fn upload(&self, payload: &Payload) -> Result<UploadResponse, TargetError>;
}

/// Extracts the names of tests the target reported as missing from a rejected upload.
///
/// The pattern must have a capture group named `tests`, or a first group, holding a comma
/// separated list of test names.
#[derive(Debug, Clone)]
pub struct MissingDataRule {
    pattern: Regex,
}

impl MissingDataRule {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn missing_tests(&self, body: &str) -> Vec<String> {
        let Some(captures) = self.pattern.captures(body) else {
            return Vec::new();
        };

        captures
            .name("tests")
            .or_else(|| captures.get(1))
            .map(|tests| {
                tests
                    .as_str()
                    .split(',')
                    .map(|t| t.trim().trim_matches(|c| c == '\'' || c == '"'))
                    .filter(|t| !t.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MissingDataRule {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_MISSING_DATA.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Fixed delay before each record, rate limiting calls to the target.
    pub throttle: Duration,
    /// Retry uploads rejected for missing test data once, with the missing tests skipped.
    pub autoskip: bool,
    pub missing_data: MissingDataRule,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(500),
            autoskip: false,
            missing_data: MissingDataRule::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub fetched: usize,
    pub processed: usize,
    pub uploaded: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub autoskip_retries: usize,
    pub cancelled: bool,
}

impl CycleStats {
    pub fn summary(&self) -> String {
        if self.fetched == 0 {
            return "No new records found".to_owned();
        }
        format!(
            "Processed {} records: {} uploaded, {} already recorded, {} skipped, {} failed",
            self.processed, self.uploaded, self.duplicates, self.skipped, self.failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub summary: String,
    pub stats: CycleStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Uploaded,
    Duplicate,
    Skipped,
    Failed,
}

/// Result of resolving an upload target, remembered for the rest of a cycle.
#[derive(Debug, Clone)]
enum TargetLookup {
    Found(String),
    Failed { critical: bool, message: String },
}

pub struct RecordPipeline<R> {
    logger: PumpLogger,
    fetcher: Arc<dyn Fetcher<R>>,
    transformer: Arc<dyn Transformer<R>>,
    post_processor: Option<Arc<dyn PostProcessor<R>>>,
    target: Arc<dyn TargetApi>,
    options: PipelineOptions,
}

impl<R: Send + Sync> RecordPipeline<R> {
    pub fn new(
        logger: PumpLogger,
        fetcher: Arc<dyn Fetcher<R>>,
        transformer: Arc<dyn Transformer<R>>,
        target: Arc<dyn TargetApi>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            logger,
            fetcher,
            transformer,
            post_processor: None,
            target,
            options,
        }
    }

    pub fn with_post_processor(mut self, post_processor: Arc<dyn PostProcessor<R>>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run one cycle. Cancellation is checked between records: the record in flight is finished,
    /// the remaining ones are left for a later cycle.
    pub async fn run(&self, cancel: &CancellationToken) -> CycleOutcome {
        let started = Instant::now();
        let labels = [("pump", self.logger.pump().to_owned())];

        let records = match self.fetcher.fetch_records().await {
            Ok(records) => records,
            Err(e) => {
                self.logger
                    .critical(format!("Failed to fetch records: {e}"));
                Vec::new()
            }
        };

        let mut stats = CycleStats {
            fetched: records.len(),
            ..CycleStats::default()
        };
        let mut targets = HashMap::new();
        let total = records.len();

        for (idx, record) in records.iter().enumerate() {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    stats.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(self.options.throttle) => {}
            }

            metrics::counter!("pump_records_total", &labels).increment(1);
            let outcome = self.process(record, &mut targets, &mut stats).await;
            stats.processed += 1;
            match outcome {
                RecordOutcome::Uploaded => {
                    stats.uploaded += 1;
                    metrics::counter!("pump_records_uploaded", &labels).increment(1);
                }
                RecordOutcome::Duplicate => {
                    stats.duplicates += 1;
                    metrics::counter!("pump_records_duplicate", &labels).increment(1);
                }
                RecordOutcome::Skipped => {
                    stats.skipped += 1;
                    metrics::counter!("pump_records_skipped", &labels).increment(1);
                }
                RecordOutcome::Failed => {
                    stats.failed += 1;
                    metrics::counter!("pump_upload_failures", &labels).increment(1);
                }
            }

            self.logger.progress(((idx + 1) * 100 / total) as f64);
        }

        if stats.cancelled {
            self.logger.warning(format!(
                "Cycle cancelled after {} of {} records",
                stats.processed, total
            ));
        }

        metrics::histogram!("pump_cycle_duration_seconds", &labels)
            .record(started.elapsed().as_secs_f64());

        let summary = stats.summary();
        self.logger.complete(summary.clone());
        CycleOutcome { summary, stats }
    }

    async fn process(
        &self,
        record: &R,
        targets: &mut HashMap<(String, String), TargetLookup>,
        stats: &mut CycleStats,
    ) -> RecordOutcome {
        let key = self.transformer.id_for_record(record);

        match self.target.is_already_recorded(&key).await {
            Ok(true) => {
                self.logger
                    .info(format!("Skipping {key}: already recorded"));
                return RecordOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => self.logger.error(format!(
                "Could not check whether {key} was already recorded, uploading anyway: {e}"
            )),
        }

        let Some(unit) = self.transformer.unit_for_record(record) else {
            self.logger
                .error(format!("Skipping {key}: unable to determine its unit"));
            return RecordOutcome::Skipped;
        };
        let test_list = self.transformer.test_list_for_record(record);

        let lookup = match targets.get(&(unit.clone(), test_list.clone())) {
            Some(lookup) => lookup.clone(),
            None => {
                let lookup = match self.target.resolve_upload_target(&unit, &test_list).await {
                    Ok(reference) => TargetLookup::Found(reference),
                    Err(e) => TargetLookup::Failed {
                        critical: e.is_ambiguous(),
                        message: e.to_string(),
                    },
                };
                targets.insert((unit.clone(), test_list.clone()), lookup.clone());
                lookup
            }
        };
        let reference = match lookup {
            TargetLookup::Found(reference) => reference,
            TargetLookup::Failed { critical, message } => {
                let message = format!("Skipping {key}: {message}");
                if critical {
                    self.logger.critical(message);
                } else {
                    self.logger.error(message);
                }
                return RecordOutcome::Skipped;
            }
        };

        let tests = match self.transformer.test_values_from_record(record) {
            Ok(tests) => tests,
            Err(e) => {
                self.logger
                    .error(format!("Failed to read test values of {key}: {e}"));
                return RecordOutcome::Failed;
            }
        };
        let (work_started, work_completed) = self.transformer.work_datetimes_for_record(record);

        let mut payload = Payload {
            unit_test_collection: reference,
            work_started,
            work_completed,
            tests,
            comment: self.transformer.comment_for_record(record),
            key: key.clone(),
        };

        let response = match self.target.upload(&payload).await {
            Ok(response) => response,
            Err(e) => {
                self.logger
                    .critical(format!("Failed to upload {key}: {e}"));
                return RecordOutcome::Failed;
            }
        };
        if response.status.is_success() {
            return self.uploaded(record, &key).await;
        }

        if self.options.autoskip && response.status.is_client_error() {
            let missing = self.options.missing_data.missing_tests(&response.body);
            if !missing.is_empty() {
                self.logger.info(format!(
                    "Upload of {key} is missing data for {}, retrying with them skipped",
                    missing.join(", ")
                ));
                stats.autoskip_retries += 1;
                let labels = [("pump", self.logger.pump().to_owned())];
                metrics::counter!("pump_autoskip_retries", &labels).increment(1);

                payload.skip_tests(&missing);
                return match self.target.upload(&payload).await {
                    Ok(retry) if retry.status.is_success() => self.uploaded(record, &key).await,
                    Ok(retry) => self.rejected(&key, &retry),
                    Err(e) => {
                        self.logger
                            .critical(format!("Failed to upload {key}: {e}"));
                        RecordOutcome::Failed
                    }
                };
            }
        }

        self.rejected(&key, &response)
    }

    async fn uploaded(&self, record: &R, key: &str) -> RecordOutcome {
        self.logger.info(format!("Uploaded {key}"));

        if let Some(post_processor) = &self.post_processor {
            if let Err(e) = post_processor.post_process(record).await {
                self.logger
                    .error(format!("Post processing of {key} failed: {e}"));
            }
        }
        RecordOutcome::Uploaded
    }

    fn rejected(&self, key: &str, response: &UploadResponse) -> RecordOutcome {
        self.logger.error(format!(
            "Upload of {key} was rejected with status {}: {}",
            response.status, response.body
        ));
        RecordOutcome::Failed
    }
}
