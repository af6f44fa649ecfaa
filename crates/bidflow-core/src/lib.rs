//! Core domain model for the Bidflow application pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidflow-core";

/// Ingestion channel a job arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Apify,
    Gmail,
    Manual,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Apify => "apify",
            JobSource::Gmail => "gmail",
            JobSource::Manual => "manual",
        }
    }
}

impl std::fmt::Display for JobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "apify" => Ok(JobSource::Apify),
            "gmail" => Ok(JobSource::Gmail),
            "manual" => Ok(JobSource::Manual),
            other => Err(format!("unknown job source: {other}")),
        }
    }
}

/// Lifecycle status of a job inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    New,
    Scoring,
    FilteredOut,
    Extracting,
    Generating,
    BoostDeciding,
    PendingApproval,
    Approved,
    Rejected,
    Submitted,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Scoring => "scoring",
            JobStatus::FilteredOut => "filtered_out",
            JobStatus::Extracting => "extracting",
            JobStatus::Generating => "generating",
            JobStatus::BoostDeciding => "boost_deciding",
            JobStatus::PendingApproval => "pending_approval",
            JobStatus::Approved => "approved",
            JobStatus::Rejected => "rejected",
            JobStatus::Submitted => "submitted",
            JobStatus::Error => "error",
        }
    }

    /// Terminal records must not be further mutated by the orchestrator.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Submitted | JobStatus::Rejected | JobStatus::FilteredOut
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub extracted_text: Option<String>,
}

/// Column order of the flattened ledger row. Every column is always present.
pub const SHEET_COLUMNS: &[&str] = &[
    "job_id",
    "source",
    "status",
    "title",
    "url",
    "description",
    "attachments",
    "budget_type",
    "budget_min",
    "budget_max",
    "client_country",
    "client_spent",
    "client_hires",
    "payment_verified",
    "fit_score",
    "fit_reasoning",
    "proposal_doc_url",
    "proposal_text",
    "video_url",
    "pdf_url",
    "boost_decision",
    "boost_reasoning",
    "pricing_proposed",
    "slack_message_ts",
    "approved_at",
    "submitted_at",
    "error_log",
];

const DESCRIPTION_COLUMN_MAX: usize = 1000;
const PROPOSAL_COLUMN_MAX: usize = 2000;

/// One candidate job moving through the pipeline stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub job_id: String,
    pub url: String,
    pub source: JobSource,
    pub status: JobStatus,

    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub attachment_content: Option<String>,

    pub fit_score: Option<i64>,
    pub fit_reasoning: Option<String>,

    pub budget_type: Option<String>,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    pub client_country: Option<String>,
    pub client_spent: Option<f64>,
    pub client_hires: Option<i64>,
    pub payment_verified: bool,

    pub proposal_doc_url: Option<String>,
    pub proposal_text: Option<String>,
    pub video_url: Option<String>,
    pub pdf_url: Option<String>,
    pub cover_letter: Option<String>,

    pub boost_decision: Option<bool>,
    pub boost_reasoning: Option<String>,
    pub pricing_proposed: Option<f64>,

    pub slack_message_ts: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub error_log: Vec<String>,
}

impl PipelineJob {
    pub fn new(job_id: impl Into<String>, url: impl Into<String>, source: JobSource) -> Self {
        Self {
            job_id: job_id.into(),
            url: url.into(),
            source,
            status: JobStatus::New,
            title: None,
            description: None,
            attachments: Vec::new(),
            attachment_content: None,
            fit_score: None,
            fit_reasoning: None,
            budget_type: None,
            budget_min: None,
            budget_max: None,
            client_country: None,
            client_spent: None,
            client_hires: None,
            payment_verified: false,
            proposal_doc_url: None,
            proposal_text: None,
            video_url: None,
            pdf_url: None,
            cover_letter: None,
            boost_decision: None,
            boost_reasoning: None,
            pricing_proposed: None,
            slack_message_ts: None,
            approved_at: None,
            submitted_at: None,
            error_log: Vec::new(),
        }
    }

    /// Normalize a loosely-shaped raw feed record into a job.
    ///
    /// Feeds are not consistent about the identifier key: it may arrive under
    /// `job_id`, `id`, or `uid`, or only embedded in the URL as a `~token`.
    /// Downstream stages only ever see the canonical `job_id` field.
    pub fn from_raw(raw: &Value, source: JobSource) -> Self {
        let url = raw
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let job_id = ["job_id", "id", "uid"]
            .iter()
            .find_map(|key| raw.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .filter(|id| !id.is_empty())
            .or_else(|| extract_url_token(&url))
            .unwrap_or_default();

        let mut job = Self::new(job_id, url, source);
        job.title = raw
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);
        job.description = raw
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        job
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_log.push(message.into());
    }

    /// Flatten to the fixed ledger row, keyed by [`SHEET_COLUMNS`] names.
    /// Absent values become JSON null; no key is ever missing.
    pub fn to_sheet_row(&self) -> serde_json::Map<String, Value> {
        let attachments = if self.attachments.is_empty() {
            json!("[]")
        } else {
            let names: Vec<&str> = self.attachments.iter().map(|a| a.filename.as_str()).collect();
            json!(serde_json::to_string(&names).unwrap_or_else(|_| "[]".to_string()))
        };
        let error_log = if self.error_log.is_empty() {
            Value::Null
        } else {
            json!(serde_json::to_string(&self.error_log).unwrap_or_default())
        };

        let mut row = serde_json::Map::new();
        row.insert("job_id".into(), json!(self.job_id));
        row.insert("source".into(), json!(self.source.as_str()));
        row.insert("status".into(), json!(self.status.as_str()));
        row.insert("title".into(), json!(self.title));
        row.insert("url".into(), json!(self.url));
        row.insert(
            "description".into(),
            json!(self.description.as_deref().map(|d| truncate_chars(d, DESCRIPTION_COLUMN_MAX))),
        );
        row.insert("attachments".into(), attachments);
        row.insert("budget_type".into(), json!(self.budget_type));
        row.insert("budget_min".into(), json!(self.budget_min));
        row.insert("budget_max".into(), json!(self.budget_max));
        row.insert("client_country".into(), json!(self.client_country));
        row.insert("client_spent".into(), json!(self.client_spent));
        row.insert("client_hires".into(), json!(self.client_hires));
        row.insert("payment_verified".into(), json!(self.payment_verified));
        row.insert("fit_score".into(), json!(self.fit_score));
        row.insert("fit_reasoning".into(), json!(self.fit_reasoning));
        row.insert("proposal_doc_url".into(), json!(self.proposal_doc_url));
        row.insert(
            "proposal_text".into(),
            json!(self.proposal_text.as_deref().map(|p| truncate_chars(p, PROPOSAL_COLUMN_MAX))),
        );
        row.insert("video_url".into(), json!(self.video_url));
        row.insert("pdf_url".into(), json!(self.pdf_url));
        row.insert("boost_decision".into(), json!(self.boost_decision));
        row.insert("boost_reasoning".into(), json!(self.boost_reasoning));
        row.insert("pricing_proposed".into(), json!(self.pricing_proposed));
        row.insert("slack_message_ts".into(), json!(self.slack_message_ts));
        row.insert("approved_at".into(), json!(self.approved_at));
        row.insert("submitted_at".into(), json!(self.submitted_at));
        row.insert("error_log".into(), error_log);
        row
    }

    /// Row values in [`SHEET_COLUMNS`] order.
    pub fn sheet_row_values(&self) -> Vec<Value> {
        let row = self.to_sheet_row();
        SHEET_COLUMNS
            .iter()
            .map(|col| row.get(*col).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Pull a `~token` job identifier out of a job URL, keeping the tilde.
pub fn extract_url_token(url: &str) -> Option<String> {
    let start = url.find('~')?;
    let rest = &url[start + 1..];
    let token: String = rest.chars().take_while(|c| c.is_ascii_alphanumeric()).collect();
    if token.is_empty() {
        None
    } else {
        Some(format!("~{token}"))
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Aggregate statistics for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub source: JobSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub jobs_ingested: usize,
    pub jobs_after_dedup: usize,
    pub jobs_after_prefilter: usize,
    pub jobs_filtered_out: usize,
    pub jobs_processed: usize,
    pub jobs_sent_to_slack: usize,
    pub jobs_with_errors: usize,
    pub processed_jobs: Vec<PipelineJob>,
    pub errors: Vec<String>,
    pub costs: CostSnapshot,
}

impl PipelineResult {
    pub fn new(source: JobSource) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source,
            started_at: Utc::now(),
            finished_at: None,
            jobs_ingested: 0,
            jobs_after_dedup: 0,
            jobs_after_prefilter: 0,
            jobs_filtered_out: 0,
            jobs_processed: 0,
            jobs_sent_to_slack: 0,
            jobs_with_errors: 0,
            processed_jobs: Vec::new(),
            errors: Vec::new(),
            costs: CostSnapshot::default(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

/// Run-scoped usage accounting, shared across concurrent job pipelines.
///
/// Owned by the run that created it; read out as a [`CostSnapshot`] when the
/// run finishes. Never a process-wide global, so concurrent runs and tests
/// stay independent.
#[derive(Debug, Default)]
pub struct CostTracker {
    api_calls: AtomicU64,
    retries: AtomicU64,
    retry_delay_ms: AtomicU64,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_api_call(&self) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, delay: Duration) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.retry_delay_ms
            .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CostSnapshot {
        CostSnapshot {
            api_calls: self.api_calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            total_retry_delay_secs: self.retry_delay_ms.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub api_calls: u64,
    pub retries: u64,
    pub total_retry_delay_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_record_accepts_either_id_key() {
        let with_job_id = json!({"job_id": "~abc", "url": "https://www.upwork.com/jobs/~abc"});
        let with_id = json!({"id": "~abc", "url": "https://www.upwork.com/jobs/~abc"});

        let a = PipelineJob::from_raw(&with_job_id, JobSource::Gmail);
        let b = PipelineJob::from_raw(&with_id, JobSource::Apify);
        assert_eq!(a.job_id, "~abc");
        assert_eq!(b.job_id, "~abc");
        assert_eq!(a.status, JobStatus::New);
    }

    #[test]
    fn raw_record_falls_back_to_url_token() {
        let raw = json!({
            "url": "https://www.upwork.com/jobs/Some-Title_~01abc123",
            "title": "Some Title"
        });
        let job = PipelineJob::from_raw(&raw, JobSource::Apify);
        assert_eq!(job.job_id, "~01abc123");
        assert_eq!(job.title.as_deref(), Some("Some Title"));
    }

    #[test]
    fn sheet_row_has_every_column_defined() {
        let job = PipelineJob::new("~x", "https://www.upwork.com/jobs/~x", JobSource::Apify);
        let row = job.to_sheet_row();

        assert_eq!(row.len(), SHEET_COLUMNS.len());
        for col in SHEET_COLUMNS {
            assert!(row.contains_key(*col), "missing column {col}");
        }
        assert_eq!(row["status"], json!("new"));
        assert_eq!(row["attachments"], json!("[]"));
        assert_eq!(row["fit_score"], Value::Null);
    }

    #[test]
    fn sheet_row_truncates_long_text() {
        let mut job = PipelineJob::new("~x", "u", JobSource::Manual);
        job.description = Some("d".repeat(5000));
        job.proposal_text = Some("p".repeat(5000));
        let row = job.to_sheet_row();

        assert_eq!(row["description"].as_str().map(str::len), Some(1000));
        assert_eq!(row["proposal_text"].as_str().map(str::len), Some(2000));
    }

    #[test]
    fn sheet_row_values_follow_column_order() {
        let job = PipelineJob::new("~x", "u", JobSource::Gmail);
        let values = job.sheet_row_values();
        assert_eq!(values.len(), SHEET_COLUMNS.len());
        assert_eq!(values[0], json!("~x"));
        assert_eq!(values[1], json!("gmail"));
    }

    #[test]
    fn terminal_statuses_are_exactly_three() {
        let terminal: Vec<JobStatus> = [
            JobStatus::New,
            JobStatus::Scoring,
            JobStatus::FilteredOut,
            JobStatus::Extracting,
            JobStatus::Generating,
            JobStatus::BoostDeciding,
            JobStatus::PendingApproval,
            JobStatus::Approved,
            JobStatus::Rejected,
            JobStatus::Submitted,
            JobStatus::Error,
        ]
        .into_iter()
        .filter(JobStatus::is_terminal)
        .collect();

        assert_eq!(
            terminal,
            vec![JobStatus::FilteredOut, JobStatus::Rejected, JobStatus::Submitted]
        );
    }

    #[test]
    fn result_round_trips_through_json() {
        let mut result = PipelineResult::new(JobSource::Apify);
        result.jobs_ingested = 3;
        result.jobs_after_dedup = 2;
        result.jobs_after_prefilter = 1;
        result.jobs_filtered_out = 1;
        result.jobs_processed = 1;
        let mut job = PipelineJob::new("~1", "u", JobSource::Apify);
        job.status = JobStatus::PendingApproval;
        result.processed_jobs.push(job);
        result.finish();

        let text = serde_json::to_string(&result).expect("serialize");
        let back: PipelineResult = serde_json::from_str(&text).expect("deserialize");

        assert_eq!(back.jobs_ingested, 3);
        assert_eq!(back.processed_jobs.len(), 1);
        assert_eq!(back.processed_jobs[0].status, JobStatus::PendingApproval);
        assert!(back.finished_at.is_some());
    }

    #[test]
    fn cost_tracker_accumulates() {
        let tracker = CostTracker::new();
        tracker.record_api_call();
        tracker.record_api_call();
        tracker.record_retry(Duration::from_millis(1500));

        let snap = tracker.snapshot();
        assert_eq!(snap.api_calls, 2);
        assert_eq!(snap.retries, 1);
        assert!((snap.total_retry_delay_secs - 1.5).abs() < 1e-9);
    }

    #[test]
    fn url_token_extraction() {
        assert_eq!(
            extract_url_token("https://www.upwork.com/jobs/~123"),
            Some("~123".to_string())
        );
        assert_eq!(
            extract_url_token("https://www.upwork.com/jobs/Some-Title_~01abc123"),
            Some("~01abc123".to_string())
        );
        assert_eq!(extract_url_token("https://www.upwork.com/jobs/plain"), None);
    }
}
