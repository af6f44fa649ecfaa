//! Staged pipeline orchestration: ingest, dedup, pre-filter, extract,
//! generate, boost, approval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bidflow_core::{
    Attachment, CostTracker, JobStatus, PipelineJob, PipelineResult,
};
use bidflow_dedup::Deduplicator;
use bidflow_retry::RetryConfig;
use bidflow_sources::JobFeed;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "bidflow-pipeline";

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub score: i64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub title: Option<String>,
    pub description: Option<String>,
    pub budget_type: Option<String>,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    pub client_country: Option<String>,
    pub client_spent: Option<f64>,
    pub client_hires: Option<i64>,
    pub payment_verified: bool,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deliverables {
    pub proposal_doc_url: Option<String>,
    pub proposal_text: Option<String>,
    pub video_url: Option<String>,
    pub pdf_url: Option<String>,
    pub cover_letter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoostOutcome {
    pub boost: bool,
    pub reasoning: String,
    pub pricing: Option<f64>,
}

/// Relevance scoring collaborator, called once per job through the
/// scoring-API retry preset.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, job: &PipelineJob) -> anyhow::Result<ScoreOutcome>;
}

/// Deep-extraction collaborator populating budget and client fields.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, job: &PipelineJob) -> anyhow::Result<Extraction>;
}

/// Produces the proposal document, video, PDF, and cover letter.
#[async_trait]
pub trait DeliverableGenerator: Send + Sync {
    async fn generate(&self, job: &PipelineJob) -> anyhow::Result<Deliverables>;
}

#[async_trait]
pub trait BoostDecider: Send + Sync {
    async fn decide(&self, job: &PipelineJob) -> anyhow::Result<BoostOutcome>;
}

/// Posts a rendered job summary for human approval; returns the opaque
/// message handle stored as `slack_message_ts`.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn request_approval(&self, job: &PipelineJob) -> anyhow::Result<String>;
}

/// External job ledger (the persisted sheet). Upserted after every status
/// transition; failures are logged, never fatal to the run.
#[async_trait]
pub trait JobLedger: Send + Sync {
    async fn upsert(&self, job: &PipelineJob) -> anyhow::Result<()>;

    /// Write named fields on a job's row, returning the field names written.
    async fn update_fields(
        &self,
        job_id: &str,
        fields: serde_json::Map<String, Value>,
    ) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub min_score: i64,
    pub parallel: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_score: 70,
            parallel: 3,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            min_score: std::env::var("PREFILTER_MIN_SCORE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(70),
            parallel: std::env::var("PIPELINE_PARALLEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
        }
    }
}

/// The full collaborator set a pipeline run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub scorer: Arc<dyn Scorer>,
    pub extractor: Arc<dyn Extractor>,
    pub deliverables: Arc<dyn DeliverableGenerator>,
    pub boost: Arc<dyn BoostDecider>,
    pub approval: Arc<dyn ApprovalChannel>,
    pub ledger: Arc<dyn JobLedger>,
}

impl Collaborators {
    /// Deterministic fakes for mock runs and tests.
    pub fn mock() -> Self {
        Self {
            scorer: Arc::new(MockScorer::new()),
            extractor: Arc::new(MockExtractor),
            deliverables: Arc::new(MockDeliverableGenerator),
            boost: Arc::new(MockBoostDecider),
            approval: Arc::new(MockApprovalChannel),
            ledger: Arc::new(MemoryLedger::new()),
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    dedup: Deduplicator,
    collab: Arc<Collaborators>,
    scoring_retry: RetryConfig,
    document_retry: RetryConfig,
    costs: Arc<CostTracker>,
}

struct JobOutcome {
    job: PipelineJob,
    filtered: bool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, dedup: Deduplicator, collab: Collaborators) -> Self {
        Self {
            config,
            dedup,
            collab: Arc::new(collab),
            scoring_retry: RetryConfig::scoring_api(),
            document_retry: RetryConfig::document_api(),
            costs: Arc::new(CostTracker::new()),
        }
    }

    pub fn with_retry_configs(mut self, scoring: RetryConfig, document: RetryConfig) -> Self {
        self.scoring_retry = scoring;
        self.document_retry = document;
        self
    }

    pub fn costs(&self) -> &CostTracker {
        &self.costs
    }

    /// Run the staged pipeline once. Never raises: ingestion faults and
    /// per-job stage faults all land in the returned result.
    pub async fn run(&self, feed: &dyn JobFeed, limit: usize) -> PipelineResult {
        let mut result = PipelineResult::new(feed.source());
        info!(source = %result.source, limit, "pipeline run starting");

        let raw_jobs = match feed.fetch(limit).await {
            Ok(jobs) => jobs,
            Err(err) => {
                result.errors.push(format!("ingestion failed: {err}"));
                result.costs = self.costs.snapshot();
                result.finish();
                return result;
            }
        };
        result.jobs_ingested = raw_jobs.len();
        info!(count = result.jobs_ingested, "ingested jobs");

        if raw_jobs.is_empty() {
            result.costs = self.costs.snapshot();
            result.finish();
            return result;
        }

        let surviving = match self.dedup.partition_batch(&raw_jobs, true).await {
            Ok((new_jobs, duplicates)) => {
                info!(new = new_jobs.len(), duplicates = duplicates.len(), "deduplicated");
                new_jobs
            }
            Err(err) => {
                warn!("dedup store unavailable, processing all jobs: {err:#}");
                result.errors.push(format!("dedup unavailable: {err:#}"));
                raw_jobs
            }
        };

        let jobs: Vec<PipelineJob> = surviving
            .iter()
            .map(|raw| PipelineJob::from_raw(raw, feed.source()))
            .collect();
        result.jobs_after_dedup = jobs.len();

        if jobs.is_empty() {
            info!("all jobs already processed");
            result.costs = self.costs.snapshot();
            result.finish();
            return result;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.parallel.max(1)));
        let mut tasks = JoinSet::new();

        for job in jobs {
            let semaphore = semaphore.clone();
            let collab = self.collab.clone();
            let scoring_retry = self.scoring_retry.clone();
            let document_retry = self.document_retry.clone();
            let costs = self.costs.clone();
            let min_score = self.config.min_score;

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore not closed");
                process_job(job, collab, scoring_retry, document_retry, costs, min_score).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if outcome.filtered {
                        result.jobs_filtered_out += 1;
                        continue;
                    }
                    result.jobs_after_prefilter += 1;
                    result.jobs_processed += 1;
                    if outcome.job.slack_message_ts.is_some() {
                        result.jobs_sent_to_slack += 1;
                    }
                    if !outcome.job.error_log.is_empty() {
                        result.jobs_with_errors += 1;
                        for message in &outcome.job.error_log {
                            result.errors.push(format!("{}: {}", outcome.job.job_id, message));
                        }
                    }
                    result.processed_jobs.push(outcome.job);
                }
                Err(err) => {
                    result.errors.push(format!("job task failed: {err}"));
                }
            }
        }

        result.costs = self.costs.snapshot();
        result.finish();
        info!(
            ingested = result.jobs_ingested,
            after_dedup = result.jobs_after_dedup,
            after_prefilter = result.jobs_after_prefilter,
            filtered_out = result.jobs_filtered_out,
            processed = result.jobs_processed,
            sent_to_slack = result.jobs_sent_to_slack,
            with_errors = result.jobs_with_errors,
            "pipeline run complete"
        );
        result
    }

    /// Blocking entry point with identical stage semantics.
    pub fn run_blocking(&self, feed: &dyn JobFeed, limit: usize) -> PipelineResult {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(err) => {
                let mut result = PipelineResult::new(feed.source());
                result.errors.push(format!("runtime construction failed: {err}"));
                result.finish();
                return result;
            }
        };
        runtime.block_on(self.run(feed, limit))
    }
}

async fn ledger_upsert(collab: &Collaborators, job: &PipelineJob) {
    if let Err(err) = collab.ledger.upsert(job).await {
        warn!(job_id = %job.job_id, "ledger update failed: {err:#}");
    }
}

/// Drive one job through stages 3-7. Stage faults are recorded on the job,
/// never propagated; a scoring fault ends the job in `Error` since the
/// pre-filter gate cannot be evaluated.
async fn process_job(
    mut job: PipelineJob,
    collab: Arc<Collaborators>,
    scoring_retry: RetryConfig,
    document_retry: RetryConfig,
    costs: Arc<CostTracker>,
    min_score: i64,
) -> JobOutcome {
    // Stage 3: pre-filter scoring.
    job.status = JobStatus::Scoring;
    ledger_upsert(&collab, &job).await;

    costs.record_api_call();
    let scored = bidflow_retry::execute_observed(
        &scoring_retry,
        || collab.scorer.score(&job),
        |_, _, delay| costs.record_retry(delay),
    )
    .await;

    match scored {
        Ok(outcome) => {
            job.fit_score = Some(outcome.score);
            job.fit_reasoning = Some(outcome.reasoning);
        }
        Err(err) => {
            job.record_error(format!("scoring error: {err:#}"));
            job.status = JobStatus::Error;
            ledger_upsert(&collab, &job).await;
            return JobOutcome { job, filtered: false };
        }
    }

    if job.fit_score.unwrap_or(0) < min_score {
        info!(job_id = %job.job_id, score = ?job.fit_score, "job filtered out");
        job.status = JobStatus::FilteredOut;
        ledger_upsert(&collab, &job).await;
        return JobOutcome { job, filtered: true };
    }

    // Stage 4: deep extraction.
    job.status = JobStatus::Extracting;
    ledger_upsert(&collab, &job).await;

    costs.record_api_call();
    let extracted = bidflow_retry::execute_observed(
        &document_retry,
        || collab.extractor.extract(&job),
        |_, _, delay| costs.record_retry(delay),
    )
    .await;

    match extracted {
        Ok(extraction) => {
            if extraction.title.is_some() {
                job.title = extraction.title;
            }
            if extraction.description.is_some() {
                job.description = extraction.description;
            }
            job.budget_type = extraction.budget_type;
            job.budget_min = extraction.budget_min;
            job.budget_max = extraction.budget_max;
            job.client_country = extraction.client_country;
            job.client_spent = extraction.client_spent;
            job.client_hires = extraction.client_hires;
            job.payment_verified = extraction.payment_verified;
            if !extraction.attachments.is_empty() {
                let contents: Vec<&str> = extraction
                    .attachments
                    .iter()
                    .filter_map(|a| a.extracted_text.as_deref())
                    .collect();
                if !contents.is_empty() {
                    let combined: String = contents.join("\n\n").chars().take(5000).collect();
                    job.attachment_content = Some(combined);
                }
                job.attachments = extraction.attachments;
            }
        }
        Err(err) => job.record_error(format!("extraction error: {err:#}")),
    }

    // Stage 5: deliverable generation.
    job.status = JobStatus::Generating;
    ledger_upsert(&collab, &job).await;

    costs.record_api_call();
    let generated = bidflow_retry::execute_observed(
        &document_retry,
        || collab.deliverables.generate(&job),
        |_, _, delay| costs.record_retry(delay),
    )
    .await;

    match generated {
        Ok(deliverables) => {
            job.proposal_doc_url = deliverables.proposal_doc_url;
            job.proposal_text = deliverables.proposal_text;
            job.video_url = deliverables.video_url;
            job.pdf_url = deliverables.pdf_url;
            job.cover_letter = deliverables.cover_letter;
        }
        Err(err) => job.record_error(format!("deliverable error: {err:#}")),
    }

    // Stage 6: boost decision and pricing.
    job.status = JobStatus::BoostDeciding;
    ledger_upsert(&collab, &job).await;

    costs.record_api_call();
    let decided = bidflow_retry::execute_observed(
        &document_retry,
        || collab.boost.decide(&job),
        |_, _, delay| costs.record_retry(delay),
    )
    .await;

    match decided {
        Ok(outcome) => {
            job.boost_decision = Some(outcome.boost);
            job.boost_reasoning = Some(outcome.reasoning);
            job.pricing_proposed = outcome.pricing.or_else(|| midpoint_price(&job));
        }
        Err(err) => job.record_error(format!("boost decision error: {err:#}")),
    }

    // Stage 7: approval request.
    job.status = JobStatus::PendingApproval;
    ledger_upsert(&collab, &job).await;

    match collab.approval.request_approval(&job).await {
        Ok(message_ts) => {
            info!(job_id = %job.job_id, "approval request posted");
            job.slack_message_ts = Some(message_ts);
        }
        Err(err) => job.record_error(format!("approval post error: {err:#}")),
    }

    ledger_upsert(&collab, &job).await;
    JobOutcome { job, filtered: false }
}

fn midpoint_price(job: &PipelineJob) -> Option<f64> {
    match (job.budget_min, job.budget_max) {
        (Some(min), Some(max)) => Some((min + max) / 2.0),
        (Some(min), None) => Some(min),
        (None, Some(max)) => Some(max),
        (None, None) => None,
    }
}

/// Outcome of an approval callback.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalCallbackResult {
    pub success: bool,
    pub job_id: String,
    pub action: String,
    pub status: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub trigger_submission: bool,
    pub error: Option<String>,
}

impl ApprovalCallbackResult {
    fn failure(job_id: &str, action: &str, error: String) -> Self {
        Self {
            success: false,
            job_id: job_id.to_string(),
            action: action.to_string(),
            status: None,
            approved_at: None,
            trigger_submission: false,
            error: Some(error),
        }
    }
}

/// Outcome of a ledger status write.
#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub success: bool,
    pub job_id: String,
    pub status: String,
    pub fields_updated: Vec<String>,
    pub error: Option<String>,
}

/// Write a status change plus additional fields to the ledger, stamping
/// `updated_at`.
pub async fn update_job_status(
    ledger: &dyn JobLedger,
    job_id: &str,
    status: &str,
    additional: serde_json::Map<String, Value>,
) -> StatusUpdate {
    let mut fields = serde_json::Map::new();
    fields.insert("status".to_string(), json!(status));
    fields.insert("updated_at".to_string(), json!(Utc::now()));
    for (key, value) in additional {
        fields.insert(key, value);
    }

    match ledger.update_fields(job_id, fields).await {
        Ok(fields_updated) => StatusUpdate {
            success: true,
            job_id: job_id.to_string(),
            status: status.to_string(),
            fields_updated,
            error: None,
        },
        Err(err) => StatusUpdate {
            success: false,
            job_id: job_id.to_string(),
            status: status.to_string(),
            fields_updated: Vec::new(),
            error: Some(format!("{err:#}")),
        },
    }
}

/// Process a human approve/reject/edit decision against a job.
///
/// On approval the caller is signaled to invoke the submission driver via
/// `trigger_submission`; this handler never submits itself.
pub async fn process_approval(
    ledger: &dyn JobLedger,
    action: &str,
    job_id: &str,
    user_id: &str,
    channel: &str,
    message_ts: &str,
    edited_proposal: Option<&str>,
) -> ApprovalCallbackResult {
    let now = Utc::now();
    info!(job_id, action, user_id, channel, "processing approval callback");

    match action {
        "approve" => {
            let mut additional = serde_json::Map::new();
            additional.insert("approved_at".to_string(), json!(now));
            additional.insert("slack_message_ts".to_string(), json!(message_ts));

            let update = update_job_status(ledger, job_id, "approved", additional).await;
            if !update.success {
                return ApprovalCallbackResult::failure(
                    job_id,
                    action,
                    update.error.unwrap_or_else(|| "ledger update failed".to_string()),
                );
            }

            ApprovalCallbackResult {
                success: true,
                job_id: job_id.to_string(),
                action: action.to_string(),
                status: Some("approved".to_string()),
                approved_at: Some(now),
                trigger_submission: true,
                error: None,
            }
        }
        "reject" => {
            let mut additional = serde_json::Map::new();
            additional.insert("slack_message_ts".to_string(), json!(message_ts));

            let update = update_job_status(ledger, job_id, "rejected", additional).await;
            if !update.success {
                return ApprovalCallbackResult::failure(
                    job_id,
                    action,
                    update.error.unwrap_or_else(|| "ledger update failed".to_string()),
                );
            }

            ApprovalCallbackResult {
                success: true,
                job_id: job_id.to_string(),
                action: action.to_string(),
                status: Some("rejected".to_string()),
                approved_at: None,
                trigger_submission: false,
                error: None,
            }
        }
        "edit" => {
            // Stays pending while the proposal is being edited.
            if let Some(proposal) = edited_proposal {
                let mut additional = serde_json::Map::new();
                additional.insert("proposal_text".to_string(), json!(proposal));

                let update = update_job_status(ledger, job_id, "pending_approval", additional).await;
                if !update.success {
                    return ApprovalCallbackResult::failure(
                        job_id,
                        action,
                        update.error.unwrap_or_else(|| "ledger update failed".to_string()),
                    );
                }
            }

            ApprovalCallbackResult {
                success: true,
                job_id: job_id.to_string(),
                action: action.to_string(),
                status: Some("editing".to_string()),
                approved_at: None,
                trigger_submission: false,
                error: None,
            }
        }
        other => ApprovalCallbackResult::failure(job_id, other, format!("unknown action: {other}")),
    }
}

// Deterministic mock collaborators, mirroring the live ones' shapes.

pub struct MockScorer {
    calls: AtomicUsize,
}

impl MockScorer {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl Default for MockScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scorer for MockScorer {
    async fn score(&self, _job: &PipelineJob) -> anyhow::Result<ScoreOutcome> {
        // Alternating high/low scores for throughput testing.
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ScoreOutcome {
            score: if n % 2 == 0 { 85 } else { 55 },
            reasoning: "Mock scoring result".to_string(),
        })
    }
}

pub struct MockExtractor;

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(&self, _job: &PipelineJob) -> anyhow::Result<Extraction> {
        Ok(Extraction {
            budget_type: Some("fixed".to_string()),
            budget_min: Some(500.0),
            budget_max: Some(1000.0),
            client_country: Some("United States".to_string()),
            client_spent: Some(15000.0),
            client_hires: Some(25),
            payment_verified: true,
            ..Extraction::default()
        })
    }
}

pub struct MockDeliverableGenerator;

#[async_trait]
impl DeliverableGenerator for MockDeliverableGenerator {
    async fn generate(&self, job: &PipelineJob) -> anyhow::Result<Deliverables> {
        let title = job.title.as_deref().unwrap_or("Untitled");
        Ok(Deliverables {
            proposal_doc_url: Some(format!(
                "https://docs.google.com/document/d/mock_{}",
                job.job_id
            )),
            proposal_text: Some(format!("Mock proposal for {title}")),
            video_url: Some(format!("https://heygen.com/video/mock_{}", job.job_id)),
            pdf_url: Some(format!(
                "https://drive.google.com/file/d/mock_pdf_{}/view",
                job.job_id
            )),
            cover_letter: Some(format!("Mock cover letter for {title}")),
        })
    }
}

pub struct MockBoostDecider;

#[async_trait]
impl BoostDecider for MockBoostDecider {
    async fn decide(&self, job: &PipelineJob) -> anyhow::Result<BoostOutcome> {
        Ok(BoostOutcome {
            boost: job.client_spent.map(|spent| spent > 10_000.0).unwrap_or(false),
            reasoning: "Mock boost decision".to_string(),
            pricing: job.budget_max.or(job.budget_min).or(Some(100.0)),
        })
    }
}

pub struct MockApprovalChannel;

#[async_trait]
impl ApprovalChannel for MockApprovalChannel {
    async fn request_approval(&self, job: &PipelineJob) -> anyhow::Result<String> {
        Ok(format!("mock_ts_{}", job.job_id))
    }
}

/// In-memory ledger keyed by job_id. Rows are sheet-row maps.
#[derive(Default)]
pub struct MemoryLedger {
    rows: Mutex<HashMap<String, serde_json::Map<String, Value>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row(&self, job_id: &str) -> Option<serde_json::Map<String, Value>> {
        self.rows.lock().await.get(job_id).cloned()
    }
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn upsert(&self, job: &PipelineJob) -> anyhow::Result<()> {
        self.rows
            .lock()
            .await
            .insert(job.job_id.clone(), job.to_sheet_row());
        Ok(())
    }

    async fn update_fields(
        &self,
        job_id: &str,
        fields: serde_json::Map<String, Value>,
    ) -> anyhow::Result<Vec<String>> {
        let mut rows = self.rows.lock().await;
        let row = rows.entry(job_id.to_string()).or_default();
        let mut written = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            row.insert(key.clone(), value);
            written.push(key);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidflow_core::JobSource;
    use bidflow_dedup::MemorySeenStore;
    use bidflow_retry::ApiFault;
    use bidflow_sources::{ManualFeed, MockApifyFeed, MockGmailFeed};

    fn mk_pipeline(min_score: i64) -> Pipeline {
        let dedup = Deduplicator::new(Box::new(MemorySeenStore::new()));
        Pipeline::new(
            PipelineConfig {
                min_score,
                parallel: 3,
            },
            dedup,
            Collaborators::mock(),
        )
    }

    fn assert_funnel(result: &PipelineResult) {
        assert!(result.jobs_after_dedup <= result.jobs_ingested);
        assert_eq!(
            result.jobs_after_prefilter + result.jobs_filtered_out,
            result.jobs_after_dedup
        );
        assert_eq!(result.jobs_processed, result.jobs_after_prefilter);
        assert!(result.jobs_sent_to_slack <= result.jobs_processed);
    }

    #[tokio::test]
    async fn mock_apify_run_processes_single_job_end_to_end() {
        let pipeline = mk_pipeline(50);
        let result = pipeline.run(&MockApifyFeed, 1).await;

        assert_eq!(result.jobs_ingested, 1);
        assert_eq!(result.jobs_after_dedup, 1);
        assert_eq!(result.jobs_after_prefilter, 1);
        assert_eq!(result.jobs_processed, 1);
        assert_eq!(result.jobs_sent_to_slack, 1);
        assert_eq!(result.jobs_with_errors, 0);
        assert_funnel(&result);

        let job = &result.processed_jobs[0];
        assert_eq!(job.job_id, "~mock0");
        assert_eq!(job.status, JobStatus::PendingApproval);
        assert_eq!(job.fit_score, Some(85));
        assert!(job.proposal_doc_url.is_some());
        assert!(job.proposal_text.is_some());
        assert!(job.video_url.is_some());
        assert!(job.pdf_url.is_some());
        assert!(job.cover_letter.is_some());
        assert_eq!(job.boost_decision, Some(true));
        assert_eq!(job.slack_message_ts.as_deref(), Some("mock_ts_~mock0"));
        assert!(result.finished_at.is_some());
    }

    #[tokio::test]
    async fn high_threshold_filters_everything() {
        let pipeline = mk_pipeline(100);
        let result = pipeline.run(&MockApifyFeed, 1).await;

        assert_eq!(result.jobs_ingested, 1);
        assert_eq!(result.jobs_after_dedup, 1);
        assert_eq!(result.jobs_after_prefilter, 0);
        assert_eq!(result.jobs_filtered_out, 1);
        assert_eq!(result.jobs_processed, 0);
        assert_eq!(result.jobs_sent_to_slack, 0);
        assert_funnel(&result);
        assert!(result.processed_jobs.is_empty());
    }

    #[tokio::test]
    async fn funnel_arithmetic_holds_with_alternating_scores() {
        // Mock scorer alternates 85/55 around the default 70 threshold.
        let pipeline = mk_pipeline(70);
        let result = pipeline.run(&MockApifyFeed, 5).await;

        assert_eq!(result.jobs_ingested, 5);
        assert_eq!(result.jobs_after_dedup, 5);
        assert_eq!(result.jobs_after_prefilter + result.jobs_filtered_out, 5);
        assert_eq!(result.jobs_after_prefilter, 3);
        assert_eq!(result.jobs_filtered_out, 2);
        assert_eq!(result.jobs_sent_to_slack, 3);
        assert_funnel(&result);
    }

    #[tokio::test]
    async fn gmail_mock_run_uses_job_id_key() {
        let pipeline = mk_pipeline(50);
        let result = pipeline.run(&MockGmailFeed, 10).await;

        assert_eq!(result.jobs_ingested, 1);
        assert_eq!(result.processed_jobs[0].job_id, "~gmailmock1");
        assert_eq!(result.processed_jobs[0].source, JobSource::Gmail);
    }

    #[tokio::test]
    async fn duplicate_ids_in_one_ingest_collapse() {
        let feed = ManualFeed::new(vec![
            json!({"job_id": "~dup", "url": "https://www.upwork.com/jobs/~dup", "source": "manual"}),
            json!({"job_id": "~dup", "url": "https://www.upwork.com/jobs/~dup", "source": "manual"}),
        ]);
        let pipeline = mk_pipeline(50);
        let result = pipeline.run(&feed, 10).await;

        assert_eq!(result.jobs_ingested, 2);
        assert_eq!(result.jobs_after_dedup, 1);
        assert_funnel(&result);
    }

    #[tokio::test]
    async fn second_run_skips_already_processed_jobs() {
        let pipeline = mk_pipeline(50);
        let first = pipeline.run(&MockApifyFeed, 2).await;
        assert_eq!(first.jobs_after_dedup, 2);

        let second = pipeline.run(&MockApifyFeed, 2).await;
        assert_eq!(second.jobs_ingested, 2);
        assert_eq!(second.jobs_after_dedup, 0);
        assert_eq!(second.jobs_processed, 0);
    }

    struct FailingScorer {
        fail_for: String,
    }

    #[async_trait]
    impl Scorer for FailingScorer {
        async fn score(&self, job: &PipelineJob) -> anyhow::Result<ScoreOutcome> {
            if job.job_id == self.fail_for {
                Err(anyhow::Error::new(ApiFault::InvalidRequest(
                    "malformed job payload".into(),
                )))
            } else {
                Ok(ScoreOutcome {
                    score: 90,
                    reasoning: "fine".to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn one_failing_job_does_not_affect_the_others() {
        let mut collab = Collaborators::mock();
        collab.scorer = Arc::new(FailingScorer {
            fail_for: "~mock1".to_string(),
        });
        let dedup = Deduplicator::new(Box::new(MemorySeenStore::new()));
        let pipeline = Pipeline::new(
            PipelineConfig {
                min_score: 50,
                parallel: 2,
            },
            dedup,
            collab,
        );

        let result = pipeline.run(&MockApifyFeed, 3).await;

        assert_eq!(result.jobs_ingested, 3);
        assert_eq!(result.jobs_processed, 3);
        assert_eq!(result.jobs_with_errors, 1);
        assert_eq!(result.jobs_sent_to_slack, 2);
        assert_funnel(&result);

        let failed = result
            .processed_jobs
            .iter()
            .find(|j| j.job_id == "~mock1")
            .expect("failed job present");
        assert_eq!(failed.status, JobStatus::Error);
        assert!(!failed.error_log.is_empty());
        assert!(result.errors.iter().any(|e| e.contains("~mock1")));
    }

    struct FailingDeliverables {
        fail_for: Vec<String>,
    }

    #[async_trait]
    impl DeliverableGenerator for FailingDeliverables {
        async fn generate(&self, job: &PipelineJob) -> anyhow::Result<Deliverables> {
            if self.fail_for.contains(&job.job_id) {
                Err(anyhow::Error::new(ApiFault::InvalidRequest(
                    "document service rejected the job".into(),
                )))
            } else {
                MockDeliverableGenerator.generate(job).await
            }
        }
    }

    #[tokio::test]
    async fn deliverable_faults_keep_funnel_counts_exact_under_parallelism() {
        let mut collab = Collaborators::mock();
        collab.deliverables = Arc::new(FailingDeliverables {
            fail_for: vec!["~mock1".to_string(), "~mock3".to_string()],
        });
        let dedup = Deduplicator::new(Box::new(MemorySeenStore::new()));
        let pipeline = Pipeline::new(
            PipelineConfig {
                min_score: 50,
                parallel: 4,
            },
            dedup,
            collab,
        );

        let result = pipeline.run(&MockApifyFeed, 4).await;

        assert_eq!(result.jobs_ingested, 4);
        assert_eq!(result.jobs_after_dedup, 4);
        assert_eq!(result.jobs_filtered_out, 0);
        assert_eq!(result.jobs_processed, 4);
        assert_eq!(result.jobs_with_errors, 2);
        // A deliverable fault is recorded but does not stop the approval ask.
        assert_eq!(result.jobs_sent_to_slack, 4);
        assert_funnel(&result);

        for id in ["~mock1", "~mock3"] {
            let job = result
                .processed_jobs
                .iter()
                .find(|j| j.job_id == id)
                .expect("job present");
            assert!(job.error_log.iter().any(|e| e.contains("deliverable error")));
        }
    }

    #[test]
    fn blocking_entry_point_matches_async_semantics() {
        let pipeline = mk_pipeline(50);
        let result = pipeline.run_blocking(&MockApifyFeed, 1);

        assert_eq!(result.jobs_processed, 1);
        assert_eq!(result.jobs_sent_to_slack, 1);
        assert_funnel(&result);
    }

    #[tokio::test]
    async fn costs_are_tracked_per_run() {
        let pipeline = mk_pipeline(50);
        let result = pipeline.run(&MockApifyFeed, 1).await;

        // Scoring, extraction, deliverables, boost.
        assert_eq!(result.costs.api_calls, 4);
        assert_eq!(result.costs.retries, 0);
    }

    #[tokio::test]
    async fn approval_approve_sets_timestamp_and_triggers_submission() {
        let ledger = MemoryLedger::new();
        let result =
            process_approval(&ledger, "approve", "~job1", "U123", "C01", "1712.0001", None).await;

        assert!(result.success);
        assert_eq!(result.status.as_deref(), Some("approved"));
        assert!(result.approved_at.is_some());
        assert!(result.trigger_submission);

        let row = ledger.row("~job1").await.expect("row written");
        assert_eq!(row["status"], json!("approved"));
        assert_eq!(row["slack_message_ts"], json!("1712.0001"));
        assert!(row.contains_key("approved_at"));
        assert!(row.contains_key("updated_at"));
    }

    #[tokio::test]
    async fn approval_reject_does_not_trigger_submission() {
        let ledger = MemoryLedger::new();
        let result =
            process_approval(&ledger, "reject", "~job2", "U123", "C01", "1712.0002", None).await;

        assert!(result.success);
        assert_eq!(result.status.as_deref(), Some("rejected"));
        assert!(result.approved_at.is_none());
        assert!(!result.trigger_submission);

        let row = ledger.row("~job2").await.expect("row written");
        assert_eq!(row["status"], json!("rejected"));
    }

    #[tokio::test]
    async fn approval_edit_threads_proposal_text() {
        let ledger = MemoryLedger::new();
        let result = process_approval(
            &ledger,
            "edit",
            "~job3",
            "U123",
            "C01",
            "1712.0003",
            Some("sharper pitch"),
        )
        .await;

        assert!(result.success);
        assert_eq!(result.status.as_deref(), Some("editing"));
        assert!(!result.trigger_submission);

        let row = ledger.row("~job3").await.expect("row written");
        assert_eq!(row["status"], json!("pending_approval"));
        assert_eq!(row["proposal_text"], json!("sharper pitch"));
    }

    #[tokio::test]
    async fn approval_unknown_action_fails_without_ledger_write() {
        let ledger = MemoryLedger::new();
        let result =
            process_approval(&ledger, "shrug", "~job4", "U123", "C01", "1712.0004", None).await;

        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or_default().contains("unknown action"));
        assert!(ledger.row("~job4").await.is_none());
    }

    #[tokio::test]
    async fn status_update_reports_written_fields() {
        let ledger = MemoryLedger::new();
        let mut additional = serde_json::Map::new();
        additional.insert("submitted_at".to_string(), json!(Utc::now()));

        let update = update_job_status(&ledger, "~job5", "submitted", additional).await;
        assert!(update.success);
        assert!(update.fields_updated.contains(&"status".to_string()));
        assert!(update.fields_updated.contains(&"updated_at".to_string()));
        assert!(update.fields_updated.contains(&"submitted_at".to_string()));
    }
}
