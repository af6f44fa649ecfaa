//! Browser-driven proposal submission: apply-URL rewrite, form fill, and
//! success detection over a pluggable page abstraction.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bidflow_core::extract_url_token;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "bidflow-submit";

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("browser profile directory is required for persistent auth")]
    MissingProfile,
    #[error("no job token in URL: {0}")]
    NoJobToken(String),
}

/// State of one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Navigated,
    FormFilled,
    Submitted,
    Success,
    Failed,
    Error,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Navigated => "navigated",
            SubmissionStatus::FormFilled => "form_filled",
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::Success => "success",
            SubmissionStatus::Failed => "failed",
            SubmissionStatus::Error => "error",
        }
    }
}

/// Outcome of a submission attempt. Expected failure modes land in `error`
/// and `error_log`, never in a raised error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub job_id: String,
    pub job_url: String,
    pub status: SubmissionStatus,
    pub apply_url: Option<String>,
    pub error: Option<String>,
    pub error_log: Vec<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmation_message: Option<String>,

    pub cover_letter_filled: bool,
    pub price_set: bool,
    pub video_attached: bool,
    pub pdf_attached: bool,
    pub boost_applied: bool,
}

impl SubmissionResult {
    pub fn new(job_id: impl Into<String>, job_url: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_url: job_url.into(),
            status: SubmissionStatus::Pending,
            apply_url: None,
            error: None,
            error_log: Vec::new(),
            submitted_at: None,
            confirmation_message: None,
            cover_letter_filled: false,
            price_set: false,
            video_attached: false,
            pdf_attached: false,
            boost_applied: false,
        }
    }

    /// SUCCESS implies a timestamp and no error.
    fn mark_success(&mut self, confirmation: impl Into<String>) {
        self.status = SubmissionStatus::Success;
        self.submitted_at = Some(Utc::now());
        self.confirmation_message = Some(confirmation.into());
        self.error = None;
    }

    /// FAILED implies an error and no timestamp.
    fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = SubmissionStatus::Failed;
        self.error = Some(error.into());
        self.submitted_at = None;
    }

    fn mark_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.error_log.push(error.clone());
        self.status = SubmissionStatus::Error;
        self.error = Some(error);
    }

    fn log_issue(&mut self, message: impl Into<String>) {
        self.error_log.push(message.into());
    }

    /// Flat ledger update for the job row after a submission attempt.
    pub fn to_sheet_update(&self) -> serde_json::Map<String, Value> {
        let status = if self.status == SubmissionStatus::Success {
            "submitted"
        } else {
            "submission_failed"
        };
        let error_log = if self.error_log.is_empty() {
            Value::Null
        } else {
            json!(serde_json::to_string(&self.error_log).unwrap_or_default())
        };

        let mut row = serde_json::Map::new();
        row.insert("status".into(), json!(status));
        row.insert("submitted_at".into(), json!(self.submitted_at));
        row.insert("error_log".into(), error_log);
        row
    }
}

fn host_of(url: &str) -> &str {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let host = rest.split('/').next().unwrap_or(rest);
    if host.is_empty() {
        "www.upwork.com"
    } else {
        host
    }
}

/// Rewrite a job URL to its apply-page URL, preserving the host.
pub fn job_url_to_apply_url(job_url: &str) -> Result<String, SubmitError> {
    let token =
        extract_url_token(job_url).ok_or_else(|| SubmitError::NoJobToken(job_url.to_string()))?;
    Ok(format!(
        "https://{}/nx/proposals/job/{token}/apply/",
        host_of(job_url)
    ))
}

// Ordered alternatives per form element; the first match on the page wins.

pub const COVER_LETTER_SELECTORS: &[&str] = &[
    r#"[data-test="cover-letter-textarea"]"#,
    r#"textarea[name="coverLetter"]"#,
    "#cover-letter",
    r#"textarea[placeholder*="cover letter"]"#,
    r#"textarea[placeholder*="proposal"]"#,
    ".cover-letter-textarea",
    r#"[data-cy="cover-letter"]"#,
];

pub const RATE_INPUT_SELECTORS: &[&str] = &[
    r#"[data-test="rate-input"]"#,
    r#"input[name="rate"]"#,
    r#"input[name="hourlyRate"]"#,
    r#"input[name="amount"]"#,
    r#"input[name="bid"]"#,
    r#"[data-test="bid-amount"]"#,
    ".rate-input",
    r#"input[type="number"][placeholder*="rate"]"#,
];

pub const FIXED_PRICE_SELECTORS: &[&str] = &[
    r#"[data-test="fixed-price-input"]"#,
    r#"input[name="fixedPrice"]"#,
    r#"input[name="projectBid"]"#,
    r#"[data-test="project-bid"]"#,
];

pub const FILE_INPUT_SELECTORS: &[&str] = &[
    r#"input[type="file"]"#,
    r#"[data-test="file-upload-input"]"#,
    ".file-upload input",
    r#"input[accept*="pdf"]"#,
    r#"input[accept*="video"]"#,
];

pub const BOOST_TOGGLE_SELECTORS: &[&str] = &[
    r#"[data-test="boost-checkbox"]"#,
    r#"[data-test="boost-toggle"]"#,
    r#"input[name="boost"]"#,
    ".boost-toggle",
    r#"[data-cy="boost"]"#,
    r#"label:has-text("Boost")"#,
];

pub const SUBMIT_BUTTON_SELECTORS: &[&str] = &[
    r#"[data-test="submit-proposal"]"#,
    r#"button[type="submit"]"#,
    r#"button:has-text("Submit")"#,
    r#"button:has-text("Apply")"#,
    r#"button:has-text("Send Proposal")"#,
    ".submit-proposal",
    r#"[data-cy="submit-proposal"]"#,
];

pub const SUCCESS_MESSAGE_SELECTORS: &[&str] = &[
    r#"[data-test="proposal-submitted"]"#,
    ".success-message",
    r#":has-text("Proposal submitted")"#,
    r#":has-text("Application sent")"#,
    r#":has-text("Your proposal has been submitted")"#,
    r#"[data-test="success"]"#,
];

pub const ERROR_MESSAGE_SELECTORS: &[&str] = &[
    r#"[data-test="error-message"]"#,
    ".error-message",
    ".alert-danger",
    r#"[role="alert"]"#,
    ".form-error",
    r#":has-text("error")"#,
    r#":has-text("failed")"#,
];

pub const APPLY_FORM_SELECTORS: &[&str] = &[
    r#"[data-test="proposal-form"]"#,
    r#"form[name="proposal"]"#,
    ".proposal-form",
    "#apply-form",
    r#"[data-cy="proposal-form"]"#,
];

/// Seam to the headless browser. Each operation tries an ordered selector
/// list and reports whether any alternative matched.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&mut self, url: &str) -> anyhow::Result<()>;
    async fn current_url(&self) -> String;
    async fn exists(&self, selectors: &[&str]) -> bool;
    async fn fill_first(&mut self, selectors: &[&str], text: &str) -> anyhow::Result<bool>;
    async fn click_first(&mut self, selectors: &[&str]) -> anyhow::Result<bool>;
    async fn upload_first(&mut self, selectors: &[&str], path: &Path) -> anyhow::Result<bool>;
    async fn text_of_first(&self, selectors: &[&str]) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Video,
    Pdf,
}

impl AttachmentKind {
    fn label(&self) -> &'static str {
        match self {
            AttachmentKind::Video => "video",
            AttachmentKind::Pdf => "pdf",
        }
    }
}

/// Everything one full submission needs.
#[derive(Debug, Clone, Default)]
pub struct SubmissionRequest {
    pub job_url: String,
    pub proposal_text: String,
    pub pricing_proposed: Option<f64>,
    pub is_hourly: bool,
    pub video_path: Option<PathBuf>,
    pub pdf_path: Option<PathBuf>,
    pub should_boost: bool,
}

/// Drives a proposal through the apply form.
///
/// Authentication comes entirely from the persistent profile directory; the
/// driver never performs a login flow.
pub struct Submitter<P: BrowserPage> {
    profile_dir: PathBuf,
    page: P,
}

impl<P: BrowserPage> Submitter<P> {
    pub fn new(profile_dir: impl Into<PathBuf>, page: P) -> Result<Self, SubmitError> {
        let profile_dir = profile_dir.into();
        if profile_dir.as_os_str().is_empty() {
            return Err(SubmitError::MissingProfile);
        }
        Ok(Self { profile_dir, page })
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    /// Open the apply page for a job. Terminal ERROR on a login redirect or
    /// a missing form.
    pub async fn navigate_to_apply_page(&mut self, job_url: &str) -> SubmissionResult {
        let job_id = extract_url_token(job_url).unwrap_or_else(|| "unknown".to_string());
        let mut result = SubmissionResult::new(job_id, job_url);

        let apply_url = if job_url.contains("/apply") {
            job_url.to_string()
        } else {
            match job_url_to_apply_url(job_url) {
                Ok(url) => url,
                Err(err) => {
                    result.mark_error(err.to_string());
                    return result;
                }
            }
        };
        result.apply_url = Some(apply_url.clone());

        info!(url = %apply_url, "navigating to apply page");
        if let Err(err) = self.page.goto(&apply_url).await {
            result.mark_error(format!("navigation error: {err:#}"));
            return result;
        }

        let current = self.page.current_url().await;
        let lowered = current.to_lowercase();
        if lowered.contains("login") || lowered.contains("signin") {
            result.log_issue("redirected to login page".to_string());
            result.status = SubmissionStatus::Error;
            result.error =
                Some("login required, browser profile may not have a valid session".to_string());
            return result;
        }

        let form_present = self.page.exists(APPLY_FORM_SELECTORS).await
            || self.page.exists(COVER_LETTER_SELECTORS).await;
        if !form_present {
            result.log_issue(format!("current URL: {current}"));
            result.status = SubmissionStatus::Error;
            result.error = Some("apply form not found on page".to_string());
            return result;
        }

        result.status = SubmissionStatus::Navigated;
        result
    }

    /// Fill the cover letter. Missing field is a logged issue, not fatal.
    pub async fn fill_cover_letter(&mut self, result: &mut SubmissionResult, text: &str) {
        match self.page.fill_first(COVER_LETTER_SELECTORS, text).await {
            Ok(true) => result.cover_letter_filled = true,
            Ok(false) => result.log_issue("could not find cover letter field".to_string()),
            Err(err) => result.log_issue(format!("error filling cover letter: {err:#}")),
        }
    }

    /// Upload an attachment. Missing local file or input is non-fatal.
    pub async fn attach_file(
        &mut self,
        result: &mut SubmissionResult,
        path: &Path,
        kind: AttachmentKind,
    ) {
        if !path.exists() {
            result.log_issue(format!("file not found: {}", path.display()));
            return;
        }

        match self.page.upload_first(FILE_INPUT_SELECTORS, path).await {
            Ok(true) => match kind {
                AttachmentKind::Video => result.video_attached = true,
                AttachmentKind::Pdf => result.pdf_attached = true,
            },
            Ok(false) => {
                result.log_issue(format!("could not find file input for {}", kind.label()))
            }
            Err(err) => result.log_issue(format!("error attaching {}: {err:#}", kind.label())),
        }
    }

    /// Set the rate or fixed price, falling back to the opposite input
    /// family when the primary is absent.
    pub async fn set_proposed_price(
        &mut self,
        result: &mut SubmissionResult,
        amount: f64,
        is_hourly: bool,
    ) {
        let (primary, fallback) = if is_hourly {
            (RATE_INPUT_SELECTORS, FIXED_PRICE_SELECTORS)
        } else {
            (FIXED_PRICE_SELECTORS, RATE_INPUT_SELECTORS)
        };
        let text = amount.to_string();

        let filled = match self.page.fill_first(primary, &text).await {
            Ok(true) => true,
            Ok(false) => matches!(self.page.fill_first(fallback, &text).await, Ok(true)),
            Err(err) => {
                result.log_issue(format!("error setting price: {err:#}"));
                return;
            }
        };

        if filled {
            result.price_set = true;
        } else {
            result.log_issue("could not find rate/price input field".to_string());
        }
    }

    /// Toggle boost when requested; an absent toggle is non-fatal.
    pub async fn apply_boost(&mut self, result: &mut SubmissionResult, should_boost: bool) {
        if !should_boost {
            return;
        }

        match self.page.click_first(BOOST_TOGGLE_SELECTORS).await {
            Ok(true) => result.boost_applied = true,
            Ok(false) => {
                result.log_issue("boost toggle not found (may not be available)".to_string())
            }
            Err(err) => result.log_issue(format!("error applying boost: {err:#}")),
        }
    }

    /// Click submit, then poll success indicator, error indicator, and
    /// finally URL hints to decide the terminal status.
    pub async fn submit_proposal(&mut self, result: &mut SubmissionResult) {
        if result.cover_letter_filled {
            result.status = SubmissionStatus::FormFilled;
        }

        let clicked = match self.page.click_first(SUBMIT_BUTTON_SELECTORS).await {
            Ok(clicked) => clicked,
            Err(err) => {
                result.mark_error(format!("submission error: {err:#}"));
                return;
            }
        };
        if !clicked {
            result.status = SubmissionStatus::Error;
            result.error = Some("could not find or click submit button".to_string());
            return;
        }
        result.status = SubmissionStatus::Submitted;

        if let Some(text) = self.page.text_of_first(SUCCESS_MESSAGE_SELECTORS).await {
            let confirmation = if text.is_empty() {
                "proposal submitted successfully".to_string()
            } else {
                text
            };
            info!(job_id = %result.job_id, "submission succeeded");
            result.mark_success(confirmation);
            return;
        }

        if let Some(text) = self.page.text_of_first(ERROR_MESSAGE_SELECTORS).await {
            let error = if text.is_empty() {
                "unknown form error".to_string()
            } else {
                text
            };
            warn!(job_id = %result.job_id, error = %error, "submission failed");
            result.log_issue(format!("form error: {error}"));
            result.mark_failed(error);
            return;
        }

        let current = self.page.current_url().await.to_lowercase();
        if current.contains("success") || current.contains("submitted") || current.contains("proposals")
        {
            result.mark_success("redirected to success/proposals page");
            return;
        }

        result.log_issue(format!("final URL: {current}"));
        result.mark_failed("could not determine submission result");
    }

    /// Full workflow in fixed order. Only a navigation fault short-circuits;
    /// later steps are best-effort and never block the submit click.
    pub async fn submit_full_application(&mut self, request: &SubmissionRequest) -> SubmissionResult {
        let mut result = self.navigate_to_apply_page(&request.job_url).await;
        if result.status == SubmissionStatus::Error {
            return result;
        }

        self.fill_cover_letter(&mut result, &request.proposal_text).await;

        if let Some(amount) = request.pricing_proposed {
            self.set_proposed_price(&mut result, amount, request.is_hourly).await;
        }
        if let Some(path) = &request.video_path {
            self.attach_file(&mut result, path, AttachmentKind::Video).await;
        }
        if let Some(path) = &request.pdf_path {
            self.attach_file(&mut result, path, AttachmentKind::Pdf).await;
        }
        if request.should_boost {
            self.apply_boost(&mut result, true).await;
        }

        self.submit_proposal(&mut result).await;
        result
    }
}
