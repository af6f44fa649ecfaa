//! Job ingestion feeds: mock feeds per source plus a thin Apify actor client.

use anyhow::Context;
use async_trait::async_trait;
use bidflow_core::JobSource;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "bidflow-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A channel that produces raw job records. Records are loosely shaped;
/// normalization into [`bidflow_core::PipelineJob`] happens downstream.
#[async_trait]
pub trait JobFeed: Send + Sync {
    fn source(&self) -> JobSource;

    /// Fetch up to `limit` raw job records.
    async fn fetch(&self, limit: usize) -> Result<Vec<Value>, SourceError>;
}

/// Deterministic stand-in for the Apify scraper. IDs carry a fixed `~mock`
/// prefix under the `id` key, matching the scraper's output shape.
#[derive(Debug, Default)]
pub struct MockApifyFeed;

#[async_trait]
impl JobFeed for MockApifyFeed {
    fn source(&self) -> JobSource {
        JobSource::Apify
    }

    async fn fetch(&self, limit: usize) -> Result<Vec<Value>, SourceError> {
        let jobs = (0..limit.min(5))
            .map(|i| {
                json!({
                    "id": format!("~mock{i}"),
                    "url": format!("https://www.upwork.com/jobs/~mock{i}"),
                    "title": format!("Mock Job {i}"),
                    "description": format!("Description for mock job {i}"),
                    "source": "apify",
                })
            })
            .collect();
        Ok(jobs)
    }
}

/// Deterministic stand-in for the inbox monitor. Uses the `job_id` key.
#[derive(Debug, Default)]
pub struct MockGmailFeed;

#[async_trait]
impl JobFeed for MockGmailFeed {
    fn source(&self) -> JobSource {
        JobSource::Gmail
    }

    async fn fetch(&self, _limit: usize) -> Result<Vec<Value>, SourceError> {
        Ok(vec![json!({
            "job_id": "~gmailmock1",
            "url": "https://www.upwork.com/jobs/~gmailmock1",
            "title": "Gmail Mock Job",
            "description": "Description from Gmail",
            "source": "gmail",
        })])
    }
}

/// Pre-provided jobs, for manual runs triggered with an explicit job list.
#[derive(Debug, Default)]
pub struct ManualFeed {
    jobs: Vec<Value>,
}

impl ManualFeed {
    pub fn new(jobs: Vec<Value>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl JobFeed for ManualFeed {
    fn source(&self) -> JobSource {
        JobSource::Manual
    }

    async fn fetch(&self, limit: usize) -> Result<Vec<Value>, SourceError> {
        Ok(self.jobs.iter().take(limit).cloned().collect())
    }
}

const APIFY_BASE_URL: &str = "https://api.apify.com/v2";

#[derive(Debug, Error)]
pub enum ApifyError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("apify api error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("apify run ended as {0}")]
    RunFailed(String),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunData {
    pub id: String,
    pub status: String,
    pub default_dataset_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScraperInput {
    search_keywords: Vec<String>,
    results_limit: usize,
}

/// Minimal Apify platform client: start an actor run, long-poll for
/// completion, fetch the dataset.
pub struct ApifyClient {
    client: reqwest::Client,
    token: String,
}

impl ApifyClient {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
        }
    }

    pub async fn start_run(
        &self,
        actor_id: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<RunData, ApifyError> {
        let input = ScraperInput {
            search_keywords: keywords.to_vec(),
            results_limit: limit,
        };

        let url = format!("{APIFY_BASE_URL}/acts/{actor_id}/runs");
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&input)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApifyError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let api_resp: ApiResponse<RunData> = resp.json().await?;
        Ok(api_resp.data)
    }

    /// Poll until the run completes, using `waitForFinish` long-polling.
    pub async fn wait_for_run(&self, run_id: &str) -> Result<RunData, ApifyError> {
        loop {
            let url = format!("{APIFY_BASE_URL}/actor-runs/{run_id}?waitForFinish=60");
            let resp = self.client.get(&url).bearer_auth(&self.token).send().await?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ApifyError::Api {
                    status: status.as_u16(),
                    message: body,
                });
            }

            let api_resp: ApiResponse<RunData> = resp.json().await?;
            match api_resp.data.status.as_str() {
                "SUCCEEDED" => return Ok(api_resp.data),
                "FAILED" | "ABORTED" | "TIMED-OUT" => {
                    return Err(ApifyError::RunFailed(api_resp.data.status));
                }
                _ => {
                    debug!(run_id, status = %api_resp.data.status, "run still in progress");
                    continue;
                }
            }
        }
    }

    pub async fn dataset_items<T: DeserializeOwned>(
        &self,
        dataset_id: &str,
    ) -> Result<Vec<T>, ApifyError> {
        let url = format!("{APIFY_BASE_URL}/datasets/{dataset_id}/items?format=json");
        let resp = self.client.get(&url).bearer_auth(&self.token).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApifyError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(resp.json().await?)
    }
}

/// Live Apify feed: runs the scraper actor end to end per fetch.
pub struct ApifyFeed {
    client: ApifyClient,
    actor_id: String,
    keywords: Vec<String>,
}

impl ApifyFeed {
    pub fn new(token: String, actor_id: String, keywords: Vec<String>) -> Self {
        Self {
            client: ApifyClient::new(token),
            actor_id,
            keywords,
        }
    }
}

#[async_trait]
impl JobFeed for ApifyFeed {
    fn source(&self) -> JobSource {
        JobSource::Apify
    }

    async fn fetch(&self, limit: usize) -> Result<Vec<Value>, SourceError> {
        info!(actor_id = %self.actor_id, limit, "starting apify scrape run");
        let run = self
            .client
            .start_run(&self.actor_id, &self.keywords, limit)
            .await
            .map_err(anyhow::Error::new)
            .context("starting apify run")?;

        let completed = self
            .client
            .wait_for_run(&run.id)
            .await
            .map_err(anyhow::Error::new)
            .context("waiting for apify run")?;

        let mut items: Vec<Value> = self
            .client
            .dataset_items(&completed.default_dataset_id)
            .await
            .map_err(anyhow::Error::new)
            .context("fetching apify dataset")?;

        items.truncate(limit);
        for item in &mut items {
            if let Some(map) = item.as_object_mut() {
                map.insert("source".to_string(), json!("apify"));
            }
        }
        info!(count = items.len(), "apify scrape complete");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_apify_feed_caps_at_five_and_uses_id_key() {
        let feed = MockApifyFeed;
        assert_eq!(feed.source(), JobSource::Apify);

        let jobs = feed.fetch(10).await.expect("fetch");
        assert_eq!(jobs.len(), 5);
        assert_eq!(jobs[0]["id"], "~mock0");
        assert!(jobs[0].get("job_id").is_none());

        let jobs = feed.fetch(2).await.expect("fetch");
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn mock_gmail_feed_uses_job_id_key() {
        let feed = MockGmailFeed;
        let jobs = feed.fetch(10).await.expect("fetch");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["job_id"], "~gmailmock1");
        assert_eq!(feed.source(), JobSource::Gmail);
    }

    #[test]
    fn source_error_keeps_apify_cause_downcastable() {
        let cause = ApifyError::RunFailed("ABORTED".to_string());
        let err: SourceError = anyhow::Error::new(cause)
            .context("waiting for apify run")
            .into();

        assert!(err.to_string().contains("waiting for apify run"));
        let SourceError::Anyhow(inner) = err;
        assert!(inner.downcast_ref::<ApifyError>().is_some());
    }

    #[tokio::test]
    async fn manual_feed_respects_limit() {
        let feed = ManualFeed::new(vec![
            json!({"job_id": "~a", "url": "u"}),
            json!({"job_id": "~b", "url": "u"}),
            json!({"job_id": "~c", "url": "u"}),
        ]);
        let jobs = feed.fetch(2).await.expect("fetch");
        assert_eq!(jobs.len(), 2);
        assert_eq!(feed.source(), JobSource::Manual);
    }
}
