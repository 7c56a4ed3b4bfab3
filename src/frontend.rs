use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::routes::TestCaseResult;
use crate::verdict::Verdict;

/// Bounded retry budget for 502 responses.
const GATEWAY_RETRIES: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Terminal report body: a single verdict for aborted submissions, the
/// per-case array otherwise.
#[derive(Serialize, Debug)]
#[serde(untagged)]
pub enum Report {
    Verdict { verdict: Verdict },
    Cases { test_case_results: Vec<TestCaseResult> },
}

#[derive(Deserialize)]
struct ChecksumResponse {
    checksum: String,
}

/// Authenticated HTTP client for the frontend.
#[derive(Clone)]
pub struct Frontend {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl Frontend {
    pub fn new(base_url: String, secret_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            secret_key,
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.http.get(url).header("X-Auth-Token", &self.secret_key)
    }

    /// The checksum the frontend currently advertises for a task.
    pub async fn task_checksum(&self, task_id: &str) -> Result<String> {
        let url = format!("{}/task/{}/info/checksum", self.base_url, task_id);
        let response = self.get_with_gateway_retry(&url).await?;
        let body: ChecksumResponse = response
            .json()
            .await
            .with_context(|| format!("malformed checksum response for task {task_id}"))?;
        Ok(body.checksum)
    }

    /// Streams the task-info payload to `dest` without buffering it whole.
    pub async fn download_task_info(&self, task_id: &str, dest: &Path) -> Result<()> {
        let url = format!("{}/task/{}/info", self.base_url, task_id);
        let mut response = self.get_with_gateway_retry(&url).await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create snapshot file {}", dest.display()))?;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Posts the terminal report for a submission.
    ///
    /// 502s burn the bounded retry budget with doubling backoff; connection
    /// errors retry forever, because a terminal verdict must be delivered
    /// at least once.
    pub async fn report(&self, submission_id: i64, report: &Report) -> Result<()> {
        let url = format!("{}/submission/{}/report", self.base_url, submission_id);
        let mut gateway_attempts = 0;

        loop {
            let result = self
                .http
                .post(&url)
                .header("X-Auth-Token", &self.secret_key)
                .json(report)
                .send()
                .await;

            match result {
                Ok(response) if response.status() == reqwest::StatusCode::BAD_GATEWAY => {
                    gateway_attempts += 1;
                    if gateway_attempts > GATEWAY_RETRIES {
                        bail!("report for submission {submission_id} kept hitting 502");
                    }
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(gateway_attempts - 1)).await;
                }
                Ok(response) => {
                    response.error_for_status()?;
                    return Ok(());
                }
                Err(e) if e.is_connect() => {
                    log::warn!(
                        "report for submission {submission_id} could not connect, retrying: {e}"
                    );
                    tokio::time::sleep(BACKOFF_BASE).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn get_with_gateway_retry(&self, url: &str) -> Result<reqwest::Response> {
        let mut gateway_attempts = 0;
        loop {
            let response = self.get(url).send().await?;
            if response.status() == reqwest::StatusCode::BAD_GATEWAY
                && gateway_attempts < GATEWAY_RETRIES
            {
                gateway_attempts += 1;
                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(gateway_attempts - 1)).await;
                continue;
            }
            return Ok(response.error_for_status()?);
        }
    }
}
