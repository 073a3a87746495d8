//! Blocking HTTP client for the job queue server.
//!
//! Submitting is a single POST; completion is plain fixed-interval polling of
//! the status endpoint. Deliberately coarse - render jobs run for minutes,
//! a 300 ms poll is noise - and synchronous, matching the publish process
//! that calls it.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::debug;
use serde_json::Value;

use crate::job::{JobError, JobStatus};

/// Interval between two status polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Client handle for one job queue server.
#[derive(Debug)]
pub struct JobQueueClient {
    server_url: String,
    http: reqwest::blocking::Client,
    /// Overall wait budget for [`JobQueueClient::wait_for_job`];
    /// `None` polls forever
    timeout: Option<Duration>,
}

impl JobQueueClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let mut server_url = server_url.into();
        while server_url.ends_with('/') {
            server_url.pop();
        }
        Self {
            server_url,
            http: reqwest::blocking::Client::new(),
            timeout: None,
        }
    }

    /// Limit how long [`JobQueueClient::wait_for_job`] may poll.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Submit a job payload, returning the server-assigned job id.
    ///
    /// The payload travels flattened next to `host_name`; the server nests
    /// it back under the job record's `data`.
    pub fn send_job(&self, host_name: &str, data: Value) -> Result<String> {
        let mut body = data;
        match body.as_object_mut() {
            Some(map) => {
                map.insert("host_name".to_string(), Value::String(host_name.to_string()));
            }
            None => bail!("job payload must be a JSON object"),
        }
        let url = format!("{}/api/jobs", self.server_url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .with_context(|| format!("failed to reach job queue server at {}", url))?;
        if !response.status().is_success() {
            bail!("job submission rejected: HTTP {}", response.status());
        }

        let payload: Value = response.json().context("invalid job submission response")?;
        let job_id = payload
            .get("job_id")
            .and_then(|v| v.as_str())
            .context("job submission response misses \"job_id\"")?;
        debug!("Submitted job {} to {}", job_id, self.server_url);
        Ok(job_id.to_string())
    }

    /// Fetch the current status of a job.
    pub fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        let url = format!("{}/api/jobs/{}", self.server_url, job_id);
        let response = self
            .http
            .get(&url)
            .send()
            .with_context(|| format!("failed to reach job queue server at {}", url))?;
        if !response.status().is_success() {
            bail!("job status request failed: HTTP {}", response.status());
        }
        response.json().context("invalid job status response")
    }

    /// Block until the job reaches a terminal state.
    ///
    /// Returns the final status on success; a failed job surfaces as
    /// [`JobError::Failed`] with the full status payload, an exceeded wait
    /// budget as [`JobError::Timeout`].
    pub fn wait_for_job(&self, job_id: &str) -> Result<JobStatus> {
        let started = Instant::now();
        loop {
            let status = self.job_status(job_id)?;
            if status.done {
                if status.state == crate::job::JobState::Done {
                    return Ok(status);
                }
                return Err(JobError::Failed(status).into());
            }

            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    return Err(JobError::Timeout {
                        timeout_secs: timeout.as_secs(),
                    }
                    .into());
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
