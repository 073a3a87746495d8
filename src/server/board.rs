//! Shared job queue state.
//!
//! One board per server process, shared between the HTTP handlers (submit,
//! status) and the worker connections (take, finish). Plain `Arc<Mutex>`;
//! every operation is a short critical section, nothing blocks while holding
//! the lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde_json::Value;

use crate::job::{Job, JobState, JobStatus};

#[derive(Default)]
struct BoardInner {
    /// Job ids in submission order, still waiting for a worker
    queued: VecDeque<String>,
    jobs: HashMap<String, Job>,
}

/// Thread-shared queue of jobs plus their full records.
#[derive(Clone, Default)]
pub struct JobBoard {
    inner: Arc<Mutex<BoardInner>>,
}

impl JobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a new job, returning its id.
    pub fn submit(&self, host_name: &str, data: Value) -> String {
        let job = Job::new(host_name, data);
        let job_id = job.id.clone();
        let mut inner = self.inner.lock().unwrap();
        inner.queued.push_back(job_id.clone());
        inner.jobs.insert(job_id.clone(), job);
        info!("Queued job {} for host \"{}\"", job_id, host_name);
        job_id
    }

    /// Status snapshot of one job, `None` for unknown ids.
    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(job_id).map(Job::status)
    }

    /// Hand out the oldest queued job matching `host_name`, marking it
    /// running. Jobs for other hosts keep their queue position.
    pub fn take_job(&self, host_name: &str) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.queued.iter().position(|job_id| {
            inner
                .jobs
                .get(job_id)
                .is_some_and(|job| job.host_name == host_name)
        })?;
        let job_id = inner.queued.remove(index)?;
        let job = inner.jobs.get_mut(&job_id)?;
        job.state = JobState::Running;
        Some(job.clone())
    }

    /// Record a worker's final report for a job.
    ///
    /// A job already in a terminal state keeps it: a late report from a
    /// worker whose link dropped mid-job must not flip a failure a sender
    /// may have observed.
    pub fn finish(&self, job_id: &str, success: bool, message: Option<String>, result: Option<Value>) {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(job_id) {
            Some(job) if job.state.is_terminal() => {
                warn!(
                    "Ignoring finish report for job {} already {:?}",
                    job_id, job.state
                );
            }
            Some(job) => {
                job.state = if success { JobState::Done } else { JobState::Failed };
                job.message = message;
                job.result = result;
                info!("Job {} finished: {:?}", job_id, job.state);
            }
            None => warn!("Finish report for unknown job {}", job_id),
        }
    }

    /// Fail a job whose worker went away mid-run.
    pub fn fail_abandoned(&self, job_id: &str) {
        self.finish(
            job_id,
            false,
            Some("worker disconnected during job".to_string()),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_submit_take_finish_lifecycle() {
        let board = JobBoard::new();
        let job_id = board.submit("tvpaint", json!({"workfile": "w.tvpp"}));

        let status = board.status(&job_id).unwrap();
        assert_eq!(status.state, JobState::Queued);
        assert!(!status.done);

        let job = board.take_job("tvpaint").unwrap();
        assert_eq!(job.id, job_id);
        assert_eq!(board.status(&job_id).unwrap().state, JobState::Running);

        board.finish(&job_id, true, None, Some(json!([{"id": "c1"}])));
        let status = board.status(&job_id).unwrap();
        assert_eq!(status.state, JobState::Done);
        assert!(status.done);
        assert!(status.result.is_some());
    }

    #[test]
    fn test_take_job_filters_by_host() {
        let board = JobBoard::new();
        board.submit("harmony", json!({}));
        let tvpaint_id = board.submit("tvpaint", json!({}));

        // The older harmony job stays queued for its own host
        let job = board.take_job("tvpaint").unwrap();
        assert_eq!(job.id, tvpaint_id);
        assert!(board.take_job("tvpaint").is_none());
        assert!(board.take_job("harmony").is_some());
    }

    #[test]
    fn test_fifo_within_host() {
        let board = JobBoard::new();
        let first = board.submit("tvpaint", json!({}));
        let second = board.submit("tvpaint", json!({}));
        assert_eq!(board.take_job("tvpaint").unwrap().id, first);
        assert_eq!(board.take_job("tvpaint").unwrap().id, second);
    }

    #[test]
    fn test_abandoned_job_fails_with_message() {
        let board = JobBoard::new();
        let job_id = board.submit("tvpaint", json!({}));
        board.take_job("tvpaint").unwrap();
        board.fail_abandoned(&job_id);

        let status = board.status(&job_id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.message.unwrap().contains("disconnected"));
    }

    /// A worker reconnecting after a dropped link may still deliver its
    /// report; the failure the sender observed must stand
    #[test]
    fn test_late_report_cannot_revive_terminal_job() {
        let board = JobBoard::new();
        let job_id = board.submit("tvpaint", json!({}));
        board.take_job("tvpaint").unwrap();
        board.fail_abandoned(&job_id);

        board.finish(&job_id, true, None, Some(json!([{"id": "c1"}])));

        let status = board.status(&job_id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.result.is_none());
        assert!(status.message.unwrap().contains("disconnected"));
    }

    #[test]
    fn test_unknown_job_status_is_none() {
        let board = JobBoard::new();
        assert!(board.status("nope").is_none());
    }
}
