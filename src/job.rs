//! Job queue wire types.
//!
//! A job is one command batch routed to one worker. These types are the
//! shared vocabulary of the sender, the server and the worker; their JSON
//! shape is the protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Lifecycle of a job on the queue. Terminal states: `Done`, `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

/// One queued command batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Host application type this job must run in (e.g. "tvpaint")
    pub host_name: String,
    /// Batch payload: `{workfile, function: "commands", commands: [...]}`
    pub data: Value,
    pub state: JobState,
    #[serde(default)]
    pub message: Option<String>,
    /// Per-command results reported by the worker
    #[serde(default)]
    pub result: Option<Value>,
}

impl Job {
    pub fn new(host_name: impl Into<String>, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            host_name: host_name.into(),
            data,
            state: JobState::Queued,
            message: None,
            result: None,
        }
    }

    /// Status snapshot polled by senders.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            state: self.state,
            done: self.state.is_terminal(),
            message: self.message.clone(),
            result: self.result.clone(),
        }
    }
}

/// Snapshot of a job's progress, as served by `GET /api/jobs/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    /// Set once the job reached a terminal state
    pub done: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

/// Messages a worker sends to the server over its TCP link.
///
/// One JSON object per line, `type` field as discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First message after connecting; announces which host the worker runs
    RegisterWorker { host_name: String },
    /// Final report for the job the worker was executing
    JobDone {
        worker_id: String,
        job_id: String,
        success: bool,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        data: Option<Value>,
    },
}

/// Messages the server sends to a worker over its TCP link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Registration ack carrying the server-assigned worker id
    Registered { worker_id: String },
    /// Assigns a job; the worker must answer with `job_done` eventually
    StartJob { job: Job },
}

/// Structured failures of a job round trip.
///
/// `Failed` carries the full status payload for diagnostics; everything
/// transport-level stays an ordinary error.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job failed: {}", .0.message.as_deref().unwrap_or("no message"))]
    Failed(JobStatus),

    #[error("job did not finish within {timeout_secs} s")]
    Timeout { timeout_secs: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_serde_lowercase() {
        assert_eq!(serde_json::to_string(&JobState::Queued).unwrap(), "\"queued\"");
        let state: JobState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(state, JobState::Failed);
    }

    #[test]
    fn test_worker_message_wire_shape() {
        let msg = WorkerMessage::RegisterWorker {
            host_name: "tvpaint".to_string(),
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], "register_worker");
        assert_eq!(wire["host_name"], "tvpaint");

        let parsed: ServerMessage =
            serde_json::from_str("{\"type\":\"registered\",\"worker_id\":\"w1\"}").unwrap();
        match parsed {
            ServerMessage::Registered { worker_id } => assert_eq!(worker_id, "w1"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_status_done_follows_terminal_state() {
        let mut job = Job::new("tvpaint", serde_json::json!({}));
        assert!(!job.status().done);
        job.state = JobState::Running;
        assert!(!job.status().done);
        job.state = JobState::Failed;
        assert!(job.status().done);
        job.state = JobState::Done;
        assert!(job.status().done);
    }
}
