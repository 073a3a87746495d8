//! Worker process: executes command batches inside a host application.
//!
//! One worker serves one running host instance. It keeps a persistent TCP
//! line-JSON link to the job queue server, registers with its host name and
//! waits for `start_job` assignments. Jobs execute on a separate thread so
//! the link stays responsive; the worker holds at most one job at a time and
//! answers a second assignment with an immediate failure instead of
//! replacing the running one.
//!
//! A failing job is reported and does not kill the worker; a dead host
//! process does, as there is nothing left to execute in.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, bounded};
use log::{debug, info, warn};
use serde_json::Value;

use crate::commands::{ExecutionContext, ProcessorCommands};
use crate::communicator::Communicator;
use crate::job::{Job, ServerMessage, WorkerMessage};
use crate::server::worker_port;

/// Delay before retrying a lost server connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const READ_POLL: Duration = Duration::from_millis(300);

/// Connection lifecycle of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Trying to reach the server
    Connecting,
    /// Registered and serving jobs
    Connected,
    /// Link lost, waiting to reconnect
    Disconnected,
    /// Shut down for good (stop requested or host died)
    Stopped,
}

/// Completion report of the job execution thread.
struct JobOutcome {
    job_id: String,
    /// Host binding handed back after the run
    communicator: Box<dyn Communicator>,
    success: bool,
    message: Option<String>,
    data: Option<Value>,
}

pub struct Worker {
    server_url: String,
    host_name: String,
    context: ExecutionContext,
    /// Present while idle; moved into the execution thread during a job
    communicator: Option<Box<dyn Communicator>>,
    state: ConnectionState,
    worker_id: Option<String>,
    current_job: Option<String>,
    outcome_rx: Option<Receiver<JobOutcome>>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        server_url: impl Into<String>,
        host_name: impl Into<String>,
        communicator: Box<dyn Communicator>,
        context: ExecutionContext,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            host_name: host_name.into(),
            context,
            communicator: Some(communicator),
            state: ConnectionState::Connecting,
            worker_id: None,
            current_job: None,
            outcome_rx: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Shared flag that ends [`Worker::run`] cleanly when set.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Reconnect loop; returns once stopped.
    pub fn run(&mut self) -> Result<()> {
        while !self.stop.load(Ordering::Relaxed) {
            self.state = ConnectionState::Connecting;
            match self.connect_and_serve() {
                Ok(()) => break,
                Err(err) => {
                    self.state = ConnectionState::Disconnected;
                    warn!(
                        "Lost job queue server ({:#}), retrying in {} s",
                        err,
                        RECONNECT_DELAY.as_secs()
                    );
                    self.sleep_unless_stopped(RECONNECT_DELAY);
                }
            }
        }
        self.state = ConnectionState::Stopped;
        info!("Worker stopped");
        Ok(())
    }

    /// One connection lifetime: register, then serve until stop or error.
    fn connect_and_serve(&mut self) -> Result<()> {
        let endpoint = worker_endpoint(&self.server_url)?;
        let stream = TcpStream::connect(&endpoint)
            .with_context(|| format!("failed to connect to {}", endpoint))?;
        stream
            .set_read_timeout(Some(READ_POLL))
            .context("failed to set read timeout")?;
        let mut writer = stream.try_clone().context("failed to clone stream")?;
        let mut reader = LineReader::new(stream);

        send_message(&mut writer, &WorkerMessage::RegisterWorker {
            host_name: self.host_name.clone(),
        })?;
        let worker_id = loop {
            match reader.next_message()? {
                Some(ServerMessage::Registered { worker_id }) => break worker_id,
                Some(other) => bail!("expected registration ack, got {:?}", other),
                None => continue,
            }
        };
        info!("Registered as worker {} for \"{}\"", worker_id, self.host_name);
        self.worker_id = Some(worker_id);
        self.state = ConnectionState::Connected;

        while !self.stop.load(Ordering::Relaxed) {
            if let Some(outcome) = self.finished_outcome() {
                let report = self.outcome_message(outcome);
                send_message(&mut writer, &report)?;
            }

            // A dead host cannot execute anything; shut down for good
            if let Some(communicator) = &self.communicator {
                if !communicator.is_host_alive() {
                    warn!("Host process died, stopping worker");
                    self.stop.store(true, Ordering::Relaxed);
                    break;
                }
            }

            match reader.next_message()? {
                Some(ServerMessage::StartJob { job }) => {
                    if let Some(reply) = self.handle_start_job(job) {
                        send_message(&mut writer, &reply)?;
                    }
                }
                Some(ServerMessage::Registered { .. }) => {
                    warn!("Unexpected duplicate registration ack");
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Accept a job assignment, or answer immediately when it cannot run.
    ///
    /// Returns `Some` for an immediate (failure) reply; `None` means the job
    /// was started and its report follows once execution finishes.
    fn handle_start_job(&mut self, job: Job) -> Option<WorkerMessage> {
        if self.current_job.is_some() || self.communicator.is_none() {
            warn!("Refusing job {}, already executing a job", job.id);
            return Some(self.job_done(job.id, false, Some("worker is busy".to_string()), None));
        }

        let mut commands = match ProcessorCommands::from_job_data(&job.data) {
            Ok(commands) => commands,
            Err(err) => {
                return Some(self.job_done(
                    job.id,
                    false,
                    Some(format!("invalid job data: {:#}", err)),
                    None,
                ));
            }
        };

        debug!("Starting job {}", job.id);
        let mut communicator = match self.communicator.take() {
            Some(communicator) => communicator,
            None => return Some(self.job_done(job.id, false, Some("worker is busy".to_string()), None)),
        };
        let context = self.context.clone();
        let job_id = job.id.clone();
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let result = commands.execute(communicator.as_mut(), &context);
            let (success, message) = match result {
                Ok(()) => (true, None),
                Err(err) => (false, Some(format!("{:#}", err))),
            };
            let outcome = JobOutcome {
                job_id,
                communicator,
                success,
                message,
                data: Some(commands.result_data()),
            };
            tx.send(outcome).ok();
        });

        self.current_job = Some(job.id);
        self.outcome_rx = Some(rx);
        None
    }

    /// Non-blocking check for a finished execution thread.
    fn finished_outcome(&mut self) -> Option<JobOutcome> {
        let outcome = self.outcome_rx.as_ref()?.try_recv().ok()?;
        self.outcome_rx = None;
        Some(outcome)
    }

    /// Turn an outcome into its wire report, restoring the host binding.
    fn outcome_message(&mut self, outcome: JobOutcome) -> WorkerMessage {
        self.communicator = Some(outcome.communicator);
        self.current_job = None;
        if outcome.success {
            debug!("Job {} done", outcome.job_id);
        } else {
            warn!(
                "Job {} failed: {}",
                outcome.job_id,
                outcome.message.as_deref().unwrap_or("no message")
            );
        }
        self.job_done(outcome.job_id, outcome.success, outcome.message, outcome.data)
    }

    fn job_done(
        &self,
        job_id: String,
        success: bool,
        message: Option<String>,
        data: Option<Value>,
    ) -> WorkerMessage {
        WorkerMessage::JobDone {
            worker_id: self.worker_id.clone().unwrap_or_default(),
            job_id,
            success,
            message,
            data,
        }
    }

    fn sleep_unless_stopped(&self, total: Duration) {
        let step = Duration::from_millis(100);
        let mut slept = Duration::ZERO;
        while slept < total && !self.stop.load(Ordering::Relaxed) {
            thread::sleep(step);
            slept += step;
        }
    }
}

/// TCP endpoint of the server's worker listener, derived from its HTTP url.
fn worker_endpoint(server_url: &str) -> Result<String> {
    let stripped = server_url
        .trim_end_matches('/')
        .strip_prefix("http://")
        .or_else(|| server_url.trim_end_matches('/').strip_prefix("https://"))
        .unwrap_or(server_url);
    let (host, port) = stripped
        .rsplit_once(':')
        .with_context(|| format!("server url \"{}\" misses a port", server_url))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid port in server url \"{}\"", server_url))?;
    Ok(format!("{}:{}", host, worker_port(port)))
}

fn send_message(writer: &mut TcpStream, message: &WorkerMessage) -> Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .context("failed to write to server connection")
}

/// Line-buffered JSON reader tolerant of read timeouts; partial lines stay
/// accumulated until the newline arrives.
struct LineReader {
    reader: BufReader<TcpStream>,
    buf: String,
}

impl LineReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            reader: BufReader::new(stream),
            buf: String::new(),
        }
    }

    /// Read one message; `Ok(None)` means the read timed out.
    fn next_message(&mut self) -> Result<Option<ServerMessage>> {
        match self.reader.read_line(&mut self.buf) {
            Ok(0) => bail!("connection closed"),
            Ok(_) => {
                let line = self.buf.trim().to_string();
                self.buf.clear();
                if line.is_empty() {
                    return Ok(None);
                }
                let message = serde_json::from_str(&line)
                    .with_context(|| format!("malformed server message: {}", line))?;
                Ok(Some(message))
            }
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => Err(err).context("read from server connection failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Command, SenderCommands};
    use crate::communicator::RecordingCommunicator;
    use serde_json::json;

    fn test_worker() -> Worker {
        Worker::new(
            "http://localhost:8079",
            "mock",
            Box::new(RecordingCommunicator::new()),
            ExecutionContext::default(),
        )
    }

    fn test_job() -> Job {
        let mut sender = SenderCommands::new("/proj/shot.tvpp", "mock");
        sender.add_command(Command::execute_george_simple("tv_version"));
        Job::new("mock", sender.job_data())
    }

    #[test]
    fn test_worker_endpoint_derivation() {
        assert_eq!(
            worker_endpoint("http://localhost:8079/").unwrap(),
            "localhost:8080"
        );
        assert!(worker_endpoint("http://localhost").is_err());
    }

    #[test]
    fn test_job_executes_and_reports_results() {
        let mut worker = test_worker();
        let job = test_job();
        let job_id = job.id.clone();

        assert!(worker.handle_start_job(job).is_none());
        assert_eq!(worker.current_job.as_deref(), Some(job_id.as_str()));

        // Execution runs on its own thread; block on its report
        let outcome = worker
            .outcome_rx
            .as_ref()
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        worker.outcome_rx = None;
        let report = worker.outcome_message(outcome);

        match report {
            WorkerMessage::JobDone {
                job_id: reported,
                success,
                data,
                ..
            } => {
                assert_eq!(reported, job_id);
                assert!(success);
                let results = data.unwrap();
                assert_eq!(results.as_array().unwrap().len(), 1);
                assert_eq!(results[0]["done"], true);
            }
            other => panic!("unexpected report: {:?}", other),
        }
        assert!(worker.current_job.is_none());
        assert!(worker.communicator.is_some(), "host binding not restored");
    }

    /// A busy worker refuses a second job without dropping the running one
    #[test]
    fn test_busy_worker_refuses_second_job() {
        let mut worker = test_worker();
        let first = test_job();
        let first_id = first.id.clone();
        assert!(worker.handle_start_job(first).is_none());

        let second = test_job();
        let second_id = second.id.clone();
        let reply = worker.handle_start_job(second).unwrap();
        match reply {
            WorkerMessage::JobDone {
                job_id,
                success,
                message,
                ..
            } => {
                assert_eq!(job_id, second_id);
                assert!(!success);
                assert!(message.unwrap().contains("busy"));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(worker.current_job.as_deref(), Some(first_id.as_str()));
    }

    #[test]
    fn test_invalid_job_data_reports_failure() {
        let mut worker = test_worker();
        let job = Job::new("mock", json!({"function": "render"}));
        let reply = worker.handle_start_job(job).unwrap();
        match reply {
            WorkerMessage::JobDone { success, .. } => assert!(!success),
            other => panic!("unexpected reply: {:?}", other),
        }
        // Still idle and able to take the next job
        assert!(worker.current_job.is_none());
        assert!(worker.handle_start_job(test_job()).is_none());
    }
}
