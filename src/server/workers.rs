//! TCP side of the job queue server.
//!
//! Workers hold one persistent connection each, speaking newline-delimited
//! JSON ([`WorkerMessage`] in, [`ServerMessage`] out). A connection serves
//! one job at a time: the server never sends the next `start_job` before
//! the previous `job_done` arrived, so at-most-one-job-per-worker holds by
//! construction on this side too.
//!
//! Each accepted connection gets its own thread. Reads run with a short
//! timeout so an idle connection can poll the board for new work between
//! read attempts.

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::job::{ServerMessage, WorkerMessage};

use super::board::JobBoard;

/// Idle poll interval of a worker connection.
const ASSIGN_POLL: Duration = Duration::from_millis(300);

/// Accept loop for worker connections.
pub struct WorkerListener {
    addr: String,
    board: JobBoard,
}

impl WorkerListener {
    /// Bind and start accepting in a background thread.
    pub fn start(host: &str, port: u16, board: JobBoard) -> Result<thread::JoinHandle<()>> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .with_context(|| format!("failed to bind worker listener on {}", addr))?;
        info!("Worker listener on tcp://{}", addr);

        let server = WorkerListener { addr, board };
        Ok(thread::spawn(move || server.run(listener)))
    }

    fn run(self, listener: TcpListener) {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let board = self.board.clone();
                    thread::spawn(move || {
                        if let Err(err) = serve_worker(stream, board) {
                            warn!("Worker connection ended: {:#}", err);
                        }
                    });
                }
                Err(err) => warn!("Accept failed on {}: {}", self.addr, err),
            }
        }
    }
}

/// Drive one worker connection until it disconnects.
fn serve_worker(stream: TcpStream, board: JobBoard) -> Result<()> {
    stream
        .set_read_timeout(Some(ASSIGN_POLL))
        .context("failed to set read timeout")?;
    let mut writer = stream.try_clone().context("failed to clone worker stream")?;
    let mut reader = LineReader::new(stream);

    // Registration must come first; block until the line is complete
    let host_name = loop {
        match reader.next_message()? {
            Some(WorkerMessage::RegisterWorker { host_name }) => break host_name,
            Some(other) => bail!("worker sent {:?} before registering", other),
            None => continue,
        }
    };
    let worker_id = Uuid::new_v4().to_string();
    info!("Worker {} registered for host \"{}\"", worker_id, host_name);
    send_message(&mut writer, &ServerMessage::Registered {
        worker_id: worker_id.clone(),
    })?;

    // Job id the worker is currently executing
    let mut current_job: Option<String> = None;
    loop {
        let message = match reader.next_message() {
            Ok(message) => message,
            Err(err) => {
                if let Some(job_id) = current_job.take() {
                    board.fail_abandoned(&job_id);
                }
                info!("Worker {} disconnected", worker_id);
                return Err(err);
            }
        };

        match message {
            Some(WorkerMessage::JobDone {
                job_id,
                success,
                message,
                data,
                ..
            }) => {
                if current_job.as_deref() != Some(job_id.as_str()) {
                    warn!("Worker {} reported unexpected job {}", worker_id, job_id);
                }
                board.finish(&job_id, success, message, data);
                current_job = None;
            }
            Some(WorkerMessage::RegisterWorker { .. }) => {
                warn!("Worker {} sent a duplicate registration", worker_id);
            }
            None => {
                // Idle; assign work if this worker is free
                if current_job.is_none() {
                    if let Some(job) = board.take_job(&host_name) {
                        debug!("Assigning job {} to worker {}", job.id, worker_id);
                        current_job = Some(job.id.clone());
                        send_message(&mut writer, &ServerMessage::StartJob { job })?;
                    }
                }
            }
        }
    }
}

fn send_message(writer: &mut TcpStream, message: &ServerMessage) -> Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .context("failed to write to worker connection")
}

/// Line-buffered JSON reader tolerant of read timeouts.
///
/// Bytes that arrived before a timeout stay accumulated, so a message split
/// across reads is reassembled instead of dropped.
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
    fn next_message(&mut self) -> Result<Option<WorkerMessage>> {
        match self.reader.read_line(&mut self.buf) {
            Ok(0) => bail!("connection closed"),
            Ok(_) => {
                let line = self.buf.trim().to_string();
                self.buf.clear();
                if line.is_empty() {
                    return Ok(None);
                }
                let message = serde_json::from_str(&line)
                    .with_context(|| format!("malformed worker message: {}", line))?;
                Ok(Some(message))
            }
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => Err(err).context("read from worker connection failed"),
        }
    }
}
