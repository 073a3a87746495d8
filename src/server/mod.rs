//! Job queue server: HTTP for senders, TCP for workers.
//!
//! # Purpose
//!
//! Central broker between publish processes that submit command batches and
//! the workers that execute them inside a host application. Senders only
//! ever see HTTP; workers only ever see their TCP line protocol; both meet
//! on the shared [`JobBoard`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  POST /api/jobs   ┌─────────────────────┐
//! │   Sender     │ ────────────────▶ │   rouille HTTP      │
//! │ (publish)    │ ◀──── job_id ──── │   (ApiServer)       │
//! │              │  GET /api/jobs/id │          │          │
//! └──────────────┘                   │      JobBoard       │
//!                                    │          │          │
//! ┌──────────────┐  line JSON (TCP)  │   WorkerListener    │
//! │   Worker     │ ◀── start_job ─── │  (thread per conn)  │
//! │ (host app)   │ ─── job_done ───▶ │                     │
//! └──────────────┘                   └─────────────────────┘
//! ```
//!
//! - **rouille** - sync HTTP server, background thread
//! - **TcpListener** - persistent worker links, one thread per connection
//! - **JobBoard** - `Arc<Mutex>` queue + job map shared by both sides
//!
//! # Endpoints
//!
//! | Method | Path             | Description                      |
//! |--------|------------------|----------------------------------|
//! | POST   | `/api/jobs`      | Submit a job, returns `{job_id}` |
//! | GET    | `/api/jobs/{id}` | Job status snapshot              |
//! | GET    | `/api/health`    | Health check                     |

mod api;
mod board;
mod workers;

use anyhow::Result;

pub use api::ApiServer;
pub use board::JobBoard;
pub use workers::WorkerListener;

/// TCP port of the worker listener, derived from the HTTP port.
pub fn worker_port(http_port: u16) -> u16 {
    http_port + 1
}

/// Run both server sides on one board. Blocks forever.
pub fn run_server(host: &str, port: u16) -> Result<()> {
    let board = JobBoard::new();
    WorkerListener::start(host, worker_port(port), board.clone())?;
    let api = ApiServer::start(host, port, board);
    // rouille's accept loop never returns
    if api.join().is_err() {
        anyhow::bail!("API server thread panicked");
    }
    Ok(())
}

/// Start both server sides in background threads, for embedding in tests.
pub fn start_server(host: &str, port: u16) -> Result<JobBoard> {
    let board = JobBoard::new();
    WorkerListener::start(host, worker_port(port), board.clone())?;
    ApiServer::start(host, port, board.clone());
    Ok(board)
}
