//! REST API implementation using rouille.
//!
//! # Purpose
//!
//! HTTP surface of the job queue server. Senders submit command batches here
//! and poll their status; workers never touch HTTP (they hold a TCP link,
//! see `server/workers.rs`).
//!
//! # Thread safety
//!
//! Handlers run on rouille's thread pool and share one [`JobBoard`]; every
//! handler is a single short board call.

use std::thread;

use rouille::{Request, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::board::JobBoard;

/// Request body of `POST /api/jobs`: `host_name` plus the flattened batch
/// payload, re-nested into the job record's `data`
#[derive(Debug, Deserialize)]
struct SubmitRequest {
    host_name: String,
    #[serde(flatten)]
    data: Value,
}

/// Response body of `POST /api/jobs`
#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: String,
}

/// Generic API response
#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    fn ok_msg(msg: &str) -> Self {
        Self { success: true, message: Some(msg.to_string()), error: None }
    }

    fn err(msg: &str) -> Self {
        Self { success: false, message: None, error: Some(msg.to_string()) }
    }
}

/// HTTP server runner
pub struct ApiServer {
    addr: String,
    board: JobBoard,
}

impl ApiServer {
    /// Start the API server in a background thread.
    pub fn start(host: &str, port: u16, board: JobBoard) -> thread::JoinHandle<()> {
        let server = ApiServer {
            addr: format!("{}:{}", host, port),
            board,
        };
        thread::spawn(move || server.run())
    }

    fn run(self) {
        log::info!("Job API server starting on http://{}", self.addr);
        let board = self.board;
        rouille::start_server(&self.addr, move |request| {
            Self::handle_request(request, &board)
        });
    }

    fn handle_request(request: &Request, board: &JobBoard) -> Response {
        let path = request.url();

        // /api/jobs/{id} needs manual matching (router! doesn't capture well)
        if request.method() == "GET" {
            if let Some(job_id) = path.strip_prefix("/api/jobs/") {
                return match board.status(job_id) {
                    Some(status) => Response::json(&status),
                    None => Response::json(&ApiResponse::err("Unknown job id"))
                        .with_status_code(404),
                };
            }
        }

        rouille::router!(request,
            (POST) ["/api/jobs"] => {
                Self::handle_submit(request, board)
            },

            // Health check
            (GET) ["/api/health"] => {
                Response::json(&ApiResponse::ok_msg("georgeq job queue server"))
            },

            // Fallback
            _ => {
                Response::json(&ApiResponse::err("Not found")).with_status_code(404)
            }
        )
    }

    fn handle_submit(request: &Request, board: &JobBoard) -> Response {
        match rouille::input::json_input::<SubmitRequest>(request) {
            Ok(req) => {
                let job_id = board.submit(&req.host_name, req.data);
                Response::json(&SubmitResponse { job_id })
            }
            Err(e) => Response::json(&ApiResponse::err(&format!("Invalid JSON: {}", e)))
                .with_status_code(400),
        }
    }
}
