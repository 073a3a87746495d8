//! End-to-end job queue round trip over loopback: HTTP sender, queue
//! server, TCP worker with an in-memory host.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use georgeq::commands::{Command, ExecutionContext, SenderCommands};
use georgeq::communicator::RecordingCommunicator;
use georgeq::job::JobError;
use georgeq::sender::JobQueueClient;
use georgeq::server;
use georgeq::worker::Worker;

const PORT: u16 = 18579;

fn wait_for_server(port: u16) {
    let url = format!("http://127.0.0.1:{}/api/health", port);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match reqwest::blocking::get(&url) {
            Ok(response) if response.status().is_success() => return,
            _ if Instant::now() > deadline => panic!("server did not come up on {}", url),
            _ => thread::sleep(Duration::from_millis(100)),
        }
    }
}

#[test]
fn test_job_roundtrip_over_loopback() {
    server::start_server("127.0.0.1", PORT).unwrap();
    wait_for_server(PORT);

    let mut communicator = RecordingCommunicator::new();
    communicator
        .canned_results
        .insert("tv_version".to_string(), "\"TVP Animation\" 11.5".to_string());
    communicator.scene_data.fps = 25.0;

    let server_url = format!("http://127.0.0.1:{}", PORT);
    let mut worker = Worker::new(
        server_url.clone(),
        "mock",
        Box::new(communicator),
        ExecutionContext::default(),
    );
    let stop = worker.stop_flag();
    let worker_thread = thread::spawn(move || worker.run());

    let client = JobQueueClient::new(server_url).with_timeout(Duration::from_secs(60));

    // Successful batch: results come back merged per command
    let mut batch = SenderCommands::new("/proj/shot.tvpp", "mock");
    batch.add_command(Command::execute_george_simple("tv_version"));
    batch.add_command(Command::collect_scene_data());
    batch.send_job_and_wait(&client).unwrap();

    assert!(batch.commands().iter().all(|c| c.done));
    assert_eq!(
        batch.commands()[0].result,
        Some(json!("\"TVP Animation\" 11.5"))
    );
    let scene = batch.commands()[1].result.as_ref().unwrap();
    assert_eq!(scene["fps"], 25.0);

    // Malformed batch fails the job but not the worker
    let job_id = client
        .send_job("mock", json!({"workfile": "w.tvpp", "function": "render"}))
        .unwrap();
    let err = client.wait_for_job(&job_id).unwrap_err();
    match err.downcast_ref::<JobError>() {
        Some(JobError::Failed(status)) => {
            assert!(status.done);
            assert!(status.message.as_deref().unwrap_or("").contains("function"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // The same worker still serves the next batch
    let mut second = SenderCommands::new("/proj/shot.tvpp", "mock");
    second.add_command(Command::execute_george_simple("tv_version"));
    second.send_job_and_wait(&client).unwrap();
    assert!(second.commands()[0].done);

    stop.store(true, Ordering::Relaxed);
    worker_thread.join().unwrap().unwrap();
}
