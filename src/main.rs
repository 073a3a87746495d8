use anyhow::{Result, bail};
use clap::Parser;
use log::{debug, info};

use georgeq::cli::{Args, CliCommand};
use georgeq::commands::ExecutionContext;
use georgeq::communicator::{Communicator, RecordingCommunicator};
use georgeq::server;
use georgeq::worker::Worker;

fn main() -> Result<()> {
    let args = Args::parse();

    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let default_level = match args.verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
    debug!("Command-line args: {:?}", args);

    match args.command {
        CliCommand::StartServer { host, port } => {
            info!("Starting job queue server on {}:{}", host, port);
            server::run_server(&host, port)
        }
        CliCommand::StartWorker {
            app_name,
            server_url,
            workfile_root,
        } => {
            let communicator = communicator_for(&app_name)?;
            let context = ExecutionContext {
                jobs_root: workfile_root,
            };
            info!("Starting \"{}\" worker against {}", app_name, server_url);
            let mut worker = Worker::new(server_url, app_name, communicator, context);
            worker.run()
        }
    }
}

/// Host application registry. Real host bindings implement [`Communicator`]
/// downstream; only the in-memory mock ships here.
fn communicator_for(app_name: &str) -> Result<Box<dyn Communicator>> {
    match app_name {
        "mock" => Ok(Box::new(RecordingCommunicator::new())),
        other => bail!(
            "unknown host application \"{}\" (built-in hosts: mock)",
            other
        ),
    }
}
