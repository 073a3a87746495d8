use clap::{Parser, Subcommand};

/// Render job queue for George-scripted host applications
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the job queue server (HTTP for senders, TCP for workers)
    StartServer {
        /// Address to bind on
        #[arg(long = "host", value_name = "ADDR", default_value = "0.0.0.0")]
        host: String,

        /// HTTP port; the worker listener binds the next port up
        #[arg(long = "port", value_name = "PORT", default_value_t = 8079)]
        port: u16,
    },

    /// Run a worker serving one host application instance
    StartWorker {
        /// Host application to execute jobs in (e.g. "mock")
        #[arg(value_name = "APP_NAME")]
        app_name: String,

        /// Job queue server to register with
        #[arg(
            long = "server-url",
            value_name = "URL",
            default_value = "http://localhost:8079"
        )]
        server_url: String,

        /// Local mount of the shared jobs root, substituted into scripts
        #[arg(long = "workfile-root", value_name = "DIR")]
        workfile_root: Option<String>,
    },
}
