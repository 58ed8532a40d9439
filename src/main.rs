use cindex::config::Settings;
use cindex::server::Server;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

/// Persistent C/C++ symbol-indexing daemon.
#[derive(Parser, Debug)]
#[command(name = "cindexd", version, about)]
struct Args {
    /// Data directory for the store and restore blobs
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Unix socket to listen on
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Worker threads for index and query jobs
    #[arg(long, short = 'j')]
    threads: Option<usize>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Forget every project and start from an empty index
    #[arg(long)]
    clear_projects: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut settings = match Settings::load() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("cindexd: bad configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(data_dir) = args.data_dir {
        settings.data_dir = data_dir;
    }
    if let Some(socket) = args.socket {
        settings.socket_path = Some(socket);
    }
    if let Some(threads) = args.threads {
        settings.thread_count = threads.max(1);
    }
    if let Some(level) = args.log_level {
        settings.logging.default = level;
    }

    cindex::logging::init(&settings.logging);

    if args.clear_projects {
        let _ = std::fs::remove_dir_all(&settings.data_dir);
    }

    let server = match Server::new(settings) {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "initialization failed");
            return ExitCode::FAILURE;
        }
    };
    match server.run() {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            error!(error = %err, "fatal");
            ExitCode::FAILURE
        }
    }
}
