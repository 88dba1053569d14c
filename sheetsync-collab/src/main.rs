//! sheetsync-server: collaborative spreadsheet server.
//!
//! Serves until Ctrl-C, then saves every session with unsaved changes.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use sheetsync_collab::protocol::{DEFAULT_MAX_LINE_LEN, DEFAULT_MAX_PAYLOAD_LEN};
use sheetsync_collab::server::{ServerConfig, SheetServer};

/// Collaborative spreadsheet server
#[derive(Parser, Debug)]
#[command(name = "sheetsync-server")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:1984")]
    bind: String,

    /// Catalog file listing document names, passwords and files
    #[arg(long, default_value = "spreadsheet_files.txt")]
    catalog: PathBuf,

    /// Directory holding the document XML files
    #[arg(long, default_value = ".")]
    documents: PathBuf,

    /// Longest accepted protocol line in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LEN)]
    max_line: usize,

    /// Largest accepted cell content in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_LEN)]
    max_payload: usize,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        Self {
            bind_addr: cli.bind,
            catalog_path: cli.catalog,
            documents_dir: cli.documents,
            max_line_len: cli.max_line,
            max_payload_len: cli.max_payload,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Cli::parse());
    info!("Starting sheetsync server...");

    let server = match SheetServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Cannot start: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    server.directory().shutdown().await;

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server stopped: {e}");
            ExitCode::FAILURE
        }
    }
}
