use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rowsync_client::ensure_node_id;
use rowsync_core::SyncError;

/// Prints this device's node id, registering with the server on first run.
#[derive(Parser)]
#[command(name = "ensure-node-id")]
struct Args {
    /// Base URL of the sync server, e.g. http://localhost:8080
    #[arg(long)]
    server: String,

    /// Where the issued node id is cached
    #[arg(long, default_value = "rowsync-node.json")]
    cache: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match ensure_node_id(&args.server, &args.cache).await {
        Ok(node_id) => {
            println!("{node_id}");
            ExitCode::SUCCESS
        }
        Err(SyncError::Transport(e)) => {
            eprintln!("transport failure: {e}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("registration failed: {e}");
            ExitCode::from(3)
        }
    }
}
