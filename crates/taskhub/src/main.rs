use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use taskhub::app::{self, ServerConfig};

#[derive(Parser)]
#[command(
    name = "taskhub",
    about = "Orchestration hub coordinating a human, a Cursor agent, and a Gemini agent over shared tasks"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hub server
    Serve {
        #[arg(long, default_value = "8080")]
        port: u16,
        #[arg(long, default_value = "taskhub.db")]
        db: String,
        /// Base URL of the Cursor connector agent
        #[arg(long, env = "TASKHUB_CONNECTOR_URL", default_value = "http://127.0.0.1:8765")]
        connector_url: String,
        #[arg(long, default_value = "30")]
        connector_timeout: u64,
        #[arg(long, default_value = "100")]
        queue_max_size: usize,
        #[arg(long, default_value = "15")]
        heartbeat_interval: u64,
        /// Idle seconds before a websocket connection is reaped
        #[arg(long, default_value = "300")]
        ws_stale: i64,
    },
    /// Initialize the database
    Init {
        #[arg(long, default_value = "taskhub.db")]
        db: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            db,
            connector_url,
            connector_timeout,
            queue_max_size,
            heartbeat_interval,
            ws_stale,
        } => {
            let config = ServerConfig {
                port,
                db_path: db,
                connector_url,
                connector_timeout_secs: connector_timeout,
                queue_max_size,
                heartbeat_interval_secs: heartbeat_interval,
                ws_stale_secs: ws_stale,
            };
            if let Err(e) = app::run_server(config).await {
                tracing::error!(error = %e, "server exited with error");
                std::process::exit(1);
            }
        }
        Commands::Init { db } => {
            let conn = taskhub::db::init_db(&db);
            tracing::info!(path = %db, "database initialized");
            drop(conn);
        }
    }
}
