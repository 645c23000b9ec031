mod config;
mod server;

use clap::{Parser, Subcommand};
use config::Config;
use kiln_core::{WorkerCommandHandler, WorkerConnection};
use server::run_server;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Fleet-coordinated build system kernel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a master: data API plus worker listener
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "kiln.yaml")]
        config: String,
    },
    /// Connect to a master as a worker
    Worker {
        /// Path to configuration file
        #[arg(short, long, default_value = "kiln.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("starting kiln master with config: {}", config);
            let cfg = load_config(&config);
            let master = match cfg.master() {
                Ok(master) => master.clone(),
                Err(e) => {
                    tracing::error!("{}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = run_server(master).await {
                tracing::error!("server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Worker { config } => {
            tracing::info!("starting kiln worker with config: {}", config);
            let cfg = load_config(&config);
            let worker = match cfg.worker() {
                Ok(worker) => worker.clone(),
                Err(e) => {
                    tracing::error!("{}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = run_worker(worker).await {
                tracing::error!("worker error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn load_config(path: &str) -> Config {
    match Config::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("failed to load config: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_worker(config: config::WorkerConfig) -> anyhow::Result<()> {
    let session_config = config.to_session_config()?;
    let handler = WorkerCommandHandler::new();
    let connection = WorkerConnection::connect(session_config, handler.clone()).await?;
    connection.print("worker online").await?;

    tokio::select! {
        _ = handler.wait_shutdown() => {
            tracing::info!("shutting down on master request");
            connection.close().await;
        }
        _ = connection.wait_closed() => {
            tracing::info!("connection to master closed");
        }
    }
    Ok(())
}
