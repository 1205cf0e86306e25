//! CLI for echomark
//!
//! Subcommands:
//! - `server`: run the WebSocket benchmark server
//! - `client`: run the benchmark client against a server

use std::process::ExitCode;

use clap::Parser;
use echomark::client::{BenchConfig, run_bench};
use echomark::config::{DEFAULT_CONFIG_PATH, Settings, load_config_from};
use echomark::registry::SessionRegistry;
use echomark::transport::websocket::start_websocket_server;
use echomark::utils::error::ServerError;
use echomark::utils::logging;
use tokio::runtime::{Builder, Runtime};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "echomark", version, about)]
enum Command {
    /// Start the WebSocket server
    Server {
        /// Configuration file, without extension (default: config/default)
        #[arg(long)]
        config: Option<String>,
        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the configured bind port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the benchmark client
    Client {
        /// WebSocket server URL to connect to (default: ws://127.0.0.1:8080)
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Number of concurrent connections
        #[arg(long, default_value_t = 10)]
        connections: usize,
        /// Messages sent on each connection
        #[arg(long, default_value_t = 100)]
        messages: u64,
    },
}

fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let result = match Command::parse() {
        Command::Server { config, host, port } => run_server(config, host, port),
        Command::Client {
            url,
            connections,
            messages,
        } => run_client(BenchConfig {
            url,
            connections,
            messages,
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run_server(
    config: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = match load_settings(config, host, port) {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            return Err(e.into());
        }
    };
    logging::init(&settings.log.level);

    info!(
        host = %settings.server.host,
        port = settings.server.port,
        on_malformed = ?settings.session.on_malformed,
        "Starting echomark server"
    );

    let runtime = build_runtime(settings.server.worker_threads)?;
    runtime.block_on(start_websocket_server(settings, SessionRegistry::shared()))?;
    Ok(())
}

fn run_client(config: BenchConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::init("info");

    let runtime = build_runtime(None)?;
    let report = runtime.block_on(run_bench(&config))?;
    println!("{report}");
    Ok(())
}

fn load_settings(
    config: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<Settings, ServerError> {
    let mut settings = load_config_from(config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH))?;
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }
    Ok(settings)
}

fn build_runtime(worker_threads: Option<usize>) -> Result<Runtime, ServerError> {
    let mut builder = Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = worker_threads.filter(|n| *n > 0) {
        builder.worker_threads(threads);
    }
    builder.build().map_err(ServerError::Runtime)
}
