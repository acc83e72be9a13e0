use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use destiny_network::NetworkError;
use destiny_server::{Server, ServerConfig, ServerError, ServerKind};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// With Your Destiny server core.
#[derive(Parser, Debug)]
#[command(name = "destiny-server", version)]
struct Args {
    /// Path to the INI configuration file.
    #[arg(long, default_value = "destiny.ini")]
    config: PathBuf,

    /// Server role: world, database, or billing.
    #[arg(long, default_value = "world")]
    kind: String,
}

const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_BIND: u8 = 3;

fn main() -> ExitCode {
    let args = Args::parse();

    let config = if args.config.exists() {
        match ServerConfig::load(&args.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    } else {
        ServerConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let kind = match args.kind.as_str() {
        "world" => ServerKind::World,
        "database" => ServerKind::Database,
        "billing" => ServerKind::Billing,
        other => {
            error!("unknown server kind {other:?}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_count.max(1))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to build runtime: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let mut server = Server::new(kind, config);

    match runtime.block_on(server.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(ServerError::Network(NetworkError::Bind(e))) => {
            error!("failed to bind listen socket: {e}");
            ExitCode::from(EXIT_BIND)
        }
        Err(ServerError::Config(e)) => {
            error!("configuration error: {e}");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
