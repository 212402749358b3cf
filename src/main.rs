use std::process::ExitCode;

use clap::Parser;
use coedit::cli::{Cli, Commands};
use coedit::config::Config;
use coedit::logging;
use coedit::server::{build_auth, build_store, Server};
use coedit::store::StoreHandle;
use tokio::signal;
use tracing::{debug, error, info};

// Exit codes: 0 success, 1 configuration error, 2 store unreachable,
// 3 shutdown after a fatal error.
const EXIT_CONFIG: u8 = 1;
const EXIT_STORE: u8 = 2;
const EXIT_FATAL: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(i32::from(EXIT_FATAL));
    }));

    let cli = Cli::parse();
    logging::initialize(cli.debug);

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            error!("configuration error: {error:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        Commands::Start { port } => start(config, port).await,
        Commands::Migrate => migrate(config).await,
        Commands::Health => health(config).await,
    }
}

async fn start(mut config: Config, port: Option<u16>) -> ExitCode {
    if let Some(port) = port {
        config.port = port;
    }

    let store = match build_store(&config) {
        Ok(store) => store,
        Err(error) => {
            error!("{error}");
            return ExitCode::from(EXIT_STORE);
        }
    };
    let auth = build_auth(&config);
    if config.tokens.is_empty() {
        debug!("no static tokens configured, every connection will be rejected");
    }

    let server = Server::new(config, store, auth);
    if let Err(error) = server.store().ping().await {
        error!("store unreachable: {error}");
        return ExitCode::from(EXIT_STORE);
    }
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(error) => {
            error!("{error:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    tokio::select! {
        () = server.listen(listener) => {
            error!("listener stopped unexpectedly");
            ExitCode::from(EXIT_FATAL)
        }
        () = wait_for_shutdown() => {
            info!("shut down");
            ExitCode::SUCCESS
        }
    }
}

async fn migrate(config: Config) -> ExitCode {
    let store = match build_store(&config) {
        Ok(store) => store,
        Err(error) => {
            error!("{error}");
            return ExitCode::from(EXIT_STORE);
        }
    };
    let handle = StoreHandle::new(store, config.ttls.store_deadline);
    match handle.migrate().await {
        Ok(()) => {
            info!("schema migrations applied");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!("migration failed: {error}");
            ExitCode::from(EXIT_STORE)
        }
    }
}

async fn health(config: Config) -> ExitCode {
    let store = match build_store(&config) {
        Ok(store) => store,
        Err(error) => {
            error!("{error}");
            return ExitCode::from(EXIT_STORE);
        }
    };
    let handle = StoreHandle::new(store, config.ttls.store_deadline);
    match handle.ping().await {
        Ok(()) => {
            info!("store is reachable");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!("store unreachable: {error}");
            ExitCode::from(EXIT_STORE)
        }
    }
}

async fn wait_for_shutdown() {
    let mut signal_terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("Should have been able to create terminate signal stream");
    tokio::select! {
        _ = signal::ctrl_c() => {
            debug!("Got SIGINT (Ctrl+C), shutting down");
        }
        _ = signal_terminate.recv() => {
            debug!("Got SIGTERM, shutting down");
        }
    }
}
