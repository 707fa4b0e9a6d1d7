use std::{env, process::exit, sync::Arc};

use clap::error::ErrorKind;
use phantom_tunnel::{
    args::{self, StartupArguments, StartupMode},
    config::{ClientConfig, ServerConfig},
    dashboard, logging,
    session::{client::TunnelClient, server::TunnelServer},
    transport::tls::TlsMaterial,
    Result, TunnelStats,
};
use tokio::select;
use tracing::{error, info, warn};

fn main() {
    let arguments = match args::parse_arguments(env::args_os()) {
        Ok(arguments) => arguments,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => err.exit(),
        Err(err) => {
            eprintln!("{err}");
            exit(1);
        }
    };

    let StartupArguments {
        verbose,
        silent,
        log_file,
        mode,
    } = arguments;

    if let Err(err) = logging::init_logging(logging::level_for(verbose, silent), log_file.as_deref()) {
        eprintln!("Failed to set up logging: {err}");
        exit(1);
    }

    let mode = match mode {
        StartupMode::Server(server_args) => server_args.into_config().map(Mode::Server),
        StartupMode::Client(client_args) => client_args.into_config().map(Mode::Client),
    };

    let mode = match mode {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("{err}\n\nType 'phantom --help' for a help menu");
            exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(err) = runtime.block_on(async_main(mode)) {
        error!("{err}");
        exit(1);
    }
}

enum Mode {
    Server(ServerConfig),
    Client(ClientConfig),
}

async fn async_main(mode: Mode) -> Result<()> {
    let stats = Arc::new(TunnelStats::new());

    match mode {
        Mode::Server(config) => {
            spawn_dashboard(config.dashboard, &stats).await;
            run_server(config, stats).await
        }
        Mode::Client(config) => {
            spawn_dashboard(config.dashboard, &stats).await;
            run_client(config, stats).await
        }
    }
}

async fn spawn_dashboard(port: Option<u16>, stats: &Arc<TunnelStats>) {
    if let Some(port) = port {
        if let Err(err) = dashboard::spawn(port, Arc::clone(stats)).await {
            warn!("Stats endpoint disabled: {err}");
        }
    }
}

async fn run_server(config: ServerConfig, stats: Arc<TunnelStats>) -> Result<()> {
    let material = TlsMaterial::load_or_generate(&config.cert, &config.key)?;
    let server = TunnelServer::bind(&config, &material, stats).await?;
    let sessions = server.sessions();

    select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            sessions.close_current().await;
        }
    }

    Ok(())
}

async fn run_client(config: ClientConfig, stats: Arc<TunnelStats>) -> Result<()> {
    let client = TunnelClient::new(&config, stats)?;
    let handle = client.handle();

    select! {
        _ = client.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            handle.close_current().await;
        }
    }

    Ok(())
}
