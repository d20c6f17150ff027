// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use relay_core::{Engine, Router};
use relay_events::EventBus;
use relay_model::ProviderSet;
use relay_registry::{ProfileStore, ProfileView};
use relay_server::{AppState, SessionRecorder};
use relay_toolserver::{ConnectError, ToolDispatch, ToolServerSupervisor};

/// Exit code for a tool-server subprocess that could not be started when no
/// remote transport was configured either.
const EXIT_NO_TOOL_SERVER: i32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(Commands::ShowConfig) = &cli.command {
        let config = relay_config::load(cli.config.as_deref())?;
        println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
        return Ok(());
    }

    let mut config = relay_config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    // The bus is the single piece of process-wide state; everything else is
    // injected explicitly below.
    let bus = Arc::new(EventBus::new());

    // Capability profiles, reloaded on the invalidation signal.
    let profiles_ready = config.profiles.path.is_file();
    let store = ProfileStore::open(&config.profiles.path);
    Arc::clone(&store).watch_invalidation(&bus);
    let profiles: Arc<dyn ProfileView> = Arc::clone(&store) as Arc<dyn ProfileView>;

    // Tool-server supervisor: remote transport when healthy, subprocess
    // otherwise.
    let supervisor = ToolServerSupervisor::new(
        config.tool_server.clone(),
        Arc::clone(&profiles),
        Arc::clone(&bus),
        config.limits.parallel_tool_cap,
    );
    match supervisor.connect().await {
        Ok(()) => {}
        Err(ConnectError::NoTransport) => {
            warn!("no tool server configured; tool calls will fail until one is added");
        }
        Err(e @ ConnectError::Spawn(_)) => {
            error!("{e:#}");
            std::process::exit(EXIT_NO_TOOL_SERVER);
        }
    }
    let tools: Arc<dyn ToolDispatch> = supervisor;

    // Session recorder owns the turn-record store.
    let sessions_ready = if config.sessions.enabled {
        match SessionRecorder::spawn(&bus, config.sessions.dir.clone(), 1024) {
            Ok(()) => true,
            Err(e) => {
                warn!(dir = %config.sessions.dir.display(), "session store unavailable: {e:#}");
                false
            }
        }
    } else {
        false
    };

    let providers = Arc::new(ProviderSet::new(&config));
    let router = Arc::new(Router::new(
        &config,
        Arc::clone(&profiles),
        Arc::clone(&tools),
        Arc::clone(&bus),
    ));
    let engine = Arc::new(Engine::new(
        providers,
        Arc::clone(&tools),
        Arc::clone(&profiles),
        Arc::clone(&bus),
    ));

    let state = AppState {
        config: Arc::clone(&config),
        bus,
        router,
        engine,
        tools,
        profiles_ready,
        sessions_ready,
        started_at: Instant::now(),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("cannot bind {}", config.server.listen))?;

    info!(
        main_model = %config.models.main,
        dual_model = config.models.dual_model,
        "relay starting"
    );

    relay_server::serve(listener, state, shutdown_signal()).await?;
    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "relay=debug,info"
    } else {
        "relay=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
