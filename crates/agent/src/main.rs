//! `outpost-agent` -- polling execution agent.
//!
//! Claims work items from a control-plane work pool and runs them as
//! local subprocesses next to a database that only this host can reach.
//! Configuration comes from environment variables (and `.env`); see
//! [`AgentConfig::from_env`] for the full table.
//!
//! Exits with status 1 on invalid configuration or when the control plane
//! rejects the API key.

use std::sync::Arc;

use outpost_agent::config::{AgentConfig, LogFormat};
use outpost_agent::{Agent, AgentError, HttpWorkSource, ResourceConnector, Runner, WorkSource};
use outpost_db::LocalResource;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = AgentConfig::from_env();
    init_tracing(
        config
            .as_ref()
            .map(|c| c.log_format)
            .unwrap_or_default(),
    );

    let config = config.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    tracing::info!(
        agent = %config.agent_name,
        work_pool = %config.work_pool,
        api_url = %config.api_url,
        database = %config.database.address(),
        "Starting outpost-agent",
    );

    if let Err(source) = tokio::fs::create_dir_all(&config.work_dir).await {
        let e = AgentError::WorkDir {
            path: config.work_dir.display().to_string(),
            source,
        };
        tracing::error!(error = %e, "Cannot start");
        std::process::exit(1);
    }

    let source: Arc<dyn WorkSource> =
        match HttpWorkSource::new(&config.api_url, &config.api_key, &config.agent_name) {
            Ok(source) => Arc::new(source),
            Err(e) => {
                tracing::error!(error = %e, "Failed to build control plane client");
                std::process::exit(1);
            }
        };

    let resource = Arc::new(LocalResource::new(
        config.database.clone(),
        config.db_retry.clone(),
    ));
    let connector: Arc<dyn ResourceConnector> = resource.clone();
    let runner = Arc::new(Runner::new(
        Arc::clone(&source),
        Some(connector),
        config.runner_settings(),
    ));
    let agent = Agent::new(config.loop_settings(), source, runner);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let result = agent.run(shutdown).await;
    resource.close().await;

    match result {
        Ok(summary) => {
            tracing::info!(?summary, "outpost-agent stopped");
        }
        Err(e) => {
            tracing::error!(error = %e, "outpost-agent stopped on a fatal error");
            std::process::exit(1);
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "outpost_agent=info,outpost_core=info,outpost_db=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
