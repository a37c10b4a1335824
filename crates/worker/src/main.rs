use anyhow::Context;
use outpost_db::DatabaseConfig;
use outpost_etl::params::connect_policy;
use outpost_etl::EtlParams;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Settings come only from the environment the agent builds. No `.env`
    // lookup: the agent's own file sits above the run directory.
    // The agent captures stdout line by line, so no colour codes.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "outpost_etl=info,outpost_db=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stdout),
        )
        .init();

    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("failed to read parameters from stdin")?;
    let params = EtlParams::from_json_str(&raw)?;
    let config = DatabaseConfig::from_env()?;
    let policy = connect_policy(|key| std::env::var(key).ok())?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    tracing::info!(?params, "Starting local DB ETL flow");
    let result = tokio::select! {
        result = outpost_etl::run(&config, &policy, &params, &cancel) => result,
        _ = cancel.cancelled() => anyhow::bail!("terminated before the flow finished"),
    };
    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!(error = %e, "Flow execution failed");
            return Err(e.into());
        }
    };
    tracing::info!(rows = summary.rows, "Local DB ETL flow finished");

    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::warn!("Termination requested, aborting");
    cancel.cancel();
}
