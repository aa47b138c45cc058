use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Arg, Command};
use rt_daemon::config::load_config;
use rt_daemon::session::Session;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- Argument Parsing ---
    let matches = Command::new("rt_daemon")
        .about("Real-time acquisition client daemon")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .help("JSON configuration file; defaults are used when omitted"),
        )
        .arg(
            Arg::new("mock")
                .long("mock")
                .action(clap::ArgAction::SetTrue)
                .help("Start an embedded simulated acquisition server and connect to it"),
        )
        .arg(
            Arg::new("connector")
                .long("connector")
                .value_name("ID")
                .value_parser(clap::value_parser!(i32))
                .help("Connector to select before starting"),
        )
        .get_matches();

    let mut config = load_config(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
    if let Some(connector) = matches.get_one::<i32>("connector") {
        config.connector = Some(*connector);
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("RT daemon starting...");

    let use_mock = matches.get_flag("mock");
    let session_config = config.clone();
    let session = tokio::task::spawn_blocking(move || Session::open(&session_config, use_mock))
        .await
        .context("Session setup task failed")??;
    let session = Arc::new(session);

    // --- Status Reporting ---
    let status_session = session.clone();
    let interval = Duration::from_secs(config.status_interval_secs);
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for message in status_session.drain_messages() {
                tracing::info!(%message, "Server message");
            }
            let snapshot = status_session.monitor().snapshot();
            tracing::info!(
                columns = snapshot.columns,
                rate = snapshot.column_rate,
                connected = snapshot.connected,
                buffer_fill = snapshot.buffer_fill,
                "Status"
            );
        }
    });

    // --- Graceful Shutdown ---
    tokio::signal::ctrl_c().await.context("Could not listen for Ctrl-C")?;
    tracing::info!("Shutdown signal received. Stopping acquisition...");
    status_task.abort();

    let closing = session.clone();
    tokio::task::spawn_blocking(move || closing.close())
        .await
        .context("Shutdown task failed")??;

    tracing::info!("RT daemon stopped gracefully.");
    Ok(())
}
