/**
 * RESCUE MONITOR - daemon entry point
 *
 * ROLE : Wires config, persistence, alert sink, MQTT transport and the
 * control API, resumes a monitoring run left over from a previous process,
 * then serves HTTP until Ctrl-C.
 */

use anyhow::Context;
use rescue_monitor::alert::{AlertSink, CommandAlertSink, LogAlertSink};
use rescue_monitor::config::load_config;
use rescue_monitor::http::{build_router, AppState};
use rescue_monitor::service::{RescueMonitor, ServiceSettings};
use rescue_monitor::storage::JsonFileStore;
use rescue_monitor::transport::MqttTransport;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rescue_monitor=info")),
        )
        .init();

    let config = load_config().await.context("failed to load configuration")?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;
    let state_store = Arc::new(JsonFileStore::open(config.state_path()).context("failed to open state store")?);
    let dedup_store = Arc::new(JsonFileStore::open(config.dedup_path()).context("failed to open dedup store")?);

    let alerts: Arc<dyn AlertSink> = match config.alert.command.as_deref() {
        Some(command) => {
            info!(command, "alerts go to external command");
            Arc::new(CommandAlertSink::new(command, config.alert_max_duration()).context("invalid alert.command")?)
        }
        None => {
            info!("no alert.command configured, alerts are logged only");
            Arc::new(LogAlertSink)
        }
    };

    let monitor = Arc::new(
        RescueMonitor::builder(MqttTransport::new())
            .state_store(state_store)
            .dedup_store(dedup_store)
            .alerts(alerts)
            .settings(ServiceSettings::from_config(&config))
            .build()
            .context("failed to build monitor")?,
    );

    if monitor.start().await.context("failed to resume monitoring")? {
        info!("monitoring resumed from persisted state");
    } else {
        info!("idle, waiting for activation");
    }

    let api_key = std::env::var("RESCUE_API_KEY").ok().filter(|k| !k.is_empty());
    if api_key.is_none() {
        warn!("RESCUE_API_KEY not set, control API will refuse every request but /health");
    }
    let app = build_router(AppState {
        monitor: monitor.clone(),
        api_key,
    });

    let listener = TcpListener::bind(&config.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;
    info!(addr = %config.http.bind, "control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    monitor.shutdown().await;
    info!("stopped, monitoring state kept for next start");
    Ok(())
}
