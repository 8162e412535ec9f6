use anyhow::Context as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use neutree_cluster::config::ControllerConfig;
use neutree_cluster::controllers::{self, State};
use neutree_cluster::storage::PostgrestStorage;
use neutree_cluster::util::telemetry;

mod handlers;
mod server;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

fn env_duration(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => humantime::parse_duration(&raw).with_context(|| format!("{name}={raw:?} is not a duration")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init(std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json"))?;

    let storage_url = std::env::var("STORAGE_URL").context("STORAGE_URL must be set")?;
    let storage_token = std::env::var("STORAGE_TOKEN").unwrap_or_default();
    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());

    let defaults = ControllerConfig::from_env();
    let config = ControllerConfig {
        metrics_remote_write_url: std::env::var("METRICS_REMOTE_WRITE_URL").unwrap_or_default(),
        requeue_interval: env_duration("RECONCILE_INTERVAL", defaults.requeue_interval)?,
        ..defaults
    };
    let poll_interval = env_duration("POLL_INTERVAL", DEFAULT_POLL_INTERVAL)?;

    let state = State::default();
    let storage = Arc::new(PostgrestStorage::new(&storage_url, &storage_token));
    let ctx = state.to_context(storage, config)?;
    info!("reconciling clusters from {storage_url}");

    let controller = controllers::run(Arc::new(ctx), poll_interval);
    let server = server::start_server(state, &listen_addr);

    tokio::select! {
        _ = controller => Ok(()),
        res = server => res,
    }
}
