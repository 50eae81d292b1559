//! Run the configured pumps of a QCPump worker until interrupted.
use std::path::Path;
use std::sync::Arc;

use envconfig::Envconfig;
use pump_common::events::{EventSink, NullSink};
use pump_common::health::HealthRegistry;
use pump_common::metrics::{serve, setup_metrics_recorder, setup_metrics_router};
use pump_common::pipeline::MissingDataRule;
use pump_common::runtime::RuntimeOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pump_worker::config::Config;
use pump_worker::error::WorkerError;
use pump_worker::pumps;
use pump_worker::state;
use pump_worker::worker::PumpWorker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let missing_data = match &config.missing_data_pattern {
        Some(pattern) => MissingDataRule::new(pattern.as_str())?,
        None => MissingDataRule::default(),
    };
    let registry = pumps::registry(config.request_timeout.0, missing_data)?;

    let state_path = Path::new(config.pump_state_path.as_str());
    let saved = state::load(state_path).await?;

    let liveness = HealthRegistry::new("liveness");
    let sink: Arc<dyn EventSink> = Arc::new(NullSink);
    let options = RuntimeOptions {
        join_timeout: config.join_timeout.0,
    };
    let worker = PumpWorker::start(&registry, &saved, sink, options, &liveness).await;
    info!("{} running pump types {:?}", config.worker_name, registry.names());

    let recorder = setup_metrics_recorder()?;
    let router = setup_metrics_router(liveness, recorder);
    let bind = config.bind();

    tokio::select! {
        result = serve(router, &bind) => result.map_err(WorkerError::Serve)?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }

    let saved = worker.shutdown().await;
    state::save(state_path, &saved).await?;

    Ok(())
}
