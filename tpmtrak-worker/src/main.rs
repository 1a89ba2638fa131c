//! Consume `PgQueue` messages and store the records they carry.
use std::future::ready;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use tpmtrak_common::{
    health::HealthRegistry,
    metrics::{serve, setup_metrics_routes},
    pgqueue::PgQueue,
};
use tpmtrak_worker::config::Config;
use tpmtrak_worker::error::WorkerError;
use tpmtrak_worker::handler::MessageHandler;
use tpmtrak_worker::sink::PgRecordSink;
use tpmtrak_worker::worker::IngestWorker;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "tpmtrak worker"
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();

    let config = Config::init_from_env()?;

    let sink = match config.sql_connection_string() {
        Some(url) => Some(PgRecordSink::new(
            url,
            config.max_pg_connections,
            &config.record_table,
        )?),
        None => {
            error!("SQL_CONNECTION_STRING is not set, messages will be completed without being stored");
            None
        }
    };
    let handler = MessageHandler::from_sink(sink);

    let queue = PgQueue::new(
        config.queue_name.as_str(),
        &config.database_url,
        config.max_pg_connections,
    )
    .await?;

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker", time::Duration::seconds(60));

    let worker = IngestWorker::new(
        &config.worker_name,
        &queue,
        config.poll_interval.0,
        config.max_concurrent_messages,
        handler,
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router)?;

    let bind = config.bind();
    info!("serving health and metrics on {}", bind);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await?;

    Ok(())
}
