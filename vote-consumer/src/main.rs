//! Consume vote events from a Redis Stream and count them in PostgreSQL.
use std::future::ready;

use anyhow::Context;
use axum::{routing::get, Router};
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use vote_common::health::HealthRegistry;
use vote_common::metrics::{serve, setup_metrics_routes};
use vote_consumer::config::{Config, LogFormat};
use vote_consumer::consumer::ConsumerSettings;
use vote_consumer::lifecycle::{install_shutdown_signals, start};

fn setup_tracing(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let log_layer = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer().with_filter(filter).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter)
            .boxed(),
    };
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "vote consumer"
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::init_from_env().context("invalid configuration")?;
    setup_tracing(config.log_format);
    info!("starting vote consumer...");

    let settings = ConsumerSettings::from(&config);
    info!(
        stream = settings.stream,
        group = settings.group,
        consumer = settings.consumer,
        batch_size = settings.batch_size,
        block_ms = settings.block.as_millis() as u64,
        "configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness.register("consumer_loop", settings.liveness_deadline());

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router).context("failed to install metrics recorder")?;

    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!(%error, bind, "health server failed");
        }
    });

    let shutdown = CancellationToken::new();
    install_shutdown_signals(shutdown.clone())?;

    let summary = start(&config, shutdown, consumer_liveness).await?;

    info!(
        processed = summary.processed,
        acked = summary.acked,
        ack_failures = summary.ack_failures,
        left_pending = summary.left_pending,
        unprocessed = summary.unprocessed,
        read_errors = summary.read_errors,
        "vote consumer shut down"
    );
    Ok(())
}
