mod ack;
mod amqp;
mod config;
mod consume;
mod reading;
mod sink;

use crate::ack::RejectionTracker;
use crate::amqp::Broker;
use crate::config::Config;
use crate::consume::ConsumeLoop;
use crate::sink::HttpSink;
use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,weather_worker=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);
    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    let Some(endpoint) = config.otlp_endpoint.as_deref().map(traces_endpoint) else {
        registry.try_init()?;
        return Ok(());
    };

    let exporter = opentelemetry_otlp::new_exporter()
        .http()
        .with_endpoint(endpoint);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", "weather-worker"),
        ])))
        .install_batch(Tokio)?;
    registry
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;
    Ok(())
}

/// Appends the OTLP/HTTP traces path unless the endpoint already names it.
fn traces_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1/traces") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1/traces")
    }
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error=%err, "failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => tracing::warn!(error=%err, "failed to install SIGTERM handler"),
        }
    }
    ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    tracing::info!(
        queue = config::QUEUE_NAME,
        api_url = %config.api_url,
        workers = config.worker_count,
        max_rejections = ?config.max_rejections,
        "starting weather worker"
    );

    // Any setup failure is fatal before a single delivery is consumed.
    let broker = Broker::connect(&config).await?;
    let instance = uuid::Uuid::new_v4().simple().to_string();
    let mut bindings = Vec::with_capacity(config.worker_count);
    for index in 0..config.worker_count {
        let consumer_tag = format!("{}-{}-{}", config.consumer_tag_prefix, &instance[..8], index);
        bindings.push(broker.open_worker(&config, &consumer_tag).await?);
    }

    // Requeued deliveries can land on any worker, so rejection counts are shared.
    let tracker = Arc::new(RejectionTracker::new(config.max_rejections));
    let shutdown = CancellationToken::new();
    let mut workers = JoinSet::new();
    for (index, binding) in bindings.into_iter().enumerate() {
        let sink = HttpSink::new(config.api_url.clone(), config.sink_timeout())?;
        let mut worker = ConsumeLoop::new(sink, tracker.clone(), config.requeue_delay());
        let shutdown = shutdown.clone();
        workers.spawn(async move {
            let result = worker.run(binding.into_deliveries(), shutdown).await;
            let stats = worker.stats();
            tracing::info!(
                worker = index,
                state = ?worker.state(),
                stats = ?stats.snapshot(),
                last_error = ?stats.last_error(),
                "worker stopped"
            );
            result
        });
    }
    tracing::info!("waiting for messages; press CTRL+C to exit");

    let mut outcome = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
        Some(joined) = workers.join_next() => {
            outcome = match joined {
                Ok(Ok(())) => Err(anyhow::anyhow!("worker stopped consuming")),
                Ok(Err(err)) => Err(err),
                Err(err) => Err(err.into()),
            };
        }
    }

    shutdown.cancel();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(error=%err, "worker exited with error"),
            Err(err) => tracing::warn!(error=%err, "worker task failed"),
        }
    }
    broker.close().await;

    if let Err(err) = &outcome {
        tracing::error!(error=%err, "weather worker terminated");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::{shutdown_signal, traces_endpoint};
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_signal_waits_for_a_signal() {
        let waited = tokio::time::timeout(Duration::from_millis(50), shutdown_signal()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn appends_traces_path_once() {
        assert_eq!(traces_endpoint("http://collector:4318"), "http://collector:4318/v1/traces");
        assert_eq!(traces_endpoint("http://collector:4318/"), "http://collector:4318/v1/traces");
        assert_eq!(
            traces_endpoint(" http://collector:4318/v1/traces "),
            "http://collector:4318/v1/traces"
        );
    }
}
