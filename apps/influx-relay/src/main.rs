use anyhow::Result;
use futures::future;
use influx_relay::config::Config;
use influx_relay::health::ConnectionEvent;
use influx_relay::pipeline::{spawn_scheduler, PipelineHandle};
use influx_relay::{host_metrics, http, mqtt};
use tokio::sync::broadcast::error::RecvError;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,influx_relay=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "influx-relay"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn log_connection_events(pipeline: PipelineHandle) {
    let mut events = pipeline.subscribe();
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Online) => tracing::info!("relay connection online"),
            Ok(ConnectionEvent::Offline) => tracing::warn!("relay connection offline"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "connection event log lagged")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pipeline = PipelineHandle::from_config(&config)?;
    tracing::info!(
        url = %config.settings.base_url(),
        database = %config.settings.database,
        write_interval_secs = config.write_interval.seconds(),
        soft_limit = config.buffer_limits.soft(),
        hard_limit = config.buffer_limits.hard(),
        "influx-relay starting"
    );

    let scheduler = spawn_scheduler(pipeline.clone());
    let events_handle = tokio::spawn(log_connection_events(pipeline.clone()));

    let host_metrics_handle = config.host_metrics_interval().map(|interval| {
        let pipeline = pipeline.clone();
        tokio::spawn(host_metrics::run(interval, pipeline))
    });

    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let pipeline_clone = pipeline.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, pipeline_clone).await
        }))
    } else {
        None
    };

    let app = http::router(http::HttpState {
        pipeline: pipeline.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind=%config.http_bind, "influx-relay HTTP listening");
    let http_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    tokio::select! {
        res = http_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server failed"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = async {
            if let Some(handle) = mqtt_handle {
                match handle.await {
                    Ok(Err(err)) => tracing::warn!(error=%err, "MQTT listener exited"),
                    Err(err) => tracing::warn!(error=%err, "MQTT task failed"),
                    Ok(Ok(())) => {}
                }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    if let Some(handle) = host_metrics_handle {
        handle.abort();
    }
    events_handle.abort();
    scheduler.shutdown().await;
    tracing::info!(buffered = pipeline.buffered(), "influx-relay stopped");

    Ok(())
}
