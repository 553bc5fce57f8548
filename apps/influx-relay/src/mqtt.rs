use crate::config::Config;
use crate::health::ConnectionEvent;
use crate::pipeline::PipelineHandle;
use crate::telemetry::{parse_mqtt_payload, ProducerPayload};
use anyhow::Result;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, Duration};

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options
}

pub fn connection_payload(event: ConnectionEvent, ts_ms: i64) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&json!({ "state": event, "ts": ts_ms }))?)
}

async fn publish_connection_events(
    client: AsyncClient,
    topic: String,
    pipeline: PipelineHandle,
) -> Result<()> {
    let mut events = pipeline.subscribe();
    let current = if pipeline.status().connected {
        ConnectionEvent::Online
    } else {
        ConnectionEvent::Offline
    };
    let mut next = Some(current);

    loop {
        if let Some(event) = next.take() {
            let payload = connection_payload(event, Utc::now().timestamp_millis())?;
            client
                .publish(topic.clone(), QoS::AtLeastOnce, true, payload)
                .await?;
            tracing::debug!(topic=%topic, state=?event, "published connection state");
        }
        match events.recv().await {
            Ok(event) => next = Some(event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "connection events lagged");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

/// Feeds `{prefix}/events` and `{prefix}/capability` into the pipeline and
/// keeps `{prefix}/relay/connection` (retained) in step with the database state.
pub async fn run_listener(config: Config, pipeline: PipelineHandle) -> Result<()> {
    let prefix = config.mqtt_topic_prefix.clone();
    let filters = [format!("{prefix}/events"), format!("{prefix}/capability")];
    let connection_topic = format!("{prefix}/relay/connection");

    loop {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 32);

        let mut subscribed = true;
        for filter in &filters {
            if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                tracing::warn!(error=%err, topic=%filter, "failed to subscribe to MQTT; retrying");
                subscribed = false;
                break;
            }
            tracing::info!(topic=%filter, "subscribed to producer feed");
        }
        if !subscribed {
            sleep(Duration::from_secs(2)).await;
            continue;
        }

        let publisher = tokio::spawn(publish_connection_events(
            client.clone(),
            connection_topic.clone(),
            pipeline.clone(),
        ));

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    match parse_mqtt_payload(&prefix, &publish.topic, &mut payload) {
                        Ok(Some(ProducerPayload::Events(events))) => {
                            let accepted = pipeline.ingest_events(&events);
                            tracing::trace!(accepted, received = events.len(), "ingested MQTT events");
                        }
                        Ok(Some(ProducerPayload::Capability(event))) => {
                            pipeline.ingest_capability(&event);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(error=%err, topic=%publish.topic, "failed to decode MQTT payload")
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        publisher.abort();
        sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_payload_names_state() -> Result<()> {
        let payload = connection_payload(ConnectionEvent::Offline, 42)?;
        let value: serde_json::Value = serde_json::from_slice(&payload)?;
        assert_eq!(value, json!({ "state": "offline", "ts": 42 }));
        Ok(())
    }
}
