use crate::config::{DatabaseIdentity, ProtocolVersion};
use crate::error::{RelayError, RelayResult};
use crate::influx::InfluxClient;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

/// Edge-triggered transition notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Online,
    Offline,
}

/// Tracks reachability of the configured database.
///
/// Only state changes are published; repeated successes or failures are silent.
pub struct HealthMonitor {
    state: ConnectionState,
    identity: Option<DatabaseIdentity>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl HealthMonitor {
    pub fn new(events: broadcast::Sender<ConnectionEvent>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            identity: None,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Forget everything; the next check re-validates from scratch.
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.identity = None;
    }

    /// Probes the target and applies the transition. `Ok` means connected.
    pub async fn check_health(&mut self, client: &InfluxClient) -> RelayResult<()> {
        let settings = client.settings();
        if !settings.is_complete() {
            self.reset();
            return Err(RelayError::ConfigurationIncomplete);
        }

        let identity = settings.identity();
        if self.identity.as_ref() != Some(&identity) {
            if self.identity.is_some() {
                tracing::info!(
                    host = %identity.host,
                    database = %identity.database,
                    "influx target changed; revalidating"
                );
            }
            self.state = ConnectionState::Disconnected;
            self.identity = Some(identity);
        }

        match client.probe().await {
            Ok(()) => {
                if self.state == ConnectionState::Disconnected {
                    self.connect(client).await?;
                }
                Ok(())
            }
            Err(err) => {
                if self.state == ConnectionState::Connected {
                    self.state = ConnectionState::Disconnected;
                    tracing::warn!(error = %err, "influx went offline");
                    let _ = self.events.send(ConnectionEvent::Offline);
                } else {
                    tracing::debug!(error = %err, "influx still unreachable");
                }
                Err(err)
            }
        }
    }

    async fn connect(&mut self, client: &InfluxClient) -> RelayResult<()> {
        let settings = client.settings();
        if settings.protocol_version() == ProtocolVersion::V1 {
            match client.ensure_database().await {
                Ok(true) => {
                    tracing::info!(database = %settings.database, "created influx database")
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        database = %settings.database,
                        "influx reachable but database is not ready"
                    );
                    return Err(err);
                }
            }
        }
        self.state = ConnectionState::Connected;
        tracing::info!(url = %settings.base_url(), database = %settings.database, "influx online");
        let _ = self.events.send(ConnectionEvent::Online);
        Ok(())
    }
}
