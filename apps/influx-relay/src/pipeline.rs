use crate::buffer::{BufferLimits, PushOutcome, WriteBuffer};
use crate::config::{Config, WriteInterval, WriteSettings};
use crate::error::{RelayError, RelayResult};
use crate::format::Formatter;
use crate::health::{ConnectionEvent, HealthMonitor};
use crate::influx::InfluxClient;
use crate::measurement::Measurement;
use crate::telemetry::{CapabilityEvent, Event};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, RwLock,
};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug)]
pub struct RelayStats {
    pub measurements_written_total: AtomicU64,
    pub dropped_total: AtomicU64,
    pub connected: AtomicBool,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub last_error: Mutex<Option<String>>,
    dropping: AtomicBool,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            measurements_written_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            last_flush_unix_ms: AtomicU64::new(0),
            last_batch_len: AtomicU64::new(0),
            average_flush_micros: AtomicU64::new(0),
            last_error: Mutex::new(None),
            dropping: AtomicBool::new(false),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    fn record_write(&self, len: usize, started: Instant) {
        self.measurements_written_total
            .fetch_add(len as u64, Ordering::Relaxed);
        self.last_batch_len.store(len as u64, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_flush_unix_ms.store(now, Ordering::Relaxed);
        let micros = started.elapsed().as_micros() as u64;
        let prev = self.average_flush_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
        self.average_flush_micros.store(avg, Ordering::Relaxed);
        self.clear_error();
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// What a single flush attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush holds the single-flight guard.
    Busy,
    Empty,
    /// Health check failed; the buffer was left untouched.
    Offline,
    Written(usize),
    /// The write failed and the batch went back into the buffer.
    Requeued(usize),
}

/// Snapshot served to the surrounding application.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub url: String,
    pub database: String,
    pub connected: bool,
    pub measurements_written_total: u64,
    pub buffered: usize,
    pub dropped_total: u64,
    pub last_flush_unix_ms: u64,
    pub last_error: Option<String>,
}

struct Inner {
    buffer: Mutex<WriteBuffer>,
    health: tokio::sync::Mutex<HealthMonitor>,
    client: RwLock<InfluxClient>,
    formatter: Formatter,
    stats: RelayStats,
    write_interval_secs: AtomicU64,
    kick: Notify,
    events: broadcast::Sender<ConnectionEvent>,
}

#[derive(Clone)]
pub struct PipelineHandle {
    inner: Arc<Inner>,
}

impl PipelineHandle {
    pub fn new(
        client: InfluxClient,
        limits: BufferLimits,
        interval: WriteInterval,
        formatter: Formatter,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Inner {
            buffer: Mutex::new(WriteBuffer::new(limits)),
            health: tokio::sync::Mutex::new(HealthMonitor::new(events.clone())),
            client: RwLock::new(client),
            formatter,
            stats: RelayStats::new(),
            write_interval_secs: AtomicU64::new(interval.seconds()),
            kick: Notify::new(),
            events,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("influx-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build InfluxDB http client")?;
        Ok(Self::new(
            InfluxClient::new(http, config.settings.clone()),
            config.buffer_limits,
            config.write_interval,
            Formatter::new(config.format.clone()),
        ))
    }

    fn lock_buffer(&self) -> MutexGuard<'_, WriteBuffer> {
        self.inner
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn client(&self) -> InfluxClient {
        match self.inner.client.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn stats(&self) -> &RelayStats {
        &self.inner.stats
    }

    pub fn formatter(&self) -> &Formatter {
        &self.inner.formatter
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn buffered(&self) -> usize {
        self.lock_buffer().len()
    }

    pub fn write_interval(&self) -> Duration {
        Duration::from_secs(self.inner.write_interval_secs.load(Ordering::Relaxed))
    }

    /// Applies from the next reschedule; the pending timer keeps its deadline.
    pub fn set_write_interval(&self, seconds: u64) -> RelayResult<()> {
        let interval = WriteInterval::new(seconds)?;
        self.inner
            .write_interval_secs
            .store(interval.seconds(), Ordering::Relaxed);
        tracing::info!(seconds, "write interval updated");
        Ok(())
    }

    pub fn enqueue(&self, measurement: Measurement) -> PushOutcome {
        let outcome = self.lock_buffer().push(measurement);
        let stats = &self.inner.stats;
        match outcome {
            PushOutcome::Accepted { len, early_flush } => {
                stats.dropping.store(false, Ordering::Relaxed);
                tracing::trace!(len, "queued measurement");
                if early_flush && stats.connected.load(Ordering::Relaxed) {
                    self.inner.kick.notify_one();
                }
            }
            PushOutcome::Dropped => {
                stats.dropped_total.fetch_add(1, Ordering::Relaxed);
                if !stats.dropping.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        hard_limit = self.lock_buffer().limits().hard(),
                        "write buffer full; dropping measurements"
                    );
                }
            }
        }
        outcome
    }

    /// Returns how many measurements were accepted.
    pub fn enqueue_all(&self, measurements: impl IntoIterator<Item = Measurement>) -> usize {
        measurements
            .into_iter()
            .map(|measurement| self.enqueue(measurement))
            .filter(|outcome| matches!(outcome, PushOutcome::Accepted { .. }))
            .count()
    }

    pub fn ingest_events(&self, events: &[Event]) -> usize {
        self.enqueue_all(self.inner.formatter.from_events(events))
    }

    /// `false` when the value could not be formatted.
    pub fn ingest_capability(&self, event: &CapabilityEvent) -> bool {
        match self.inner.formatter.from_capability(event) {
            Some(measurement) => matches!(self.enqueue(measurement), PushOutcome::Accepted { .. }),
            None => {
                tracing::trace!(cap = %event.cap_id, "skipping unsupported capability value");
                false
            }
        }
    }

    /// One flush cycle: health check, drain, write, re-queue on failure.
    /// Skips immediately when another cycle holds the guard.
    pub async fn flush(&self) -> FlushOutcome {
        let Ok(mut health) = self.inner.health.try_lock() else {
            return FlushOutcome::Busy;
        };
        if self.buffered() == 0 {
            return FlushOutcome::Empty;
        }

        let client = self.client();
        let stats = &self.inner.stats;
        let check = health.check_health(&client).await;
        stats.set_connected(health.is_connected());
        if let Err(err) = check {
            if !matches!(err, RelayError::ConfigurationIncomplete) {
                stats.record_error(err.to_string());
            }
            return FlushOutcome::Offline;
        }

        let batch = self.lock_buffer().drain_all();
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }
        let len = batch.len();
        let started = Instant::now();
        match client.write(&batch).await {
            Ok(()) => {
                stats.record_write(len, started);
                tracing::debug!(len, micros = started.elapsed().as_micros() as u64, "flushed batch");
                FlushOutcome::Written(len)
            }
            Err(err) => {
                stats.record_error(err.to_string());
                tracing::warn!(error = %err, len, "write failed; re-queued batch");
                self.lock_buffer().requeue(batch);
                FlushOutcome::Requeued(len)
            }
        }
    }

    /// Writes a pre-built batch directly, bypassing the buffer. Waits for any
    /// in-flight flush; failures go back to the caller and nothing is re-queued.
    pub async fn write_batch(&self, batch: Vec<Measurement>) -> RelayResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut health = self.inner.health.lock().await;
        let client = self.client();
        let stats = &self.inner.stats;
        let check = health.check_health(&client).await;
        stats.set_connected(health.is_connected());
        check?;

        let len = batch.len();
        let started = Instant::now();
        if let Err(err) = client.write(&batch).await {
            stats.record_error(err.to_string());
            return Err(err);
        }
        stats.record_write(len, started);
        tracing::debug!(len, "wrote direct batch");
        Ok(len)
    }

    /// Replaces the settings wholesale; the next cycle re-validates the target.
    pub async fn update_settings(&self, settings: WriteSettings) {
        let url = settings.base_url();
        let database = settings.database.clone();
        {
            let mut client = match self.inner.client.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let http = client.http().clone();
            *client = InfluxClient::new(http, settings);
        }
        self.inner.health.lock().await.reset();
        self.inner.stats.set_connected(false);
        tracing::info!(url = %url, database = %database, "influx settings replaced");
    }

    pub fn status(&self) -> RelayStatus {
        let client = self.client();
        let settings = client.settings();
        let stats = &self.inner.stats;
        RelayStatus {
            url: settings.base_url(),
            database: settings.database.clone(),
            connected: stats.connected.load(Ordering::Relaxed),
            measurements_written_total: stats.measurements_written_total.load(Ordering::Relaxed),
            buffered: self.buffered(),
            dropped_total: stats.dropped_total.load(Ordering::Relaxed),
            last_flush_unix_ms: stats.last_flush_unix_ms.load(Ordering::Relaxed),
            last_error: stats.last_error(),
        }
    }
}

/// Running flush loop. Dropping it closes the shutdown channel, so the loop
/// stops at its next wait without anyone awaiting the task.
pub struct FlushScheduler {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl FlushScheduler {
    /// Cancels the pending timer and waits for an in-flight cycle to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.handle.await {
            tracing::warn!(error = %err, "flush scheduler task failed");
        }
    }
}

pub fn spawn_scheduler(pipeline: PipelineHandle) -> FlushScheduler {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        loop {
            let interval = pipeline.write_interval();
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = pipeline.inner.kick.notified() => {
                    tracing::debug!("soft limit exceeded; flushing early");
                }
            }

            match AssertUnwindSafe(pipeline.flush()).catch_unwind().await {
                Ok(outcome) => tracing::trace!(?outcome, "flush cycle finished"),
                Err(_) => tracing::error!("flush cycle panicked; rescheduling"),
            }
        }
        tracing::debug!("flush scheduler stopped");
    });
    FlushScheduler { handle, shutdown }
}
