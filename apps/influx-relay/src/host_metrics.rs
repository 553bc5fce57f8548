use crate::pipeline::PipelineHandle;
use crate::telemetry::{Event, EventTags, EventTimestamp};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::time::MissedTickBehavior;

/// Point-in-time view of the relay host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSnapshot {
    pub load_average: [f64; 3],
    pub cpu_usage: Option<f64>,
    pub memory_total: u64,
    pub memory_free: u64,
    pub memory_swap: u64,
    pub storage: Option<(u64, u64)>,
}

impl HostSnapshot {
    fn capture(system: &mut System, disks: &mut Disks) -> Self {
        system.refresh_cpu_all();
        system.refresh_memory();
        disks.refresh(true);

        let load = System::load_average();
        let cpu_usage = Some(system.global_cpu_usage() as f64)
            .filter(|value| value.is_finite() && *value >= 0.0);
        let storage = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .or_else(|| disks.list().first())
            .map(|disk| (disk.total_space(), disk.available_space()));

        Self {
            load_average: [load.one, load.five, load.fifteen],
            cpu_usage,
            memory_total: system.total_memory(),
            memory_free: system.available_memory(),
            memory_swap: system.used_swap(),
            storage,
        }
    }

    /// `hub:cpu_load`, `hub:memory` and, when a disk is visible, `hub:storage`.
    pub fn to_events(&self, ts: DateTime<Utc>) -> Vec<Event> {
        let mut cpu = Map::new();
        cpu.insert("average_1".into(), Value::from(self.load_average[0]));
        cpu.insert("average_5".into(), Value::from(self.load_average[1]));
        cpu.insert("average_15".into(), Value::from(self.load_average[2]));
        if let Some(usage) = self.cpu_usage {
            cpu.insert("cpu_usage".into(), Value::from(usage));
        }

        let mut memory = Map::new();
        memory.insert("memory_total".into(), Value::from(self.memory_total));
        memory.insert("memory_free".into(), Value::from(self.memory_free));
        memory.insert("memory_swap".into(), Value::from(self.memory_swap));

        let mut events = vec![
            host_event("hub:cpu_load", "cpu_load", cpu, ts),
            host_event("hub:memory", "memory", memory, ts),
        ];
        if let Some((total, free)) = self.storage {
            let mut storage = Map::new();
            storage.insert("storage_total".into(), Value::from(total));
            storage.insert("storage_free".into(), Value::from(free));
            events.push(host_event("hub:storage", "storage", storage, ts));
        }
        events
    }
}

fn host_event(name: &str, tag: &str, fields: Map<String, Value>, ts: DateTime<Utc>) -> Event {
    Event {
        name: name.to_string(),
        tags: Some(EventTags::Positional(vec![tag.to_string()])),
        fields,
        ts: Some(EventTimestamp::from(ts)),
        ..Event::default()
    }
}

pub async fn run(interval: Duration, pipeline: PipelineHandle) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut system = System::new_all();
    let mut disks = Disks::new_with_refreshed_list();

    loop {
        ticker.tick().await;
        let snapshot = HostSnapshot::capture(&mut system, &mut disks);
        let accepted = pipeline.ingest_events(&snapshot.to_events(Utc::now()));
        tracing::trace!(accepted, "queued host metrics");
    }
}
