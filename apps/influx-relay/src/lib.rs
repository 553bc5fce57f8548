pub mod buffer;
pub mod config;
pub mod error;
pub mod escape;
pub mod format;
pub mod health;
pub mod host_metrics;
pub mod http;
pub mod influx;
pub mod measurement;
pub mod mqtt;
pub mod pipeline;
pub mod telemetry;

#[cfg(test)]
pub mod test_support;
