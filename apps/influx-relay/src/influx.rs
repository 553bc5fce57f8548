mod client;
mod line_protocol;

pub use client::{InfluxClient, PROBE_TIMEOUT, REQUEST_TIMEOUT};
pub use line_protocol::{render_batch, render_line};
