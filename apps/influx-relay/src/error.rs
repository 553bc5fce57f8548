use reqwest::StatusCode;

/// Failures surfaced by the relay core.
///
/// Network-facing variants (`Unreachable`, `Timeout`, `Protocol`) never escape
/// the flush cycle; they become connection-state transitions or re-queued
/// batches. Only validation errors reach callers synchronously.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("InfluxDB settings are incomplete (host, database, port or protocol)")]
    ConfigurationIncomplete,
    #[error("InfluxDB at {url} is unreachable: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("InfluxDB at {url} timed out")]
    Timeout { url: String },
    #[error("InfluxDB at {url} rejected the request: {detail}")]
    Protocol { url: String, detail: String },
    #[error("invalid write interval {0}s (expected 10..=60)")]
    InvalidWriteInterval(u64),
    #[error("invalid buffer limits: soft {soft} must be below hard {hard}")]
    InvalidBufferLimits { soft: usize, hard: usize },
    #[error("invalid InfluxDB url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl RelayError {
    pub(crate) fn transport(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RelayError::Timeout {
                url: url.to_string(),
            }
        } else {
            RelayError::Unreachable {
                url: url.to_string(),
                source: err,
            }
        }
    }

    pub(crate) fn status(url: &str, status: StatusCode) -> Self {
        RelayError::Protocol {
            url: url.to_string(),
            detail: format!("unexpected status {status}"),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidWriteInterval(_) | RelayError::InvalidBufferLimits { .. }
        )
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
