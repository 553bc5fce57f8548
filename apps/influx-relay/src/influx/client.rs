use super::line_protocol::render_batch;
use crate::config::{ProtocolVersion, WriteSettings};
use crate::error::{RelayError, RelayResult};
use crate::escape::quoted;
use crate::measurement::Measurement;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use url::form_urlencoded;
use url::Url;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const LINE_PROTOCOL_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<QueryResult>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(default)]
    series: Vec<QuerySeries>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuerySeries {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: String,
}

/// HTTP adapter for one InfluxDB target. Rebuilt whenever settings change.
#[derive(Clone)]
pub struct InfluxClient {
    http: Client,
    settings: Arc<WriteSettings>,
}

impl InfluxClient {
    pub fn new(http: Client, settings: WriteSettings) -> Self {
        Self {
            http,
            settings: Arc::new(settings),
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn settings(&self) -> &WriteSettings {
        &self.settings
    }

    fn endpoint(&self, path: &str) -> RelayResult<Url> {
        let base = self.settings.base_url();
        if base.is_empty() {
            return Err(RelayError::ConfigurationIncomplete);
        }
        Ok(Url::parse(&base)?.join(path)?)
    }

    fn token_header(&self) -> String {
        format!("Token {}", self.settings.token)
    }

    /// Reachability check for the configured protocol generation.
    ///
    /// v2 targets try the legacy ping first and only fall back to the
    /// token-authenticated health endpoint when that fails.
    pub async fn probe(&self) -> RelayResult<()> {
        match self.settings.protocol_version() {
            ProtocolVersion::V1 => self.ping_v1().await,
            ProtocolVersion::V2 => match self.ping_v1().await {
                Ok(()) => Ok(()),
                Err(err) => {
                    tracing::debug!(error = %err, "influx ping failed; trying v2 health");
                    self.health_v2().await
                }
            },
        }
    }

    pub async fn ping_v1(&self) -> RelayResult<()> {
        let url = self.endpoint("ping")?;
        let label = redacted(&url);
        let resp = self
            .http
            .get(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|err| RelayError::transport(&label, err))?;
        if resp.status() != StatusCode::NO_CONTENT {
            return Err(RelayError::status(&label, resp.status()));
        }
        Ok(())
    }

    pub async fn health_v2(&self) -> RelayResult<()> {
        let url = self.endpoint("health")?;
        let label = redacted(&url);
        let resp = self
            .http
            .get(url)
            .header(AUTHORIZATION, self.token_header())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|err| RelayError::transport(&label, err))?;
        if resp.status() != StatusCode::OK {
            return Err(RelayError::status(&label, resp.status()));
        }
        let health: HealthResponse = resp.json().await.map_err(|err| RelayError::Protocol {
            url: label.clone(),
            detail: format!("unreadable health body: {err}"),
        })?;
        if health.status != "pass" {
            return Err(RelayError::Protocol {
                url: label,
                detail: format!("health status is {:?}", health.status),
            });
        }
        Ok(())
    }

    async fn query(&self, statement: &str) -> RelayResult<QueryResponse> {
        let mut url = self.endpoint("query")?;
        url.query_pairs_mut()
            .append_pair("u", &self.settings.username)
            .append_pair("p", &self.settings.password);
        let label = redacted(&url);
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("q", statement)
            .finish();

        let resp = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|err| RelayError::transport(&label, err))?;
        if !resp.status().is_success() {
            return Err(RelayError::status(&label, resp.status()));
        }
        let parsed: QueryResponse = resp.json().await.map_err(|err| RelayError::Protocol {
            url: label.clone(),
            detail: format!("unreadable query body: {err}"),
        })?;
        if let Some(error) = parsed.results.iter().find_map(|r| r.error.clone()) {
            return Err(RelayError::Protocol { url: label, detail: error });
        }
        Ok(parsed)
    }

    /// `SHOW DATABASES`, flattened to the first column of the first series.
    pub async fn database_names(&self) -> RelayResult<Vec<String>> {
        let response = self.query("SHOW DATABASES").await?;
        let names = response
            .results
            .first()
            .and_then(|result| result.series.first())
            .map(|series| {
                series
                    .values
                    .iter()
                    .filter_map(|row| row.first().and_then(|v| v.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    pub async fn create_database(&self) -> RelayResult<()> {
        let statement = format!("CREATE DATABASE {}", quoted(&self.settings.database));
        self.query(&statement).await?;
        Ok(())
    }

    /// v1 readiness. Returns whether the database had to be created.
    ///
    /// A failed listing still attempts the create; `CREATE DATABASE` is
    /// idempotent on the server side.
    pub async fn ensure_database(&self) -> RelayResult<bool> {
        match self.database_names().await {
            Ok(names) if names.iter().any(|name| name == &self.settings.database) => Ok(false),
            Ok(_) => {
                self.create_database().await?;
                Ok(true)
            }
            Err(err) => {
                tracing::warn!(error = %err, "listing influx databases failed; creating anyway");
                self.create_database().await?;
                Ok(true)
            }
        }
    }

    /// Sends the whole batch as one request. Any non-success status fails
    /// the batch as a unit.
    pub async fn write(&self, measurements: &[Measurement]) -> RelayResult<()> {
        if measurements.is_empty() {
            return Ok(());
        }
        let settings = &self.settings;
        let (url, token) = match settings.protocol_version() {
            ProtocolVersion::V1 => {
                let mut url = self.endpoint("write")?;
                url.query_pairs_mut()
                    .append_pair("db", &settings.database)
                    .append_pair("u", &settings.username)
                    .append_pair("p", &settings.password)
                    .append_pair("precision", "ms");
                (url, None)
            }
            ProtocolVersion::V2 => {
                let mut url = self.endpoint("api/v2/write")?;
                url.query_pairs_mut()
                    .append_pair("orgID", &settings.organization)
                    .append_pair("bucket", &settings.database)
                    .append_pair("precision", "ms");
                (url, Some(self.token_header()))
            }
        };
        let label = redacted(&url);

        let mut builder = self
            .http
            .post(url)
            .header(CONTENT_TYPE, LINE_PROTOCOL_CONTENT_TYPE)
            .body(render_batch(measurements))
            .timeout(REQUEST_TIMEOUT);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, token);
        }

        let resp = builder
            .send()
            .await
            .map_err(|err| RelayError::transport(&label, err))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::Protocol {
                url: label,
                detail: format!("write returned {status}: {}", body.trim()),
            });
        }
        Ok(())
    }
}

/// Endpoint without the query string so credentials stay out of logs.
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
