use crate::config::WriteSettings;
use axum::extract::{OriginalUri, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub path: String,
    pub params: HashMap<String, String>,
    pub body: String,
    pub authorization: Option<String>,
}

#[derive(Debug)]
struct FakeState {
    ping_status: u16,
    health_status: u16,
    health_body_status: String,
    query_status: u16,
    create_status: u16,
    write_status: u16,
    databases: Vec<String>,
    queries: Vec<String>,
    health_authorizations: Vec<String>,
    writes: Vec<RecordedWrite>,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            ping_status: 204,
            health_status: 200,
            health_body_status: "pass".to_string(),
            query_status: 200,
            create_status: 200,
            write_status: 204,
            databases: vec!["_internal".to_string()],
            queries: Vec::new(),
            health_authorizations: Vec::new(),
            writes: Vec::new(),
        }
    }
}

type Shared = Arc<Mutex<FakeState>>;

fn lock(state: &Shared) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn authorization(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn ping(State(state): State<Shared>) -> StatusCode {
    status(lock(&state).ping_status)
}

async fn health(State(state): State<Shared>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    let mut guard = lock(&state);
    if let Some(auth) = authorization(&headers) {
        guard.health_authorizations.push(auth);
    }
    (
        status(guard.health_status),
        Json(json!({ "name": "influxdb", "status": guard.health_body_status })),
    )
}

async fn query(State(state): State<Shared>, body: String) -> (StatusCode, Json<Value>) {
    let statement = url::form_urlencoded::parse(body.as_bytes())
        .find(|(key, _)| key == "q")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();
    let mut guard = lock(&state);
    guard.queries.push(statement.clone());

    if statement == "SHOW DATABASES" {
        if guard.query_status != 200 {
            return (status(guard.query_status), Json(json!({ "error": "boom" })));
        }
        let values: Vec<Value> = guard.databases.iter().map(|db| json!([db])).collect();
        return (
            StatusCode::OK,
            Json(json!({
                "results": [{
                    "statement_id": 0,
                    "series": [{ "name": "databases", "columns": ["name"], "values": values }]
                }]
            })),
        );
    }

    if let Some(name) = statement.strip_prefix("CREATE DATABASE ") {
        if guard.create_status != 200 {
            return (status(guard.create_status), Json(json!({ "error": "boom" })));
        }
        let name = name.trim_matches('"').to_string();
        if !guard.databases.contains(&name) {
            guard.databases.push(name);
        }
        return (
            StatusCode::OK,
            Json(json!({ "results": [{ "statement_id": 0 }] })),
        );
    }

    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "unsupported statement" })),
    )
}

async fn write(
    State(state): State<Shared>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let mut guard = lock(&state);
    guard.writes.push(RecordedWrite {
        path: uri.path().to_string(),
        params,
        body,
        authorization: authorization(&headers),
    });
    status(guard.write_status)
}

/// In-process InfluxDB stand-in serving the v1 and v2 endpoints the relay uses.
pub struct FakeInflux {
    addr: SocketAddr,
    state: Shared,
    task: JoinHandle<()>,
}

impl FakeInflux {
    pub async fn start() -> anyhow::Result<Self> {
        let state: Shared = Arc::new(Mutex::new(FakeState::default()));
        let app = Router::new()
            .route("/ping", get(ping))
            .route("/health", get(health))
            .route("/query", post(query))
            .route("/write", post(write))
            .route("/api/v2/write", post(write))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Ok(Self { addr, state, task })
    }

    pub fn settings(&self) -> WriteSettings {
        WriteSettings {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            database: "homey".to_string(),
            ..WriteSettings::default()
        }
    }

    pub fn v2_settings(&self) -> WriteSettings {
        WriteSettings {
            organization: "my-org".to_string(),
            token: "s3cret".to_string(),
            ..self.settings()
        }
    }

    pub fn set_ping_status(&self, code: u16) {
        lock(&self.state).ping_status = code;
    }

    pub fn set_health_body_status(&self, value: &str) {
        lock(&self.state).health_body_status = value.to_string();
    }

    pub fn set_query_status(&self, code: u16) {
        lock(&self.state).query_status = code;
    }

    pub fn set_create_status(&self, code: u16) {
        lock(&self.state).create_status = code;
    }

    pub fn set_write_status(&self, code: u16) {
        lock(&self.state).write_status = code;
    }

    pub fn add_database(&self, name: &str) {
        lock(&self.state).databases.push(name.to_string());
    }

    pub fn databases(&self) -> Vec<String> {
        lock(&self.state).databases.clone()
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.state).queries.clone()
    }

    pub fn health_authorizations(&self) -> Vec<String> {
        lock(&self.state).health_authorizations.clone()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn written_lines(&self) -> Vec<String> {
        lock(&self.state)
            .writes
            .iter()
            .flat_map(|write| write.body.lines().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }
}

impl Drop for FakeInflux {
    fn drop(&mut self) {
        self.task.abort();
    }
}
