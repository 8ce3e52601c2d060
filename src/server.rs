use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::Uri,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};

use crate::{
    error::{ApiError, ApiResult},
    oui::{HttpOuiSource, OuiError, OuiResolver},
    ports::MAX_PORTS_PER_REQUEST,
    probe,
    proxy::{Relayed, UpstreamProxy},
    publish::{CloudflareCredentials, DnsPublisher, DnsRecordInput},
    rdns,
    types::{PingReport, PortCheckReport, ReverseDnsResult, VendorLookup},
};

/// Largest per-attempt timeout a client may ask for.
pub const MAX_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Everything needed to build the HTTP service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub oui_url: String,
    pub upstream_timeout: Duration,
    pub upstreams: Vec<(String, String)>,
    pub cloudflare: Option<CloudflareCredentials>,
    pub cloudflare_api_base: String,
}

#[derive(Clone)]
pub struct AppState {
    oui: Arc<OuiResolver>,
    proxy: Arc<UpstreamProxy>,
    publisher: Arc<DnsPublisher>,
}

impl AppState {
    pub fn new(oui: Arc<OuiResolver>, proxy: UpstreamProxy, publisher: DnsPublisher) -> Self {
        Self { oui, proxy: Arc::new(proxy), publisher: Arc::new(publisher) }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        let oui = OuiResolver::new(Arc::new(HttpOuiSource::new(client.clone(), &config.oui_url)));
        let proxy = UpstreamProxy::new(client.clone(), config.upstreams.iter().cloned());
        let publisher =
            DnsPublisher::new(client, config.cloudflare.clone(), &config.cloudflare_api_base);
        Ok(Self::new(oui, proxy, publisher))
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(get_health).fallback(method_not_allowed))
        .route("/ping", post(post_ping).fallback(method_not_allowed))
        .route("/port-check", post(post_port_check).fallback(method_not_allowed))
        .route("/reverse-dns", get(get_reverse_dns).fallback(method_not_allowed))
        .route("/oui", get(get_oui).fallback(method_not_allowed))
        .route("/proxy/{*target}", get(get_proxy).fallback(method_not_allowed))
        .route("/dns/publish", post(post_dns_publish).fallback(method_not_allowed))
        .with_state(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api)
        .fallback(not_found)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
}

pub async fn spawn_server(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let state = AppState::from_config(&config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("server stopped");
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct PingRequest {
    pub host: Option<String>,
    pub port: Option<Value>,
    pub count: Option<Value>,
    pub timeout: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct PortCheckRequest {
    pub host: Option<String>,
    pub ports: Option<Value>,
    pub timeout: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub record: Option<DnsRecordInput>,
}

#[derive(Debug, Deserialize)]
struct IpQuery {
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MacQuery {
    mac: Option<String>,
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    ok: bool,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    oui_loaded: bool,
    dns_publish_configured: bool,
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e.body_text())))
}

fn query<T>(q: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    q.map(|Query(v)| v)
        .map_err(|e| ApiError::BadRequest(format!("invalid query string: {}", e.body_text())))
}

fn require_host(host: Option<String>) -> ApiResult<String> {
    let host = host.map(|h| h.trim().to_string()).unwrap_or_default();
    if host.is_empty() {
        return Err(ApiError::BadRequest("host is required".into()));
    }
    if host.len() > 253 || host.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(ApiError::BadRequest(format!("invalid host: {host}")));
    }
    Ok(host)
}

/// Read an optional integer field. `80` and `80.0` are both integers;
/// strings, fractions and other JSON types are not.
fn int_field(v: Option<&Value>, name: &str) -> ApiResult<Option<i64>> {
    let Some(v) = v.filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    v.as_i64()
        .or_else(|| {
            v.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() <= i64::MAX as f64)
                .map(|f| f as i64)
        })
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest(format!("{name} must be an integer, got {v}")))
}

fn timeout_field(v: Option<&Value>) -> ApiResult<Option<u64>> {
    match int_field(v, "timeout")? {
        Some(ms) if ms < 0 => Err(ApiError::BadRequest(format!(
            "timeout must be a non-negative integer, got {ms}"
        ))),
        ms => Ok(ms.map(|ms| ms as u64)),
    }
}

fn attempt_timeout(ms: Option<u64>, default: Duration) -> Duration {
    ms.map(Duration::from_millis)
        .unwrap_or(default)
        .clamp(Duration::from_millis(1), MAX_ATTEMPT_TIMEOUT)
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

async fn not_found() -> ApiError {
    ApiError::NotFound("no such endpoint".into())
}

async fn get_health(State(app): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        oui_loaded: app.oui.is_loaded(),
        dns_publish_configured: app.publisher.is_configured(),
    })
}

async fn post_ping(payload: Result<Json<PingRequest>, JsonRejection>) -> ApiResult<Json<PingReport>> {
    let req = json_body(payload)?;
    let host = require_host(req.host)?;
    let port = match int_field(req.port.as_ref(), "port")? {
        None => probe::DEFAULT_PING_PORT,
        Some(p) if (1..=65535).contains(&p) => p as u16,
        Some(p) => return Err(ApiError::BadRequest(format!("invalid port: {p}"))),
    };
    let count = int_field(req.count.as_ref(), "count")?
        .unwrap_or(probe::DEFAULT_PING_COUNT as i64)
        .clamp(1, probe::MAX_PING_COUNT as i64) as u32;
    let timeout =
        attempt_timeout(timeout_field(req.timeout.as_ref())?, probe::DEFAULT_PING_TIMEOUT);

    debug!(%host, port, count, "ping");
    Ok(Json(probe::ping(&host, port, count, timeout).await))
}

async fn post_port_check(
    payload: Result<Json<PortCheckRequest>, JsonRejection>,
) -> ApiResult<Json<PortCheckReport>> {
    let req = json_body(payload)?;
    let host = require_host(req.host)?;
    let ports = match req.ports {
        Some(Value::Array(ports)) => ports,
        _ => return Err(ApiError::BadRequest("ports must be an array".into())),
    };
    if ports.is_empty() {
        return Err(ApiError::BadRequest("ports must not be empty".into()));
    }
    if ports.len() > MAX_PORTS_PER_REQUEST {
        return Err(ApiError::BadRequest(format!(
            "too many ports: {} (max {MAX_PORTS_PER_REQUEST})",
            ports.len()
        )));
    }
    let timeout =
        attempt_timeout(timeout_field(req.timeout.as_ref())?, probe::DEFAULT_PORT_CHECK_TIMEOUT);

    debug!(%host, ports = ports.len(), "port-check");
    let results = probe::check_ports(&host, &ports, timeout, MAX_PORTS_PER_REQUEST).await;
    Ok(Json(PortCheckReport { host, results }))
}

async fn get_reverse_dns(
    q: Result<Query<IpQuery>, QueryRejection>,
) -> ApiResult<Json<ReverseDnsResult>> {
    let ip = query(q)?
        .ip
        .filter(|ip| !ip.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("ip query parameter is required".into()))?;
    Ok(Json(rdns::reverse_lookup(&ip).await))
}

async fn get_oui(
    State(app): State<AppState>,
    q: Result<Query<MacQuery>, QueryRejection>,
) -> ApiResult<Json<VendorLookup>> {
    let mac = query(q)?
        .mac
        .ok_or_else(|| ApiError::BadRequest("mac query parameter is required".into()))?;
    let found = app.oui.vendor_for(&mac).await.map_err(|e| match e {
        OuiError::InvalidMac(_) => ApiError::BadRequest(e.to_string()),
        OuiError::Load(_) => ApiError::Internal(e.to_string()),
    })?;
    Ok(Json(found))
}

/// `/proxy/{upstream}[/{path}]`. The path is taken from the raw request URI
/// so percent-encoded characters are forwarded as they arrived.
async fn get_proxy(State(app): State<AppState>, uri: Uri) -> ApiResult<Relayed> {
    let (upstream, raw_path) = split_proxy_target(uri.path())
        .ok_or_else(|| ApiError::NotFound("no upstream given".into()))?;
    app.proxy.forward(upstream, raw_path, uri.query()).await
}

/// `.../proxy/local/a/b` → `("local", "a/b")`; `.../proxy/local/` → `("local", "")`.
fn split_proxy_target(path: &str) -> Option<(&str, &str)> {
    let (_, rest) = path.split_once("/proxy/")?;
    let (upstream, raw_path) = rest.split_once('/').unwrap_or((rest, ""));
    (!upstream.is_empty()).then_some((upstream, raw_path))
}

async fn post_dns_publish(
    State(app): State<AppState>,
    payload: Result<Json<PublishRequest>, JsonRejection>,
) -> ApiResult<Json<PublishResponse>> {
    if !app.publisher.is_configured() {
        return Err(ApiError::NotConfigured("DNS publishing is not configured".into()));
    }
    let req = json_body(payload)?;
    let record = crate::publish::validate(req.record)?;
    let message = app.publisher.publish(&record).await?;
    Ok(Json(PublishResponse { ok: true, message }))
}
