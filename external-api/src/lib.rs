//! # Control plane API
//!
//! The HTTP surface of the monitor. Registration, removal, on-demand pings
//! and the catalog dump all land here and call into [`pinger_core::Monitor`];
//! `/health` and the prometheus endpoints come along for diagnostics.
//!
//! Responses are JSON; failures use the `{"ok":false,"message":"..."}`
//! envelope with 400 for validation problems and 500 for everything else.
//! A catch-panic layer turns handler panics into the same envelope instead
//! of unwinding the process.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use anyhow::{Result, bail};
use axum::{Router, extract::Extension, routing};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{debug, trace};

use std::{net::SocketAddr, sync::Arc};

use pinger_core::Monitor;

/// The task runner for the [`ControlApi`]; aborts the server on drop.
#[derive(Debug)]
pub struct ControlApiGuard {
    task_handle: JoinHandle<Result<()>>,
}

impl Drop for ControlApiGuard {
    fn drop(&mut self) {
        trace!("ControlApiGuard drop called");
        self.task_handle.abort();
    }
}

/// Serves the monitor's HTTP control plane.
#[derive(Debug)]
pub struct ControlApi {
    addr: SocketAddr,
    monitor: Arc<Monitor>,
}

impl ControlApi {
    /// Create a new ControlApi instance
    pub fn new(addr: SocketAddr, monitor: Arc<Monitor>) -> Self {
        trace!("starting control api");
        Self { addr, monitor }
    }

    /// serve the HTTP control plane
    async fn run(addr: SocketAddr, monitor: Arc<Monitor>) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Router::new()
            .route("/ping-now", routing::get(handlers::ping_now))
            .route("/ping-api", routing::get(handlers::ping_api))
            .route("/store-host", routing::get(handlers::store_host))
            .route("/remove-host", routing::get(handlers::remove_host))
            .route("/store", routing::post(handlers::store))
            .route("/get-or-store", routing::post(handlers::get_or_store))
            .route("/dump-hosts", routing::get(handlers::dump_hosts))
            .route("/health", routing::get(handlers::health))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .layer(Extension(monitor))
            .layer(tower_http::catch_panic::CatchPanicLayer::custom(
                handlers::panic_response,
            ))
            .layer(tower_http::trace::TraceLayer::new_for_http());

        debug!("control api listening on {}", addr);

        axum::serve(tcp, app).await?;
        bail!("control api returned-- should not happen")
    }

    /// Kick off the HTTP service.
    pub fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(Self::run(self.addr, self.monitor))
    }

    /// Start the service under a [`ControlApiGuard`].
    pub fn serve(self) -> ControlApiGuard {
        ControlApiGuard {
            task_handle: self.start(),
        }
    }
}

mod handlers {
    use axum::{
        body::{Body, Bytes},
        extract::{Extension, Query},
        http::{Response, StatusCode, header},
        response::{IntoResponse, Json},
    };
    use pinger_core::{
        Error as CoreError, Monitor, PingResult,
        metrics::{START_TIME, UPTIME},
        wire::{LivenessSnapshot, TopicsDoc},
    };
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use serde_json::json;
    use tracing::error;

    use std::{any::Any, collections::HashMap, str::FromStr, sync::Arc};

    /// Probe count for on-demand pings when the query does not set one.
    const DEFAULT_PING_PROBES: u32 = 5;

    /// An error envelope: `{"ok":false,"message":"..."}` plus a status code.
    pub(crate) struct ApiError {
        status: StatusCode,
        message: String,
    }

    impl ApiError {
        fn bad_request(message: impl Into<String>) -> Self {
            Self {
                status: StatusCode::BAD_REQUEST,
                message: message.into(),
            }
        }

        fn internal(message: impl Into<String>) -> Self {
            Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: message.into(),
            }
        }
    }

    impl From<CoreError> for ApiError {
        fn from(err: CoreError) -> Self {
            let status = match &err {
                CoreError::InvalidInput(_) | CoreError::NotFound(_) => StatusCode::BAD_REQUEST,
                CoreError::ResolveFailed(_) | CoreError::Ping(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            Self {
                status,
                message: err.to_string(),
            }
        }
    }

    impl IntoResponse for ApiError {
        fn into_response(self) -> axum::response::Response {
            error!(status = %self.status, message = %self.message, "request failed");
            (
                self.status,
                Json(json!({"ok": false, "message": self.message})),
            )
                .into_response()
        }
    }

    fn ok_body() -> Json<serde_json::Value> {
        Json(json!({"ok": true}))
    }

    fn require<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ApiError> {
        params
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ApiError::bad_request(format!("Missing {key}")))
    }

    fn parse_or<T: FromStr>(
        params: &HashMap<String, String>,
        key: &str,
        default: T,
    ) -> Result<T, ApiError> {
        match params.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::bad_request(format!("Cannot parse '{key}'"))),
            None => Ok(default),
        }
    }

    pub(crate) async fn ping_now(
        Extension(monitor): Extension<Arc<Monitor>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Result<Json<PingResult>, ApiError> {
        let host = require(&params, "host")?;
        let probes = parse_or(&params, "probes", DEFAULT_PING_PROBES)?;
        Ok(Json(monitor.ping_now(host, probes).await?))
    }

    pub(crate) async fn ping_api(
        Extension(monitor): Extension<Arc<Monitor>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let host = require(&params, "host")?;
        let probes = parse_or(&params, "probes", DEFAULT_PING_PROBES)?;
        let Some(template) = monitor.result_url() else {
            return Err(ApiError::internal("Missing pinger.result-url in config"));
        };
        monitor.ping_then_notify(host.to_owned(), probes, template.to_owned());
        Ok(ok_body())
    }

    pub(crate) async fn store_host(
        Extension(monitor): Extension<Arc<Monitor>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let host = require(&params, "host")?;
        let interval = parse_or(&params, "interval", monitor.default_interval_secs())?;
        let probes = parse_or(&params, "probes", monitor.default_probes())?;
        // legacy parameter, checked for shape but otherwise unused
        let _timeout: u64 = parse_or(&params, "timeout", 0)?;
        monitor.store_host(host, interval, probes)?;
        Ok(ok_body())
    }

    pub(crate) async fn remove_host(
        Extension(monitor): Extension<Arc<Monitor>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Result<Json<serde_json::Value>, ApiError> {
        let host = require(&params, "host")?;
        monitor.remove(host)?;
        Ok(ok_body())
    }

    pub(crate) async fn store(
        Extension(monitor): Extension<Arc<Monitor>>,
        body: Bytes,
    ) -> Result<Json<LivenessSnapshot>, ApiError> {
        register_body(&monitor, &body, false)
    }

    pub(crate) async fn get_or_store(
        Extension(monitor): Extension<Arc<Monitor>>,
        body: Bytes,
    ) -> Result<Json<LivenessSnapshot>, ApiError> {
        register_body(&monitor, &body, true)
    }

    fn register_body(
        monitor: &Monitor,
        body: &[u8],
        remove_old: bool,
    ) -> Result<Json<LivenessSnapshot>, ApiError> {
        let doc: TopicsDoc = serde_json::from_slice(body)
            .map_err(|err| ApiError::bad_request(format!("Cannot parse json body: {err}")))?;
        Ok(Json(monitor.register(doc, remove_old)?))
    }

    pub(crate) async fn dump_hosts(
        Extension(monitor): Extension<Arc<Monitor>>,
    ) -> Json<TopicsDoc> {
        Json(monitor.dump())
    }

    pub(crate) async fn health() -> impl IntoResponse {
        StatusCode::OK
    }

    pub(crate) async fn metrics() -> Result<impl IntoResponse, std::convert::Infallible> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap())
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf)).unwrap()),
        }
    }

    pub(crate) async fn metrics_text() -> Result<impl IntoResponse, std::convert::Infallible> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap())
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf)).unwrap()),
        }
    }

    /// The structured stand-in for the old recover middleware: a panicking
    /// handler answers with the error envelope instead of unwinding.
    pub(crate) fn panic_response(err: Box<dyn Any + Send + 'static>) -> axum::response::Response {
        let detail = if let Some(s) = err.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = err.downcast_ref::<&str>() {
            (*s).to_owned()
        } else {
            "unknown panic".to_owned()
        };
        error!(%detail, "recovered panic in request handler");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"ok": false, "message": "Internal error"})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pinger_core::{PingResult, Prober};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    /// Answers instantly so the HTTP layer can be exercised without a raw
    /// socket or elevated privileges.
    #[derive(Debug)]
    struct StaticProber(PingResult);

    #[async_trait]
    impl Prober for StaticProber {
        async fn probe(&self, _ip: Ipv4Addr, _probes: u32) -> icmp_ping::Result<PingResult> {
            Ok(self.0)
        }
    }

    fn monitor() -> Arc<Monitor> {
        let config = config::Config::parse_str("").unwrap();
        Monitor::with_prober(
            Arc::new(StaticProber(PingResult {
                alive: true,
                success_percent: 100,
                avg_rtt_ns: 1_000_000,
                avg_rtt_ms: 1.0,
            })),
            &config,
        )
        .unwrap()
    }

    async fn serve_on(port: u16) -> ControlApiGuard {
        let api = ControlApi::new(([127, 0, 0, 1], port).into(), monitor());
        let guard = api.serve();
        // wait for the server to come up
        tokio::time::sleep(Duration::from_millis(300)).await;
        guard
    }

    #[tokio::test]
    async fn ping_now_returns_a_result() -> anyhow::Result<()> {
        let _guard = serve_on(18081).await;
        let body: serde_json::Value =
            reqwest::get("http://127.0.0.1:18081/ping-now?host=127.0.0.1&probes=2")
                .await?
                .error_for_status()?
                .json()
                .await?;
        assert_eq!(body["alive"], true);
        assert_eq!(body["success_percent"], 100);
        Ok(())
    }

    #[tokio::test]
    async fn missing_host_yields_the_error_envelope() -> anyhow::Result<()> {
        let _guard = serve_on(18082).await;
        let response = reqwest::get("http://127.0.0.1:18082/ping-now").await?;
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await?;
        assert_eq!(body["ok"], false);
        assert_eq!(body["message"], "Missing host");
        Ok(())
    }

    #[tokio::test]
    async fn bulk_store_returns_the_liveness_snapshot() -> anyhow::Result<()> {
        let _guard = serve_on(18083).await;
        let client = reqwest::Client::new();
        let body: serde_json::Value = client
            .post("http://127.0.0.1:18083/store")
            .body(r#"{"T1":{"Probes":2,"Interval":30,"Hosts":[{"host":"127.0.0.1"}]}}"#)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        assert_eq!(body, serde_json::json!({"T1": {"127.0.0.1": false}}));

        // the dump now carries the registered host
        let dump: serde_json::Value = client
            .get("http://127.0.0.1:18083/dump-hosts")
            .send()
            .await?
            .json()
            .await?;
        assert_eq!(dump["T1"]["Hosts"][0]["host"], "127.0.0.1");
        Ok(())
    }

    #[tokio::test]
    async fn store_host_validates_interval() -> anyhow::Result<()> {
        let _guard = serve_on(18084).await;
        let response =
            reqwest::get("http://127.0.0.1:18084/store-host?host=10.0.0.1&interval=10").await?;
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await?;
        assert_eq!(body["ok"], false);

        reqwest::get("http://127.0.0.1:18084/store-host?host=10.0.0.1&interval=60")
            .await?
            .error_for_status()?;
        Ok(())
    }

    #[tokio::test]
    async fn remove_host_reports_unknown_ips() -> anyhow::Result<()> {
        let _guard = serve_on(18085).await;
        let response = reqwest::get("http://127.0.0.1:18085/remove-host?host=203.0.113.7").await?;
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await?;
        assert_eq!(body["message"], "no topic contains host '203.0.113.7'");
        Ok(())
    }

    #[tokio::test]
    async fn metrics_text_is_exposed() -> anyhow::Result<()> {
        let _guard = serve_on(18086).await;
        let text = reqwest::get("http://127.0.0.1:18086/metrics-text")
            .await?
            .error_for_status()?
            .text()
            .await?;
        assert!(text.contains("pinger_uptime_seconds"));
        Ok(())
    }
}
