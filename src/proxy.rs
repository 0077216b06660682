use crate::config::ServerConfig;
use crate::control_plane::SharedControlPlane;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::matcher::{normalize_host, RouteMatcher};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::readiness::ReadinessOrchestrator;
use crate::registry::RouteRegistry;
use crate::route::Route;
use crate::stats::ProxyStats;
use crate::waiting;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Request handling settings taken from `[server]`
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub status_path: String,
    pub cluster_domain: String,
    /// Send every forwarded request here instead of the route's service
    pub upstream_override: Option<String>,
    pub request_timeout: Duration,
}

impl ProxySettings {
    pub fn from_config(server: &ServerConfig) -> Self {
        Self {
            status_path: server.status_path.clone(),
            cluster_domain: server.cluster_domain.clone(),
            upstream_override: server.upstream_override.clone(),
            request_timeout: server.request_timeout(),
        }
    }

    fn upstream_for(&self, route: &Route) -> String {
        match &self.upstream_override {
            Some(authority) => authority.clone(),
            None => route.upstream_authority(&self.cluster_domain),
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Everything a request handler needs, shared across connections
struct ProxyContext {
    matcher: RouteMatcher,
    readiness: ReadinessOrchestrator,
    pool: ConnectionPool,
    stats: Arc<ProxyStats>,
    settings: ProxySettings,
}

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    registry: Arc<RouteRegistry>,
    control_plane: SharedControlPlane,
    settings: ProxySettings,
    stats: Arc<ProxyStats>,
    pool_config: PoolConfig,
    cancel: CancellationToken,
    span: Span,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<RouteRegistry>,
        control_plane: SharedControlPlane,
        settings: ProxySettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            control_plane,
            settings,
            stats: Arc::new(ProxyStats::new()),
            pool_config: PoolConfig::default(),
            cancel,
            span: tracing::info_span!("proxy"),
        }
    }

    pub fn with_pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    /// Share request statistics with another component (the admin API)
    pub fn with_stats(mut self, stats: Arc<ProxyStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Use the given span as the parent of everything the proxy logs
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let span = self.span.clone();
        self.serve().instrument(span).await
    }

    async fn serve(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let matcher = RouteMatcher::new(Arc::clone(&self.registry))
            .with_span(tracing::debug_span!(parent: &self.span, "matcher"));
        let readiness = ReadinessOrchestrator::new(Arc::clone(&self.control_plane))
            .with_span(tracing::info_span!(parent: &self.span, "readiness"));
        let context = Arc::new(ProxyContext {
            matcher,
            readiness,
            pool: ConnectionPool::new(self.pool_config.clone()),
            stats: Arc::clone(&self.stats),
            settings: self.settings.clone(),
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&context);
                            tokio::spawn(
                                async move {
                                    if let Err(e) = handle_connection(stream, addr, context).await {
                                        debug!(addr = %addr, error = %e, "Connection error");
                                    }
                                }
                                .instrument(self.span.clone()),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Proxy server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<ProxyContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // HTTP/1.1 and h2c on the same port
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    context: Arc<ProxyContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.uri().path() == context.settings.status_path {
        let query = req.uri().query().unwrap_or("").to_string();
        return Ok(handle_status(&query, &context).await);
    }

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = match extract_host(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };
    let path = req.uri().path().to_string();

    debug!(host, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let route = match context.matcher.route_request(&host, &path) {
        Some(route) => route,
        None => {
            context.stats.record_unmatched();
            return Ok(json_error_response(
                ProxyErrorCode::NoRoute,
                "No route matches this host and path",
            ));
        }
    };

    let report = context.readiness.check(&route).await;
    if !report.all_ready {
        debug!(route = %route.id, request_id, "Route not ready, serving waiting page");
        context.stats.record_waiting(&route.id);
        return Ok(waiting::waiting_response(
            &context.settings.status_path,
            normalize_host(&host),
            &path,
            &report,
        ));
    }

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Ok(value) = HeaderValue::from_str(&host) {
        headers.insert(X_FORWARDED_HOST, value);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    let upstream = context.settings.upstream_for(&route);
    let request_timeout = context.settings.request_timeout;
    let result = tokio::time::timeout(request_timeout, context.pool.send_request(req, &upstream)).await;

    match result {
        Ok(Ok(response)) => {
            context.stats.record_forwarded(&route.id);
            Ok(response)
        }
        Ok(Err(e)) => {
            context.stats.record_upstream_error(&route.id);
            // Log detailed error internally, return generic message externally
            error!(route = %route.id, upstream, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to upstream",
            ))
        }
        Err(_) => {
            context.stats.record_upstream_error(&route.id);
            warn!(
                route = %route.id,
                upstream,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Readiness poll used by the waiting page. Never forwards and never
/// records activity, but wakes anything still asleep.
async fn handle_status(
    query: &str,
    context: &ProxyContext,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let host = query_param(query, "host").unwrap_or_default();
    let path = match query_param(query, "path") {
        Some(path) => path,
        None => {
            return json_error_response(
                ProxyErrorCode::MissingParameter,
                "Missing 'path' query parameter",
            );
        }
    };

    let route = match context.matcher.find(&host, &path) {
        Some(route) => route,
        None => {
            return json_error_response(
                ProxyErrorCode::NoRoute,
                "No route matches this host and path",
            );
        }
    };

    let report = context.readiness.check(&route).await;
    let body = report.to_poll_json().to_string();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Decoded value of the first `name=` pair in a query string
fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| {
            urlencoding::decode(&value.replace('+', " "))
                .ok()
                .map(|v| v.into_owned())
        })
}

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Host header (or HTTP/2 authority) with any port kept, lowercased
fn extract_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    if raw.is_empty() || raw.len() > MAX_HOSTNAME_LEN + 8 {
        return None;
    }

    // Alphanumeric, hyphen, dot, and the port/IPv6 delimiters only.
    // Keeps hostnames out of log injection.
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '[' | ']'))
    {
        return None;
    }

    Some(raw.to_ascii_lowercase())
}
