use crate::control_plane::SharedControlPlane;
use crate::readiness::{ReadinessOrchestrator, WorkloadReadiness};
use crate::reaper::IdleReaper;
use crate::registry::RouteRegistry;
use crate::route::Route;
use crate::stats::ProxyStats;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = response(status, body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// A route as listed by the admin API, with the live state of its workloads
#[derive(Debug, Serialize)]
struct RouteStatus {
    #[serde(flatten)]
    route: Route,
    ready: bool,
    workloads: Vec<WorkloadReadiness>,
}

struct AdminContext {
    registry: Arc<RouteRegistry>,
    readiness: ReadinessOrchestrator,
    reaper: Arc<IdleReaper>,
    stats: Arc<ProxyStats>,
    auth_token: String,
}

/// Admin API: route listing, statistics and manual stop
pub struct AdminServer {
    bind_addr: SocketAddr,
    registry: Arc<RouteRegistry>,
    control_plane: SharedControlPlane,
    reaper: Arc<IdleReaper>,
    stats: Arc<ProxyStats>,
    cancel: CancellationToken,
    auth_token: String,
    span: Span,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<RouteRegistry>,
        control_plane: SharedControlPlane,
        reaper: Arc<IdleReaper>,
        cancel: CancellationToken,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            control_plane,
            reaper,
            stats: Arc::new(ProxyStats::new()),
            cancel,
            auth_token,
            span: tracing::info_span!("admin"),
        }
    }

    /// Report the proxy's request statistics on `/stats`
    pub fn with_stats(mut self, stats: Arc<ProxyStats>) -> Self {
        self.stats = stats;
        self
    }

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
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let context = Arc::new(AdminContext {
            registry: Arc::clone(&self.registry),
            readiness: ReadinessOrchestrator::new(Arc::clone(&self.control_plane))
                .with_span(tracing::info_span!(parent: &self.span, "readiness")),
            reaper: Arc::clone(&self.reaper),
            stats: Arc::clone(&self.stats),
            auth_token: self.auth_token.clone(),
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&context);
                            tokio::spawn(
                                async move {
                                    if let Err(e) = serve_admin_connection(stream, context).await {
                                        debug!(addr = %addr, error = %e, "Admin connection error");
                                    }
                                }
                                .instrument(self.span.clone()),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Admin server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    context: Arc<AdminContext>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let context = Arc::clone(&context);
        async move { handle_admin_request(req, context).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Percent-decoded route id from `/routes/{id}` or `/routes/{id}/stop`
fn route_id(path: &str, suffix: &str) -> Option<String> {
    let rest = path.strip_prefix("/routes/")?;
    let id = rest.strip_suffix(suffix)?;
    if id.is_empty() || id.contains('/') {
        return None;
    }
    urlencoding::decode(id).ok().map(|id| id.into_owned())
}

async fn route_status(readiness: &ReadinessOrchestrator, route: Route) -> RouteStatus {
    let report = readiness.observe(&route).await;
    RouteStatus {
        route,
        ready: report.all_ready,
        workloads: report.details,
    }
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    context: Arc<AdminContext>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    // Health check and version need no auth
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, &context.auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (&method, path.as_str()) {
        // List routes with live workload state: GET /routes
        (&Method::GET, "/routes") => {
            let mut routes = Vec::new();
            for route in context.registry.list() {
                routes.push(route_status(&context.readiness, route).await);
            }
            let body = serde_json::json!({
                "count": routes.len(),
                "routes": routes,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // Request statistics: GET /stats
        (&Method::GET, "/stats") => {
            let body = serde_json::to_string(&context.stats.snapshot()).unwrap_or_default();
            json_response(StatusCode::OK, body)
        }

        // Manual scale-to-zero: POST /routes/{id}/stop
        (&Method::POST, p) if route_id(p, "/stop").is_some() => {
            let id = route_id(p, "/stop").unwrap_or_default();
            match context.registry.get(&id) {
                Some(route) => {
                    let report = context.reaper.stop_route(&route).await;
                    info!(route = %id, stopped = report.stopped.len(), failed = report.failed.len(), "Route stopped via admin API");
                    let status = if report.failed.is_empty() {
                        StatusCode::OK
                    } else {
                        StatusCode::BAD_GATEWAY
                    };
                    json_response(status, serde_json::to_string(&report).unwrap_or_default())
                }
                None => response(StatusCode::NOT_FOUND, "route not found"),
            }
        }

        // Single route: GET /routes/{id}
        (&Method::GET, p) if route_id(p, "").is_some() => {
            let id = route_id(p, "").unwrap_or_default();
            match context.registry.get(&id) {
                Some(route) => {
                    let status = route_status(&context.readiness, route).await;
                    json_response(
                        StatusCode::OK,
                        serde_json::to_string(&status).unwrap_or_default(),
                    )
                }
                None => response(StatusCode::NOT_FOUND, "route not found"),
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::InMemoryControlPlane;
    use crate::readiness::Readiness;

    fn request(auth: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/routes");
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_check_auth() {
        assert!(check_auth(&request(Some("Bearer secret")), "secret"));
        assert!(check_auth(&request(Some("secret")), "secret"));
        assert!(!check_auth(&request(Some("Bearer wrong")), "secret"));
        assert!(!check_auth(&request(None), "secret"));
    }

    #[test]
    fn test_route_id() {
        assert_eq!(route_id("/routes/shop/stop", "/stop").as_deref(), Some("shop"));
        assert_eq!(route_id("/routes/shop", "").as_deref(), Some("shop"));
        assert_eq!(route_id("/routes/shop/stop", ""), None);
        assert_eq!(route_id("/routes//stop", "/stop"), None);
        assert_eq!(route_id("/routes/", ""), None);
        assert_eq!(route_id("/other/shop", ""), None);
    }

    #[test]
    fn test_route_id_is_percent_decoded() {
        assert_eq!(route_id("/routes/my%20shop", "").as_deref(), Some("my shop"));
        assert_eq!(
            route_id("/routes/my%20shop/stop", "/stop").as_deref(),
            Some("my shop")
        );
        assert_eq!(route_id("/routes/caf%C3%A9", "").as_deref(), Some("café"));
        // Invalid UTF-8 after decoding
        assert_eq!(route_id("/routes/%FF", ""), None);
    }

    #[tokio::test]
    async fn test_route_status_observes_without_waking() {
        let cp = Arc::new(InMemoryControlPlane::new());
        cp.set_workload("default", "web", 0, 0);
        cp.set_workload("default", "db", 1, 1);
        let readiness = ReadinessOrchestrator::new(cp.clone());
        let route = Route::new("shop", "shop.example.com", "/", "web").with_dependency("db", true);

        let status = route_status(&readiness, route).await;

        assert!(!status.ready);
        assert_eq!(status.workloads[0].status, Readiness::Sleep);
        assert_eq!(status.workloads[1].status, Readiness::Ready);
        assert!(cp.scale_calls().is_empty());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["id"], "shop");
        assert_eq!(json["deployment"], "web");
        assert_eq!(json["ready"], false);
        assert_eq!(json["workloads"][0]["status"], "Sleep");
    }
}
