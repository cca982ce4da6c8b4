use crate::error::{json_error_response, ErrorCode, RegistryError};
use crate::registry::SiteRegistry;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the admin API
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body accepted by the admin API
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: &impl Serialize) -> Response<Full<Bytes>> {
    match serde_json::to_string(body) {
        Ok(json) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            json_error_response(ErrorCode::InternalError, "failed to serialize response")
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    domain: String,
}

/// Admin API server exposing the site registry
pub struct AdminServer {
    bind_addr: SocketAddr,
    registry: SiteRegistry,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: SiteRegistry,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = self.registry.clone();
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, addr, registry, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shut down
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    _addr: SocketAddr,
    registry: SiteRegistry,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let registry = registry.clone();
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, registry, token).await }
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

/// Decoded, non-empty path segments
fn path_segments(path: &str) -> Option<Vec<String>> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).ok().map(|d| d.into_owned()))
        .collect()
}

/// `?all=true` (or `all=1`, or a bare `all`) asks for pending sites too
fn wants_all(query: Option<&str>) -> bool {
    query
        .unwrap_or("")
        .split('&')
        .any(|pair| matches!(pair, "all" | "all=true" | "all=1"))
}

fn registry_error_response(err: &RegistryError) -> Response<Full<Bytes>> {
    if err.is_expected() {
        debug!(error = %err, "Registry request rejected");
    } else {
        error!(error = %err, "Registry request failed");
    }
    json_error_response(err.code(), err.to_string())
}

/// Run a registry call off the async workers
async fn blocking<T, F>(registry: &SiteRegistry, f: F) -> Result<T, Response<Full<Bytes>>>
where
    T: Send + 'static,
    F: FnOnce(&SiteRegistry) -> Result<T, RegistryError> + Send + 'static,
{
    let registry = registry.clone();
    match tokio::task::spawn_blocking(move || f(&registry)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(registry_error_response(&e)),
        Err(e) => {
            error!(error = %e, "Registry task panicked");
            Err(json_error_response(ErrorCode::InternalError, "registry task failed"))
        }
    }
}

async fn read_register_request(body: Incoming) -> Result<RegisterRequest, Response<Full<Bytes>>> {
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| json_error_response(ErrorCode::BadRequest, format!("failed to read body: {}", e)))?
        .to_bytes();

    serde_json::from_slice(&bytes)
        .map_err(|e| json_error_response(ErrorCode::BadRequest, format!("invalid request body: {}", e)))
}

async fn handle_admin_request(
    req: Request<Incoming>,
    registry: SiteRegistry,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    // Health check and version need no auth
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, &version_info));
        }
        _ => {}
    }

    if !check_auth(&req, &auth_token) {
        warn!(%method, %path, "Unauthorized admin API request");
        return Ok(json_error_response(
            ErrorCode::Unauthorized,
            "missing or invalid bearer token",
        ));
    }

    let Some(segments) = path_segments(&path) else {
        return Ok(json_error_response(ErrorCode::BadRequest, "malformed path"));
    };
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["sites"]) => {
            let all = wants_all(req.uri().query());
            blocking(&registry, move |r| if all { r.list() } else { r.list_active() })
                .await
                .map(|sites| {
                    json_response(
                        StatusCode::OK,
                        &serde_json::json!({ "count": sites.len(), "sites": sites }),
                    )
                })
        }

        (&Method::POST, ["sites"]) => match read_register_request(req.into_body()).await {
            Ok(body) => blocking(&registry, move |r| r.register(&body.domain))
                .await
                .map(|site| json_response(StatusCode::CREATED, &site)),
            Err(resp) => Err(resp),
        },

        (&Method::GET, ["sites", domain]) => {
            let domain = domain.to_string();
            blocking(&registry, move |r| r.lookup(&domain))
                .await
                .map(|site| json_response(StatusCode::OK, &site))
        }

        (&Method::DELETE, ["sites", domain]) => {
            let domain = domain.to_string();
            blocking(&registry, move |r| {
                let port = r.release(&domain)?;
                Ok(serde_json::json!({ "domain": domain, "port": port }))
            })
            .await
            .map(|body| json_response(StatusCode::OK, &body))
        }

        (&Method::POST, ["sites", domain, "activate"]) => {
            let domain = domain.to_string();
            blocking(&registry, move |r| r.activate(&domain))
                .await
                .map(|site| json_response(StatusCode::OK, &site))
        }

        (&Method::GET, ["sites", domain, "history"]) => {
            let domain = domain.to_string();
            blocking(&registry, move |r| r.history(&domain))
                .await
                .map(|events| {
                    json_response(
                        StatusCode::OK,
                        &serde_json::json!({ "count": events.len(), "events": events }),
                    )
                })
        }

        // 404 for everything else
        _ => Ok(response(StatusCode::NOT_FOUND, "not found")),
    };

    Ok(result.unwrap_or_else(|resp| resp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_auth() {
        let req = Request::builder()
            .header(AUTHORIZATION, "Bearer secret")
            .body(())
            .unwrap();
        assert!(check_auth(&req, "secret"));
        assert!(!check_auth(&req, "other"));

        let bare = Request::builder().header(AUTHORIZATION, "secret").body(()).unwrap();
        assert!(check_auth(&bare, "secret"));

        let missing = Request::builder().body(()).unwrap();
        assert!(!check_auth(&missing, "secret"));
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(path_segments("/sites/a.com/history").unwrap(), vec!["sites", "a.com", "history"]);
        assert_eq!(path_segments("/sites/").unwrap(), vec!["sites"]);
        assert_eq!(path_segments("/sites/%2A.a.com").unwrap(), vec!["sites", "*.a.com"]);
    }

    #[test]
    fn test_wants_all() {
        assert!(wants_all(Some("all=true")));
        assert!(wants_all(Some("x=1&all=1")));
        assert!(wants_all(Some("all")));
        assert!(!wants_all(Some("all=false")));
        assert!(!wants_all(None));
    }
}
