//! The proxy's HTTP surface.
//!
//! One listener serves two audiences. Requests carrying an absolute-form URI
//! are scrapes from Prometheus and go through the coordinator's rendezvous;
//! origin-form requests are the client API (`/poll`, `/push`), the service
//! discovery listing (`/clients`) and the proxy's own `/metrics`.
//!
//! ## Metrics
//!
//! `turnstile_proxy_http_requests_total`: API requests, by path and code
//! `turnstile_proxy_http_duration_seconds`: API latency, by path
//! `turnstile_proxy_proxied_requests_total`: Proxied scrapes, by code
//!
//! Plus the coordinator metrics, see [`super::coordinator`].

use std::{
    collections::BTreeMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use base64::Engine;
use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use ipnet::IpNet;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::{
    net::{TcpListener, TcpStream},
    pin,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    full,
    proxy::coordinator::{self, Coordinator},
    signals::Shutdown,
    timeout, wire,
};

fn default_concurrent_connections_max() -> usize {
    256
}

/// Errors produced by [`Server`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to bind the listener.
    #[error("failed to bind proxy server to {addr}: {source}")]
    Bind {
        /// Binding address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Failed to read the bound address back from the listener.
    #[error("failed to read the bound address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// Basic-auth credentials guarding the scrape and listing surfaces.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    /// Expected username.
    pub username: String,
    /// Expected password.
    pub password: String,
}

/// Configuration for [`Server`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on for proxy and client requests.
    pub listen: SocketAddr,
    /// Optional credentials for the scrape and `/clients` surfaces. `/poll`
    /// and `/push` are never authenticated; client identity is the FQDN.
    pub basic_auth: Option<BasicAuth>,
    /// Disable the `/clients` listing entirely.
    pub disable_clients: bool,
    /// Networks allowed to use the scrape surface without restriction. Empty
    /// means unrestricted.
    pub poller_networks: Vec<IpNet>,
    /// Reject scrapers outside `poller_networks` outright instead of
    /// restricting them to their own reverse-DNS identity.
    pub reject_unknown_pollers: bool,
    /// Cap on concurrently served connections.
    pub concurrent_connections_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            basic_auth: None,
            disable_clients: false,
            poller_networks: Vec::new(),
            reject_unknown_pollers: false,
            concurrent_connections_max: default_concurrent_connections_max(),
        }
    }
}

// Prometheus HTTP service discovery entry, one per known client.
#[derive(Debug, Serialize)]
struct TargetGroup {
    targets: Vec<String>,
    labels: BTreeMap<String, String>,
}

#[derive(Debug)]
struct AppState {
    coordinator: Coordinator,
    config: Config,
    prometheus: PrometheusHandle,
}

// What an allowlist decision lets a caller do on the scrape surface.
enum PollerScope {
    Unrestricted,
    OwnFqdn(String),
    Rejected,
}

/// The proxy HTTP server, bound but not yet serving.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<AppState>,
}

impl Server {
    /// Bind the configured listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        config: Config,
        coordinator: Coordinator,
        prometheus: PrometheusHandle,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| Error::Bind {
                addr: config.listen,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(Error::LocalAddr)?;
        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(AppState {
                coordinator,
                config,
                prometheus,
            }),
        })
    }

    /// The address the listener actually bound, for callers that bound port
    /// zero.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve connections until `shutdown` fires, then drain.
    ///
    /// # Errors
    ///
    /// None currently; the `Result` covers accept-loop failures that are
    /// fatal rather than per-connection.
    pub async fn serve(self, mut shutdown: Shutdown) -> Result<(), Error> {
        let sem = Arc::new(Semaphore::new(self.state.config.concurrent_connections_max));
        let mut join_set = JoinSet::new();

        info!(addr = %self.local_addr, "proxy listening");
        let shutdown_fut = shutdown.recv();
        pin!(shutdown_fut);
        loop {
            tokio::select! {
                () = &mut shutdown_fut => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }
                incoming = self.listener.accept() => {
                    let (stream, peer) = match incoming {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            error!("error accepting connection: {err}");
                            continue;
                        }
                    };
                    debug!("accepted connection from {peer}");

                    let sem = Arc::clone(&sem);
                    let state = Arc::clone(&self.state);
                    join_set.spawn(async move {
                        let permit = match sem.try_acquire() {
                            Ok(permit) => permit,
                            Err(TryAcquireError::Closed) => {
                                error!("semaphore closed");
                                return;
                            }
                            Err(TryAcquireError::NoPermits) => {
                                warn!("proxy over connection capacity, load shedding");
                                drop(stream);
                                return;
                            }
                        };
                        serve_connection(state, stream, peer).await;
                        drop(permit);
                    });
                }
            }
        }

        drop(self.listener);
        // Parked polls never finish on their own; tear connections down
        // rather than draining them.
        join_set.shutdown().await;
        Ok(())
    }
}

async fn serve_connection(state: Arc<AppState>, stream: TcpStream, peer: SocketAddr) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let service = hyper::service::service_fn(move |req| handle(Arc::clone(&state), peer.ip(), req));
    if let Err(err) = builder
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!("error serving {peer}: {err}");
    }
}

async fn handle(
    state: Arc<AppState>,
    peer: IpAddr,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let started = Instant::now();
    let proxied = req.uri().host().is_some();
    let path = if proxied {
        "proxy".to_string()
    } else {
        req.uri().path().to_string()
    };

    let response = if proxied {
        handle_proxy(&state, peer, req).await?
    } else if req.method() == Method::POST && path == "/poll" {
        handle_poll(&state, req).await?
    } else if req.method() == Method::POST && path == "/push" {
        handle_push(&state, req).await?
    } else if req.method() == Method::GET && path == "/metrics" {
        text_response(StatusCode::OK, state.prometheus.render())
    } else if req.method() == Method::GET && (path == "/clients" || path.starts_with("/clients/")) {
        let filter = path
            .strip_prefix("/clients/")
            .filter(|rest| !rest.is_empty());
        handle_clients(&state, peer, filter, req.headers()).await
    } else {
        text_response(StatusCode::NOT_FOUND, "not found\n")
    };

    let labels = vec![
        ("path".to_string(), path.clone()),
        ("code".to_string(), response.status().as_u16().to_string()),
    ];
    counter!("turnstile_proxy_http_requests_total", &labels).increment(1);
    let duration_labels = vec![("path".to_string(), path)];
    histogram!("turnstile_proxy_http_duration_seconds", &duration_labels)
        .record(started.elapsed().as_secs_f64());
    Ok(response)
}

// A scrape from Prometheus: absolute-form URI, routed through the rendezvous.
async fn handle_proxy(
    state: &AppState,
    peer: IpAddr,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if !authorized(&state.config.basic_auth, req.headers()) {
        return Ok(unauthorized_response());
    }

    let scope = poller_scope(&state.config, peer).await;
    if matches!(scope, PollerScope::Rejected) {
        counter!("turnstile_proxy_proxied_requests_total", "code" => "403").increment(1);
        return Ok(text_response(
            StatusCode::FORBIDDEN,
            "scraper address is not allowed\n",
        ));
    }

    let scrape_timeout = timeout::scrape_timeout(
        state.coordinator.max_scrape_timeout(),
        state.coordinator.default_scrape_timeout(),
        req.headers(),
    );
    let deadline = Instant::now() + scrape_timeout;

    let (parts, body) = req.into_parts();
    let body = body.boxed().collect().await?.to_bytes();
    let request = Request::from_parts(parts, body);
    let url = request.uri().to_string();

    if let PollerScope::OwnFqdn(fqdn) = scope {
        if request.uri().host() != Some(fqdn.as_str()) {
            counter!("turnstile_proxy_proxied_requests_total", "code" => "403").increment(1);
            return Ok(text_response(
                StatusCode::FORBIDDEN,
                format!("scraper at {peer} may only scrape {fqdn}\n"),
            ));
        }
    }

    match state.coordinator.do_scrape(request, deadline).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            counter!("turnstile_proxy_proxied_requests_total", "code" => parts.status.as_u16().to_string())
                .increment(1);
            let mut out = Response::new(full(body));
            *out.status_mut() = parts.status;
            *out.headers_mut() = parts.headers;
            Ok(out)
        }
        Err(err) => {
            warn!(url = %url, "error scraping: {err}");
            counter!("turnstile_proxy_proxied_requests_total", "code" => "500").increment(1);
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error scraping {url}: {err}\n"),
            ))
        }
    }
}

// A client registering for work. Blocks until a scrape arrives; the response
// body is the serialized outgoing request.
async fn handle_poll(
    state: &AppState,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let body = req.into_body().boxed().collect().await?.to_bytes();
    let fqdn = String::from_utf8_lossy(&body).trim().to_string();

    match state.coordinator.wait_for_scrape_instruction(&fqdn).await {
        Ok(scrape) => {
            info!(
                fqdn = %fqdn,
                url = %scrape.request.uri(),
                "responding to poll with scrape instruction"
            );
            let mut out = Response::new(full(wire::write_request(&scrape.request)));
            *out.status_mut() = StatusCode::OK;
            Ok(out)
        }
        Err(err @ coordinator::Error::Expired { .. }) => Ok(text_response(
            StatusCode::REQUEST_TIMEOUT,
            format!("{err}\n"),
        )),
        Err(err) => Ok(text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error polling: {err}\n"),
        )),
    }
}

// A client delivering a scrape result. The body is a serialized response.
async fn handle_push(
    state: &AppState,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let body = req.into_body().boxed().collect().await?.to_bytes();
    let response = match wire::read_response(&body) {
        Ok(response) => response,
        Err(err) => {
            warn!("error reading pushed response: {err}");
            return Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error pushing: {err}\n"),
            ));
        }
    };

    match state.coordinator.scrape_result(response).await {
        Ok(()) => Ok(text_response(StatusCode::OK, "")),
        Err(err) => {
            warn!("error pushing: {err}");
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error pushing: {err}\n"),
            ))
        }
    }
}

// The Prometheus HTTP service discovery listing of live clients.
async fn handle_clients(
    state: &AppState,
    peer: IpAddr,
    path_filter: Option<&str>,
    headers: &http::HeaderMap,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if state.config.disable_clients {
        return text_response(StatusCode::NOT_FOUND, "not found\n");
    }
    if !authorized(&state.config.basic_auth, headers) {
        return unauthorized_response();
    }

    // Callers outside the allowlist only ever see themselves.
    let restriction = match poller_scope(&state.config, peer).await {
        PollerScope::Unrestricted => None,
        PollerScope::OwnFqdn(fqdn) => Some(fqdn),
        PollerScope::Rejected => {
            return text_response(StatusCode::NOT_FOUND, "not found\n");
        }
    };
    let filter = match (path_filter, restriction.as_deref()) {
        (Some(requested), Some(own)) if requested != own => {
            return text_response(StatusCode::NOT_FOUND, "unknown client\n");
        }
        (requested, own) => own.or(requested).map(str::to_string),
    };

    let known = state.coordinator.known_clients(filter.as_deref());
    if filter.is_some() && known.is_empty() {
        return text_response(StatusCode::NOT_FOUND, "unknown client\n");
    }
    info!(client_count = known.len(), "responding to clients listing");

    let groups: Vec<TargetGroup> = known
        .into_iter()
        .map(|fqdn| TargetGroup {
            targets: vec![fqdn],
            labels: BTreeMap::new(),
        })
        .collect();
    let body = serde_json::to_vec(&groups).expect("target groups always serialize");
    let mut out = Response::new(full(body));
    out.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    out
}

async fn poller_scope(config: &Config, peer: IpAddr) -> PollerScope {
    if config.poller_networks.is_empty()
        || config.poller_networks.iter().any(|net| net.contains(&peer))
    {
        return PollerScope::Unrestricted;
    }
    if config.reject_unknown_pollers {
        return PollerScope::Rejected;
    }
    match reverse_dns(peer).await {
        Some(fqdn) => PollerScope::OwnFqdn(fqdn),
        None => PollerScope::Rejected,
    }
}

async fn reverse_dns(addr: IpAddr) -> Option<String> {
    let resolved = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr))
        .await
        .ok()?;
    match resolved {
        Ok(name) => Some(name),
        Err(err) => {
            warn!(addr = %addr, "reverse lookup failed: {err}");
            None
        }
    }
}

fn authorized(auth: &Option<BasicAuth>, headers: &http::HeaderMap) -> bool {
    let Some(auth) = auth else {
        return true;
    };
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Some(split) = decoded.iter().position(|byte| *byte == b':') else {
        return false;
    };
    let user_ok = constant_time_eq(&decoded[..split], auth.username.as_bytes());
    let pass_ok = constant_time_eq(&decoded[split + 1..], auth.password.as_bytes());
    user_ok && pass_ok
}

// Comparison time must not depend on where the inputs diverge.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn text_response<T: Into<Bytes>>(
    status: StatusCode,
    body: T,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut out = Response::new(full(body.into()));
    *out.status_mut() = status;
    out
}

fn unauthorized_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut out = text_response(StatusCode::UNAUTHORIZED, "Unauthorized.\n");
    out.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"Authentication required\""),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Option<BasicAuth> {
        Some(BasicAuth {
            username: "scraper".to_string(),
            password: "hunter2".to_string(),
        })
    }

    fn auth_header(user: &str, pass: &str) -> http::HeaderMap {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        let mut headers = http::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {token}")).expect("valid header"),
        );
        headers
    }

    #[test]
    fn no_credentials_configured_allows_everything() {
        assert!(authorized(&None, &http::HeaderMap::new()));
    }

    #[test]
    fn matching_credentials_are_accepted() {
        assert!(authorized(&credentials(), &auth_header("scraper", "hunter2")));
    }

    #[test]
    fn wrong_credentials_are_rejected() {
        assert!(!authorized(&credentials(), &auth_header("scraper", "wrong")));
        assert!(!authorized(&credentials(), &auth_header("nobody", "hunter2")));
        assert!(!authorized(&credentials(), &http::HeaderMap::new()));

        let mut garbage = http::HeaderMap::new();
        garbage.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic not!base64"),
        );
        assert!(!authorized(&credentials(), &garbage));
    }

    #[test]
    fn constant_time_eq_matches_equality() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[tokio::test]
    async fn allowlisted_peer_is_unrestricted() {
        let config = Config {
            poller_networks: vec!["10.0.0.0/8".parse().expect("valid cidr")],
            ..Config::default()
        };
        let scope = poller_scope(&config, "10.1.2.3".parse().expect("valid ip")).await;
        assert!(matches!(scope, PollerScope::Unrestricted));
    }

    #[tokio::test]
    async fn outside_peer_is_rejected_when_configured() {
        let config = Config {
            poller_networks: vec!["10.0.0.0/8".parse().expect("valid cidr")],
            reject_unknown_pollers: true,
            ..Config::default()
        };
        let scope = poller_scope(&config, "192.0.2.9".parse().expect("valid ip")).await;
        assert!(matches!(scope, PollerScope::Rejected));
    }

    #[tokio::test]
    async fn empty_allowlist_is_unrestricted() {
        let scope = poller_scope(&Config::default(), "192.0.2.9".parse().expect("valid ip")).await;
        assert!(matches!(scope, PollerScope::Unrestricted));
    }
}
