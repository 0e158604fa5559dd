//! The client side of turnstile.
//!
//! One client runs next to each scrape target. It long-polls the proxy with
//! its own FQDN as identity, executes whatever request comes back against
//! the local target, and POSTs the serialized response to the proxy. Poll
//! failures are retried forever with jittered backoff; scrape failures are
//! reported to the scraper as a pushed synthetic 500, never a dropped
//! connection.
//!
//! ## Metrics
//!
//! `turnstile_client_poll_errors_total`: Failed polls
//! `turnstile_client_scrape_errors_total`: Failed scrapes of the local target
//! `turnstile_client_push_errors_total`: Failed pushes back to the proxy

use std::time::Duration;

use bytes::Bytes;
use http::{uri, HeaderValue, Request, Response, StatusCode, Uri};
use metrics::counter;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::{backoff::DecorrelatedJitter, signals::Shutdown, timeout, wire};

/// Errors produced by [`ClientCoordinator`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An FQDN must be configured; it is the client's identity.
    #[error("fqdn must be specified")]
    MissingFqdn,
    /// A proxy URL must be configured.
    #[error("proxy url must be specified")]
    MissingProxyUrl,
    /// A poll or push request failed.
    #[error("proxy request failed: {0}")]
    Proxy(#[from] reqwest::Error),
    /// The poll response body did not parse as a scrape request.
    #[error("failed to read scrape instruction: {0}")]
    Instruction(#[from] wire::Error),
    /// The proxy answered a push with a non-success status.
    #[error("push rejected by proxy: {status}")]
    PushRejected {
        /// The status the proxy answered with.
        status: StatusCode,
    },
    /// The scrape request could not be rewritten for execution.
    #[error("invalid scrape request: {0}")]
    Rewrite(#[from] http::Error),
}

/// Configuration for [`ClientCoordinator`].
#[derive(Debug, Clone)]
pub struct Config {
    /// The FQDN to register with; scrape targets must carry this host.
    pub fqdn: String,
    /// Base URL of the proxy.
    pub proxy_url: String,
    /// First wait after a poll failure.
    pub retry_initial_wait: Duration,
    /// Cap on the wait between poll retries.
    pub retry_max_wait: Duration,
}

/// The client's poll/scrape/push loop.
#[derive(Debug, Clone)]
pub struct ClientCoordinator {
    client: reqwest::Client,
    fqdn: String,
    poll_url: String,
    push_url: String,
    retry_initial_wait: Duration,
    retry_max_wait: Duration,
}

impl ClientCoordinator {
    /// Create a new [`ClientCoordinator`] speaking through `client`.
    ///
    /// # Errors
    ///
    /// Returns an error if the FQDN or proxy URL is empty.
    pub fn new(config: Config, client: reqwest::Client) -> Result<Self, Error> {
        if config.fqdn.is_empty() {
            return Err(Error::MissingFqdn);
        }
        if config.proxy_url.is_empty() {
            return Err(Error::MissingProxyUrl);
        }
        let base = config.proxy_url.trim_end_matches('/');
        Ok(Self {
            client,
            fqdn: config.fqdn,
            poll_url: format!("{base}/poll"),
            push_url: format!("{base}/push"),
            retry_initial_wait: config.retry_initial_wait,
            retry_max_wait: config.retry_max_wait,
        })
    }

    /// Poll the proxy for work until `shutdown` fires. Never returns an
    /// error; failed polls are retried with backoff.
    pub async fn run(self, mut shutdown: Shutdown) {
        info!(fqdn = %self.fqdn, poll_url = %self.poll_url, "client polling for scrapes");
        let mut backoff = DecorrelatedJitter::new(self.retry_initial_wait, self.retry_max_wait);
        loop {
            let result = tokio::select! {
                result = self.poll_once() => result,
                () = shutdown.recv() => {
                    info!("shutdown signal received");
                    return;
                }
            };
            match result {
                Ok(()) => backoff.reset(),
                Err(err) => {
                    counter!("turnstile_client_poll_errors_total").increment(1);
                    let wait = backoff.next_wait();
                    warn!("poll failed, retrying in {wait:?}: {err}");
                    tokio::select! {
                        () = time::sleep(wait) => {}
                        () = shutdown.recv() => {
                            info!("shutdown signal received");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One poll round trip. A received instruction is executed on a spawned
    /// task so the next poll can start immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll request fails or its body does not parse
    /// as a scrape request.
    pub async fn poll_once(&self) -> Result<(), Error> {
        let response = self
            .client
            .post(&self.poll_url)
            .body(self.fqdn.clone())
            .send()
            .await?;
        let body = response.bytes().await?;
        let request = wire::read_request(&body)?;
        info!(
            scrape_id = scrape_id(&request),
            url = %request.uri(),
            "received scrape instruction"
        );

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.scrape_and_push(request).await;
        });
        Ok(())
    }

    /// Execute one scrape instruction and push its outcome. Failures turn
    /// into a pushed synthetic 500 so the scraper always sees a response.
    async fn scrape_and_push(&self, request: Request<Bytes>) {
        let id = request
            .headers()
            .get(wire::ID_HEADER)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(""));

        let Ok(scrape_timeout) = timeout::header_timeout(request.headers()) else {
            self.report_failure(&id, Instant::now(), "scrape timeout header is missing or invalid")
                .await;
            return;
        };
        let deadline = Instant::now() + scrape_timeout;

        let request = match promote_scheme(request) {
            Ok(request) => request,
            Err(err) => {
                self.report_failure(&id, deadline, &format!("invalid scrape request: {err}"))
                    .await;
                return;
            }
        };

        if request.uri().host() != Some(self.fqdn.as_str()) {
            self.report_failure(&id, deadline, "scrape target doesn't match client fqdn")
                .await;
            return;
        }

        let url = request.uri().to_string();
        let response = match self.execute(request, deadline).await {
            Ok(response) => response,
            Err(err) => {
                self.report_failure(&id, deadline, &format!("failed to scrape {url}: {err}"))
                    .await;
                return;
            }
        };
        debug!(scrape_id = id.to_str().unwrap_or(""), "retrieved scrape response");

        if let Err(err) = self.push_response(response, &id, deadline).await {
            counter!("turnstile_client_push_errors_total").increment(1);
            warn!("failed to push scrape response: {err}");
            return;
        }
        debug!(scrape_id = id.to_str().unwrap_or(""), "pushed scrape result");
    }

    // Run the request against the local target, bounded by the deadline.
    async fn execute(
        &self,
        request: Request<Bytes>,
        deadline: Instant,
    ) -> Result<Response<Bytes>, Error> {
        let (parts, body) = request.into_parts();
        let response = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .timeout(deadline.saturating_duration_since(Instant::now()))
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        let mut out = Response::new(body);
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        Ok(out)
    }

    // Report the scrape result up to the proxy.
    async fn push_response(
        &self,
        mut response: Response<Bytes>,
        id: &HeaderValue,
        deadline: Instant,
    ) -> Result<(), Error> {
        // Link the response back to its request.
        response.headers_mut().insert(wire::ID_HEADER, id.clone());
        let remaining = deadline.saturating_duration_since(Instant::now());
        response.headers_mut().insert(
            timeout::SCRAPE_TIMEOUT_REMAINING_HEADER,
            HeaderValue::from_str(&format!("{}", remaining.as_secs_f64()))
                .expect("float seconds are a valid header value"),
        );

        let body = wire::write_response(&response);
        let pushed = self
            .client
            .post(&self.push_url)
            .body(body)
            .timeout(remaining.max(Duration::from_millis(100)))
            .send()
            .await?;
        if !pushed.status().is_success() {
            return Err(Error::PushRejected {
                status: pushed.status(),
            });
        }
        Ok(())
    }

    // Push a synthetic 500 carrying the error text, so the scraper sees a
    // defined failure rather than a dropped connection.
    async fn report_failure(&self, id: &HeaderValue, deadline: Instant, message: &str) {
        counter!("turnstile_client_scrape_errors_total").increment(1);
        warn!("scrape failed: {message}");
        let mut response = Response::new(Bytes::from(message.to_string()));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        if let Err(err) = self.push_response(response, id, deadline).await {
            counter!("turnstile_client_push_errors_total").increment(1);
            warn!("failed to push failed scrape response: {err}");
            return;
        }
        info!("pushed failed scrape response");
    }
}

fn scrape_id(request: &Request<Bytes>) -> &str {
    request
        .headers()
        .get(wire::ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

// The proxy only ever sees plain-HTTP absolute URIs; a `_scheme=https` query
// parameter asks the client to talk TLS to the target instead.
fn promote_scheme(request: Request<Bytes>) -> Result<Request<Bytes>, Error> {
    let uri = request.uri();
    let Some(query) = uri.query() else {
        return Ok(request);
    };
    let wants_https = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("_scheme="))
        == Some("https");
    if !wants_https {
        return Ok(request);
    }

    let remaining: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.starts_with("_scheme="))
        .collect();
    let path = uri.path();
    let path_and_query = if remaining.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{}", remaining.join("&"))
    };

    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(uri::Scheme::HTTPS);
    parts.path_and_query = Some(path_and_query.parse().map_err(http::Error::from)?);
    let rewritten = Uri::from_parts(parts).map_err(http::Error::from)?;

    let (mut head, body) = request.into_parts();
    head.uri = rewritten;
    Ok(Request::from_parts(head, body))
}
