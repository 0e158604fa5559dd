//! Scrape timeout negotiation.
//!
//! Prometheus advertises how long it is willing to wait for a scrape in the
//! `X-Prometheus-Scrape-Timeout-Seconds` request header. The proxy clamps
//! that value into its configured window and the client in turn reports the
//! time still remaining when it pushes a result back, via
//! `X-Prometheus-Scrape-Timeout`.

use std::time::Duration;

use http::HeaderMap;

/// Request header carrying the scraper's advertised timeout, in float seconds.
pub const SCRAPE_TIMEOUT_SECONDS_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

/// Response header carrying the seconds remaining until the scrape deadline,
/// set by the client when pushing a result back to the proxy.
pub const SCRAPE_TIMEOUT_REMAINING_HEADER: &str = "x-prometheus-scrape-timeout";

/// Errors produced when reading a timeout header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The header was not present.
    #[error("scrape timeout header is missing")]
    Missing,
    /// The header was present but did not parse as a non-negative float.
    #[error("scrape timeout header is not a valid duration")]
    Invalid,
}

fn float_seconds(headers: &HeaderMap, name: &str) -> Result<Duration, Error> {
    let value = headers.get(name).ok_or(Error::Missing)?;
    let seconds: f64 = value
        .to_str()
        .map_err(|_| Error::Invalid)?
        .trim()
        .parse()
        .map_err(|_| Error::Invalid)?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(Error::Invalid);
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Read the scraper's advertised timeout from `headers`.
///
/// # Errors
///
/// Returns an error if the header is absent or malformed. The client treats
/// either case as a request-scoped failure and pushes a synthetic response.
pub fn header_timeout(headers: &HeaderMap) -> Result<Duration, Error> {
    float_seconds(headers, SCRAPE_TIMEOUT_SECONDS_HEADER)
}

/// The effective timeout for an incoming scrape:
/// `min(header_if_present_else_default, max)`.
#[must_use]
pub fn scrape_timeout(max: Duration, default: Duration, headers: &HeaderMap) -> Duration {
    let timeout = header_timeout(headers).unwrap_or(default);
    timeout.min(max)
}

/// The window the proxy will hold a pushed response while waiting for its
/// scrape to collect it. Prefers the remaining-time header the client sets,
/// falls back to the scraper's advertised timeout, then to `default`; always
/// clamped by `max`.
#[must_use]
pub fn remaining_timeout(max: Duration, default: Duration, headers: &HeaderMap) -> Duration {
    let timeout = float_seconds(headers, SCRAPE_TIMEOUT_REMAINING_HEADER)
        .or_else(|_| float_seconds(headers, SCRAPE_TIMEOUT_SECONDS_HEADER))
        .unwrap_or(default);
    timeout.min(max)
}
