//! The turnstile scrape relay.
//!
//! Turnstile lets a Prometheus server scrape targets that have no inbound
//! network reachability. Clients behind the firewall long-poll a publicly
//! reachable proxy for work; the Prometheus server issues ordinary
//! absolute-URI GETs against the proxy, which hands each one to the matching
//! client and relays the pushed result back as if it had scraped the target
//! itself. This library supports the `turnstile-proxy` and `turnstile-client`
//! binaries found elsewhere in this crate.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod client;
pub mod proxy;
pub mod signals;
pub mod timeout;
pub mod wire;

#[inline]
pub(crate) fn full<T: Into<bytes::Bytes>>(
    chunk: T,
) -> http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error> {
    use http_body_util::BodyExt;

    http_body_util::Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
