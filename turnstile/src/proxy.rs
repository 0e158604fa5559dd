//! The proxy side of turnstile.
//!
//! A single process that terminates three kinds of traffic: scrape requests
//! from Prometheus (absolute-URI GETs), long polls from clients waiting for
//! work, and pushed scrape results. The [`coordinator`] matches the three up;
//! the [`server`] owns the HTTP surface.

pub mod coordinator;
pub mod server;

pub use coordinator::Coordinator;
pub use server::Server;
