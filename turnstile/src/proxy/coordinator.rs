//! The rendezvous between scrapes, polls and pushes.
//!
//! Every scrape is a three-party handshake over shared state: the scrape
//! handler queues the request under the target's FQDN and waits; a polling
//! client takes it; the pushed result is routed back to the waiting scrape
//! handler by a per-scrape id. All of the state lives in maps guarded by one
//! mutex that is only ever held for map operations, never across a wait.
//!
//! ## Metrics
//!
//! `turnstile_proxy_scrapes_total`: Scrapes entering the rendezvous
//! `turnstile_proxy_scrape_errors_total`: Scrapes failed, by reason
//! `turnstile_proxy_polls_total`: Poll registrations
//! `turnstile_proxy_pushes_total`: Pushed responses
//! `turnstile_proxy_push_errors_total`: Pushed responses never collected
//! `turnstile_proxy_known_clients`: Clients seen within the registration TTL

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use http::{HeaderValue, Request, Response};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{signals::Shutdown, timeout, wire};

const GC_INTERVAL: Duration = Duration::from_secs(60);

/// Errors produced by [`Coordinator`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No client accepted the scrape before its deadline.
    #[error("no client matched {url} before the scrape deadline")]
    NoMatchingClient {
        /// The scrape target.
        url: String,
    },
    /// A client accepted the scrape but its response never arrived in time.
    #[error("scrape {id} timed out waiting for the client response")]
    Timeout {
        /// The scrape id.
        id: String,
    },
    /// The poll was displaced by a newer poll for the same FQDN and should be
    /// retried by the client.
    #[error("poll for {fqdn} expired")]
    Expired {
        /// The polling client's FQDN.
        fqdn: String,
    },
    /// A pushed response carried no scrape id.
    #[error("pushed response is missing the id header")]
    MissingId,
}

/// A scrape request in flight, bounded by its deadline.
#[derive(Debug)]
pub struct ScrapeRequest {
    /// The request to execute against the target, absolute-form URI, with the
    /// scrape id header set.
    pub request: Request<Bytes>,
    /// When the scraper gives up.
    pub deadline: Instant,
}

/// Configuration for [`Coordinator`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Upper bound applied to every advertised scrape timeout.
    pub max_scrape_timeout: Duration,
    /// Timeout assumed when a scrape does not advertise one.
    pub default_scrape_timeout: Duration,
    /// How long a client stays "known" after its last poll.
    pub registration_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_scrape_timeout: Duration::from_secs(300),
            default_scrape_timeout: Duration::from_secs(15),
            registration_timeout: Duration::from_secs(300),
        }
    }
}

// One scrape parked in a waiting slot. The accept channel tells the scrape
// handler a poller took its request; if the sender is dropped instead, the
// scrape has been discarded.
#[derive(Debug)]
struct QueuedScrape {
    id: String,
    scrape: ScrapeRequest,
    accepted: oneshot::Sender<()>,
}

// The rendezvous point for one FQDN. Modeled on an unbuffered channel: a
// request passes only when a producer and a consumer are both present.
// `None` through a consumer channel is the drain sentinel; that poll fails
// `Expired`. Slots are created on first use and never removed.
#[derive(Debug, Default)]
struct WaitingSlot {
    producers: VecDeque<QueuedScrape>,
    consumers: VecDeque<oneshot::Sender<Option<ScrapeRequest>>>,
}

#[derive(Debug)]
struct ParkedResponse {
    response: Response<Bytes>,
    taken: oneshot::Sender<()>,
}

// Delivery slot for one scrape id. The waiter is installed by `do_scrape`
// before the request can reach any client; `parked` holds a response with no
// waiter (an unknown or stale id) until the push deadline clears it.
#[derive(Debug, Default)]
struct ResponseSlot {
    waiter: Option<oneshot::Sender<Response<Bytes>>>,
    parked: Option<ParkedResponse>,
}

#[derive(Debug, Default)]
struct State {
    waiting: FxHashMap<String, WaitingSlot>,
    responses: FxHashMap<String, ResponseSlot>,
    known: FxHashMap<String, Instant>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    config: Config,
}

/// The scrape/poll/push rendezvous. Cheap to clone; all clones share state.
#[derive(Debug, Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

// Removes the response slot when the owning `do_scrape` exits, whichever way
// it exits, including being dropped mid-wait by a disconnecting scraper.
struct ResponseSlotGuard {
    inner: Arc<Inner>,
    id: String,
}

impl Drop for ResponseSlotGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.inner.state);
        state.responses.remove(&self.id);
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().expect("coordinator state lock poisoned")
}

enum Pending {
    Taken(ScrapeRequest),
    Parked(oneshot::Receiver<Option<ScrapeRequest>>),
}

impl Coordinator {
    /// Create a new [`Coordinator`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                config,
            }),
        }
    }

    /// The configured clamp on advertised scrape timeouts.
    #[must_use]
    pub fn max_scrape_timeout(&self) -> Duration {
        self.inner.config.max_scrape_timeout
    }

    /// The timeout assumed when a scrape does not advertise one.
    #[must_use]
    pub fn default_scrape_timeout(&self) -> Duration {
        self.inner.config.default_scrape_timeout
    }

    /// Run one scrape through the rendezvous.
    ///
    /// Mints the scrape id, offers the request to a poller for
    /// `request.uri().host()` and waits for the pushed response, both bounded
    /// by `deadline`.
    ///
    /// # Errors
    ///
    /// `NoMatchingClient` if no poller accepted the request in time,
    /// `Timeout` if a response never arrived in time.
    ///
    /// # Panics
    ///
    /// None known.
    pub async fn do_scrape(
        &self,
        mut request: Request<Bytes>,
        deadline: Instant,
    ) -> Result<Response<Bytes>, Error> {
        counter!("turnstile_proxy_scrapes_total").increment(1);
        let id = Uuid::new_v4().to_string();
        let fqdn = request.uri().host().unwrap_or_default().to_string();
        let url = request.uri().to_string();
        info!(scrape_id = %id, url = %url, "scrape entering rendezvous");
        // The id is relied upon to match the request with its response, which
        // is why it must be crypto-random rather than sequential.
        request.headers_mut().insert(
            wire::ID_HEADER,
            HeaderValue::from_str(&id).expect("uuid is a valid header value"),
        );

        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut state = lock(&self.inner.state);
            let slot = state.responses.entry(id.clone()).or_default();
            slot.waiter = Some(response_tx);
        }
        let _slot_guard = ResponseSlotGuard {
            inner: Arc::clone(&self.inner),
            id: id.clone(),
        };

        let mut scrape = ScrapeRequest { request, deadline };
        let accept_rx = {
            let mut state = lock(&self.inner.state);
            let slot = state.waiting.entry(fqdn.clone()).or_default();
            loop {
                if let Some(consumer) = slot.consumers.pop_front() {
                    match consumer.send(Some(scrape)) {
                        // A parked poller took the request directly.
                        Ok(()) => break None,
                        // That poller's connection is gone; try the next.
                        Err(returned) => {
                            scrape = returned.expect("a producer only ever sends a request");
                        }
                    }
                } else {
                    let (accepted, accept_rx) = oneshot::channel();
                    slot.producers.push_back(QueuedScrape {
                        id: id.clone(),
                        scrape,
                        accepted,
                    });
                    break Some(accept_rx);
                }
            }
        };

        if let Some(accept_rx) = accept_rx {
            let accepted = tokio::select! {
                res = accept_rx => res.is_ok(),
                () = time::sleep_until(deadline) => false,
            };
            if !accepted {
                let mut state = lock(&self.inner.state);
                if let Some(slot) = state.waiting.get_mut(&fqdn) {
                    slot.producers.retain(|queued| queued.id != id);
                }
                drop(state);
                counter!("turnstile_proxy_scrape_errors_total", "reason" => "no_matching_client")
                    .increment(1);
                return Err(Error::NoMatchingClient { url });
            }
        }

        tokio::select! {
            res = response_rx => match res {
                Ok(response) => {
                    debug!(scrape_id = %id, "scrape response delivered");
                    Ok(response)
                }
                Err(_) => {
                    counter!("turnstile_proxy_scrape_errors_total", "reason" => "timeout")
                        .increment(1);
                    Err(Error::Timeout { id })
                }
            },
            () = time::sleep_until(deadline) => {
                counter!("turnstile_proxy_scrape_errors_total", "reason" => "timeout").increment(1);
                Err(Error::Timeout { id })
            }
        }
    }

    /// Block until a scrape request for `fqdn` is available.
    ///
    /// Refreshes the client's liveness record, then displaces one poller
    /// already parked for this FQDN before parking itself: a poller whose
    /// connection silently died would otherwise swallow a future request.
    /// The displaced poll fails `Expired` and its client reconnects.
    ///
    /// # Errors
    ///
    /// `Expired` if this poll was itself displaced by a newer one.
    pub async fn wait_for_scrape_instruction(&self, fqdn: &str) -> Result<ScrapeRequest, Error> {
        counter!("turnstile_proxy_polls_total").increment(1);
        debug!(fqdn = %fqdn, "client polling for work");
        {
            let mut state = lock(&self.inner.state);
            state.known.insert(fqdn.to_string(), Instant::now());
            gauge!("turnstile_proxy_known_clients").set(state.known.len() as f64);

            let slot = state.waiting.entry(fqdn.to_string()).or_default();
            if let Some(displaced) = slot.consumers.pop_front() {
                let _ = displaced.send(None);
            }
        }

        loop {
            let pending = {
                let mut state = lock(&self.inner.state);
                let slot = state.waiting.entry(fqdn.to_string()).or_default();
                let mut taken = None;
                while let Some(queued) = slot.producers.pop_front() {
                    // Scraper already gave up on this one; don't hand it out.
                    if queued.scrape.expired() {
                        continue;
                    }
                    if queued.accepted.send(()).is_ok() {
                        taken = Some(queued.scrape);
                        break;
                    }
                }
                match taken {
                    Some(scrape) => Pending::Taken(scrape),
                    None => {
                        let (tx, rx) = oneshot::channel();
                        slot.consumers.push_back(tx);
                        Pending::Parked(rx)
                    }
                }
            };

            match pending {
                Pending::Taken(scrape) => return Ok(scrape),
                Pending::Parked(rx) => match rx.await {
                    Ok(Some(scrape)) => {
                        if scrape.expired() {
                            continue;
                        }
                        return Ok(scrape);
                    }
                    Ok(None) => {
                        return Err(Error::Expired {
                            fqdn: fqdn.to_string(),
                        })
                    }
                    Err(_) => continue,
                },
            }
        }
    }

    /// Route a pushed response back to the scrape that minted its id.
    ///
    /// Internal headers are stripped before delivery. A response whose
    /// scrape is no longer waiting is held no longer than the remaining
    /// scrape timeout it advertises (clamped), then dropped along with its
    /// slot, so unknown ids leave no state behind.
    ///
    /// # Errors
    ///
    /// `MissingId` if the response has no id header, `Timeout` if no scrape
    /// collected the response within the delivery window.
    pub async fn scrape_result(&self, mut response: Response<Bytes>) -> Result<(), Error> {
        let id = response
            .headers()
            .get(wire::ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or(Error::MissingId)?;
        counter!("turnstile_proxy_pushes_total").increment(1);
        debug!(scrape_id = %id, "scrape result pushed");

        let window = timeout::remaining_timeout(
            self.inner.config.max_scrape_timeout,
            self.inner.config.default_scrape_timeout,
            response.headers(),
        );
        for name in [
            wire::ID_HEADER,
            timeout::SCRAPE_TIMEOUT_SECONDS_HEADER,
            timeout::SCRAPE_TIMEOUT_REMAINING_HEADER,
        ] {
            while response.headers_mut().remove(name).is_some() {}
        }

        let taken_rx = {
            let mut state = lock(&self.inner.state);
            let slot = state.responses.entry(id.clone()).or_default();
            if let Some(waiter) = slot.waiter.take() {
                match waiter.send(response) {
                    Ok(()) => return Ok(()),
                    // The scrape gave up in the meantime; park and wait out
                    // the window like any other orphan.
                    Err(returned) => response = returned,
                }
            }
            let (taken_tx, taken_rx) = oneshot::channel();
            slot.parked = Some(ParkedResponse {
                response,
                taken: taken_tx,
            });
            taken_rx
        };

        tokio::select! {
            res = taken_rx => match res {
                Ok(()) => Ok(()),
                Err(_) => {
                    counter!("turnstile_proxy_push_errors_total").increment(1);
                    Err(Error::Timeout { id })
                }
            },
            () = time::sleep(window) => {
                let mut state = lock(&self.inner.state);
                state.responses.remove(&id);
                drop(state);
                counter!("turnstile_proxy_push_errors_total").increment(1);
                Err(Error::Timeout { id })
            }
        }
    }

    /// FQDNs whose last poll is within the registration TTL, optionally
    /// restricted to an exact match, sorted.
    #[must_use]
    pub fn known_clients(&self, filter: Option<&str>) -> Vec<String> {
        let ttl = self.inner.config.registration_timeout;
        let state = lock(&self.inner.state);
        let mut known: Vec<String> = state
            .known
            .iter()
            .filter(|(fqdn, last_seen)| {
                last_seen.elapsed() < ttl && filter.is_none_or(|f| f == fqdn.as_str())
            })
            .map(|(fqdn, _)| fqdn.clone())
            .collect();
        drop(state);
        known.sort_unstable();
        known
    }

    /// Periodically drop liveness records older than the registration TTL,
    /// along with queued scrapes nobody can serve anymore.
    pub fn spawn_gc(&self, mut shutdown: Shutdown) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut interval = time::interval(GC_INTERVAL);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let ttl = inner.config.registration_timeout;
                        let mut state = lock(&inner.state);
                        let before = state.known.len();
                        state.known.retain(|_, last_seen| last_seen.elapsed() < ttl);
                        let remaining = state.known.len();
                        // Scrapes queued for an FQDN nothing polls would
                        // otherwise sit in the slot past their deadline.
                        for slot in state.waiting.values_mut() {
                            slot.producers.retain(|queued| {
                                !queued.scrape.expired() && !queued.accepted.is_closed()
                            });
                        }
                        drop(state);
                        gauge!("turnstile_proxy_known_clients").set(remaining as f64);
                        debug!(deleted = before - remaining, remaining, "client registry swept");
                    }
                    () = shutdown.recv() => {
                        debug!("client registry sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

impl ScrapeRequest {
    fn expired(&self) -> bool {
        self.deadline <= Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::{Method, StatusCode};

    fn coordinator() -> Coordinator {
        Coordinator::new(Config::default())
    }

    fn scrape_request(url: &str) -> Request<Bytes> {
        let mut request = Request::new(Bytes::new());
        *request.method_mut() = Method::GET;
        *request.uri_mut() = url.parse().expect("valid test uri");
        request
    }

    fn pushed_response(id: &HeaderValue, body: &'static str) -> Response<Bytes> {
        let mut response = Response::new(Bytes::from_static(body.as_bytes()));
        *response.status_mut() = StatusCode::OK;
        response.headers_mut().insert(wire::ID_HEADER, id.clone());
        response
    }

    fn deadline_in(seconds: u64) -> Instant {
        Instant::now() + Duration::from_secs(seconds)
    }

    #[tokio::test]
    async fn scrape_round_trips_through_poll_and_push() {
        let coordinator = coordinator();
        let scraper = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/metrics"), deadline_in(5))
                    .await
            })
        };

        let instruction = coordinator
            .wait_for_scrape_instruction("host1")
            .await
            .expect("poll receives the scrape");
        let id = instruction
            .request
            .headers()
            .get(wire::ID_HEADER)
            .expect("scrape id is set")
            .clone();
        assert_eq!(instruction.request.uri().host(), Some("host1"));

        coordinator
            .scrape_result(pushed_response(&id, "metric 1\n"))
            .await
            .expect("push is delivered");

        let response = scraper
            .await
            .expect("scrape task finished")
            .expect("scrape succeeded");
        assert_eq!(response.body().as_ref(), b"metric 1\n");
        assert!(
            !response.headers().contains_key(wire::ID_HEADER),
            "internal id header is stripped before delivery"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scrape_with_no_client_fails_at_the_deadline() {
        let coordinator = coordinator();
        let err = coordinator
            .do_scrape(scrape_request("http://absent/metrics"), deadline_in(1))
            .await
            .expect_err("no poller ever shows up");
        assert!(matches!(err, Error::NoMatchingClient { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_scrape_without_push_times_out() {
        let coordinator = coordinator();
        let scraper = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/metrics"), deadline_in(2))
                    .await
            })
        };
        let _instruction = coordinator
            .wait_for_scrape_instruction("host1")
            .await
            .expect("poll receives the scrape");

        let err = scraper
            .await
            .expect("scrape task finished")
            .expect_err("nobody pushes a result");
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn concurrent_scrapes_receive_their_own_responses() {
        let coordinator = coordinator();
        let scrape_a = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/a"), deadline_in(5))
                    .await
            })
        };
        let first = coordinator
            .wait_for_scrape_instruction("host1")
            .await
            .expect("first instruction");
        let scrape_b = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/b"), deadline_in(5))
                    .await
            })
        };
        let second = coordinator
            .wait_for_scrape_instruction("host1")
            .await
            .expect("second instruction");

        let (for_a, for_b) = if first.request.uri().path() == "/a" {
            (first, second)
        } else {
            (second, first)
        };
        let id_a = for_a.request.headers()[wire::ID_HEADER].clone();
        let id_b = for_b.request.headers()[wire::ID_HEADER].clone();
        assert_ne!(id_a, id_b, "each scrape mints a distinct id");

        // Answer in reverse order of issue.
        coordinator
            .scrape_result(pushed_response(&id_b, "body b"))
            .await
            .expect("push b delivered");
        coordinator
            .scrape_result(pushed_response(&id_a, "body a"))
            .await
            .expect("push a delivered");

        let response_a = scrape_a
            .await
            .expect("scrape a finished")
            .expect("scrape a succeeded");
        let response_b = scrape_b
            .await
            .expect("scrape b finished")
            .expect("scrape b succeeded");
        assert_eq!(response_a.body().as_ref(), b"body a");
        assert_eq!(response_b.body().as_ref(), b"body b");
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_response_with_unknown_id_is_dropped() {
        let coordinator = coordinator();
        let mut response = pushed_response(&HeaderValue::from_static("not-a-minted-id"), "stray");
        response.headers_mut().insert(
            timeout::SCRAPE_TIMEOUT_REMAINING_HEADER,
            HeaderValue::from_static("1.0"),
        );
        let err = coordinator
            .scrape_result(response)
            .await
            .expect_err("nobody collects the stray response");
        assert!(matches!(err, Error::Timeout { .. }));

        // No state is retained for the unknown id.
        let state = lock(&coordinator.inner.state);
        assert!(state.responses.is_empty());
    }

    #[tokio::test]
    async fn push_without_id_is_rejected() {
        let coordinator = coordinator();
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = StatusCode::OK;
        let err = coordinator
            .scrape_result(response)
            .await
            .expect_err("missing id");
        assert!(matches!(err, Error::MissingId));
    }

    #[tokio::test]
    async fn duplicate_push_is_not_delivered_twice() {
        let coordinator = coordinator();
        let scraper = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/metrics"), deadline_in(5))
                    .await
            })
        };
        let instruction = coordinator
            .wait_for_scrape_instruction("host1")
            .await
            .expect("poll receives the scrape");
        let id = instruction.request.headers()[wire::ID_HEADER].clone();

        coordinator
            .scrape_result(pushed_response(&id, "first"))
            .await
            .expect("first push delivered");
        let response = scraper
            .await
            .expect("scrape finished")
            .expect("scrape succeeded");
        assert_eq!(response.body().as_ref(), b"first");

        let mut duplicate = pushed_response(&id, "second");
        duplicate.headers_mut().insert(
            timeout::SCRAPE_TIMEOUT_REMAINING_HEADER,
            HeaderValue::from_static("0.05"),
        );
        let err = coordinator
            .scrape_result(duplicate)
            .await
            .expect_err("duplicate is dropped");
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn newer_poll_displaces_a_parked_one() {
        let coordinator = coordinator();
        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_for_scrape_instruction("host1").await })
        };
        // Let the first poll park itself.
        tokio::task::yield_now().await;

        let second = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_for_scrape_instruction("host1").await })
        };
        let err = first
            .await
            .expect("first poll finished")
            .expect_err("displaced poll expires");
        assert!(matches!(err, Error::Expired { .. }));

        // The second poll still serves a scrape normally.
        let scraper = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/metrics"), deadline_in(5))
                    .await
            })
        };
        let instruction = second
            .await
            .expect("second poll finished")
            .expect("second poll gets the scrape");
        let id = instruction.request.headers()[wire::ID_HEADER].clone();
        coordinator
            .scrape_result(pushed_response(&id, "ok"))
            .await
            .expect("push delivered");
        scraper
            .await
            .expect("scrape finished")
            .expect("scrape succeeded");
    }

    #[tokio::test]
    async fn stale_queued_scrape_is_not_handed_out() {
        let coordinator = coordinator();
        // Deadline already in the past: a poller must skip it.
        let scraper = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .do_scrape(
                        scrape_request("http://host1/metrics"),
                        Instant::now() - Duration::from_millis(1),
                    )
                    .await
            })
        };
        let err = scraper
            .await
            .expect("scrape finished")
            .expect_err("expired before any poll");
        assert!(matches!(err, Error::NoMatchingClient { .. }));

        // A live scrape queued afterwards is the one the poller sees.
        let live = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .do_scrape(scrape_request("http://host1/live"), deadline_in(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        let instruction = coordinator
            .wait_for_scrape_instruction("host1")
            .await
            .expect("poll receives the live scrape");
        assert_eq!(instruction.request.uri().path(), "/live");
        let id = instruction.request.headers()[wire::ID_HEADER].clone();
        coordinator
            .scrape_result(pushed_response(&id, "ok"))
            .await
            .expect("push delivered");
        live.await
            .expect("live scrape finished")
            .expect("live scrape succeeded");
    }

    #[tokio::test]
    async fn known_clients_honor_the_registration_ttl() {
        let coordinator = Coordinator::new(Config {
            registration_timeout: Duration::from_millis(50),
            ..Config::default()
        });
        let poll = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_for_scrape_instruction("host1").await })
        };
        tokio::task::yield_now().await;
        assert_eq!(coordinator.known_clients(None), vec!["host1".to_string()]);
        assert_eq!(
            coordinator.known_clients(Some("host1")),
            vec!["host1".to_string()]
        );
        assert!(coordinator.known_clients(Some("other")).is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(
            coordinator.known_clients(None).is_empty(),
            "record ages out after the TTL"
        );
        poll.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn gc_prunes_stale_liveness_records() {
        let coordinator = Coordinator::new(Config {
            registration_timeout: Duration::from_secs(30),
            ..Config::default()
        });
        let poll = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_for_scrape_instruction("host1").await })
        };
        tokio::task::yield_now().await;
        let shutdown = Shutdown::new();
        let gc = coordinator.spawn_gc(shutdown.clone());

        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        {
            let state = lock(&coordinator.inner.state);
            assert!(
                state.known.is_empty(),
                "sweeper removed the stale liveness record"
            );
        }

        shutdown.signal();
        gc.await.expect("sweeper shut down cleanly");
        poll.abort();
    }

    #[tokio::test]
    async fn minted_ids_are_distinct() {
        let coordinator = coordinator();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..64 {
            let scraper = {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator
                        .do_scrape(scrape_request("http://host1/metrics"), deadline_in(5))
                        .await
                })
            };
            let instruction = coordinator
                .wait_for_scrape_instruction("host1")
                .await
                .expect("poll receives the scrape");
            let id = instruction.request.headers()[wire::ID_HEADER]
                .to_str()
                .expect("id is ascii")
                .to_string();
            assert!(ids.insert(id.clone()), "id {id} repeated");
            coordinator
                .scrape_result(pushed_response(
                    &instruction.request.headers()[wire::ID_HEADER].clone(),
                    "ok",
                ))
                .await
                .expect("push delivered");
            scraper
                .await
                .expect("scrape finished")
                .expect("scrape succeeded");
        }
    }
}
