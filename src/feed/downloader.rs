//! Public stash feed downloader.
//!
//! A single actor task walks the change feed. Every fetch streams its body and
//! peeks the embedded `next_change_id` from the first bytes, so the next page
//! is requested while the current one is still downloading. Completed pages
//! leave through a bounded channel strictly in ledger order.
//!
//! Failed requests are retried in place forever: the ledger cannot advance
//! past an id that has not been delivered.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use regex::bytes::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::FeedConfig;
use crate::feed::change_id::ChangeId;
use crate::feed::ledger::Ledger;
use crate::feed::stats::{DownloaderStats, FeedStats, SkipAhead, SkipAheadEnd};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Bytes that must be buffered before the next id is looked for.
pub const PEEK_BYTES: usize = 512;

const QUEUE_PUSH_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""next_change_id":\s*"([0-9\-]+)""#).expect("next id pattern is valid")
});

/// Extract the embedded `next_change_id` from (part of) a feed page.
pub fn peek_next_id(bytes: &[u8]) -> Option<ChangeId> {
    let captures = NEXT_ID_RE.captures(bytes)?;
    let raw = std::str::from_utf8(captures.get(1)?.as_bytes()).ok()?;
    ChangeId::new(raw).ok()
}

/// A feed page released in order.
#[derive(Debug, Clone)]
pub struct FeedPayload {
    pub change_id: ChangeId,
    pub next_change_id: ChangeId,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum NextResult {
    Payload(FeedPayload),
    Timeout,
    /// The downloader has stopped and every released payload was consumed.
    Closed,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<i64>,
    message: Option<String>,
}

fn parse_error_envelope(body: &[u8]) -> Option<ErrorBody> {
    serde_json::from_slice::<ErrorEnvelope>(body)
        .ok()
        .map(|e| e.error)
}

/// Handle to a running downloader actor.
pub struct FeedDownloader {
    results: mpsc::Receiver<FeedPayload>,
    stats: watch::Receiver<DownloaderStats>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl FeedDownloader {
    /// Spawn the actor, starting the walk at `start`.
    ///
    /// `shutdown` is the scanner-wide stop signal; cancelling it stops the
    /// downloader as well.
    pub fn start(
        config: &FeedConfig,
        start: ChangeId,
        skip_ahead: bool,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let connections = config.connections.max(1);
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .pool_max_idle_per_host(connections)
            .user_agent(concat!("stash-scanner/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create feed HTTP client")?;

        let limiter = create_dispatch_limiter(config.request_delay());
        let (output, results) = mpsc::channel(config.queue_capacity.max(1));
        let (stats_tx, stats) = watch::channel(DownloaderStats::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stop = shutdown.child_token();

        let mut ledger = Ledger::new();
        ledger.add(start.clone(), skip_ahead);

        let actor = FeedActor {
            http,
            base_url: config.base_url.clone(),
            ledger,
            free_slots: connections,
            limiter,
            in_flight: HashMap::new(),
            events_tx,
            events_rx,
            output,
            queue_capacity: config.queue_capacity,
            skip: SkipAhead::new(
                skip_ahead,
                config.sufficient_delta,
                config.skip_timeout(),
                Instant::now(),
            ),
            stats: FeedStats::default(),
            stats_tx,
            last_released: None,
            stop: stop.clone(),
        };

        info!(
            start = %start,
            connections,
            delay_ms = config.request_delay_ms,
            skip_ahead,
            "Feed downloader starting"
        );
        let task = tokio::spawn(actor.run());

        Ok(Self {
            results,
            stats,
            stop,
            task,
        })
    }

    /// Signal a graceful shutdown. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Wait up to `timeout` for the next in-order payload.
    pub async fn next_result(&mut self, timeout: Duration) -> NextResult {
        match tokio::time::timeout(timeout, self.results.recv()).await {
            Ok(Some(payload)) => NextResult::Payload(payload),
            Ok(None) => NextResult::Closed,
            Err(_) => NextResult::Timeout,
        }
    }

    pub fn stats(&self) -> DownloaderStats {
        self.stats.borrow().clone()
    }

    /// Stop the actor and wait until all in-flight requests are closed.
    pub async fn join(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Feed downloader task ended abnormally");
        }
    }
}

fn create_dispatch_limiter(delay: Duration) -> Option<Arc<Limiter>> {
    let quota = Quota::with_period(delay)?.allow_burst(NonZeroU32::MIN);
    Some(Arc::new(RateLimiter::direct(quota)))
}

async fn limiter_ready(limiter: Option<&Limiter>) {
    match limiter {
        Some(limiter) => limiter.until_ready().await,
        None => std::future::pending().await,
    }
}

enum FetchEvent {
    Peeked {
        seq: u64,
        next: ChangeId,
        at: Instant,
    },
    Done {
        seq: u64,
        result: FetchResult,
    },
}

enum FetchResult {
    Completed {
        status: StatusCode,
        body: Bytes,
        first_byte: Option<Instant>,
    },
    /// Body discarded after the next id was found.
    Skipped,
    Failed(String),
}

struct FeedActor {
    http: reqwest::Client,
    base_url: String,
    ledger: Ledger,
    free_slots: usize,
    limiter: Option<Arc<Limiter>>,
    in_flight: HashMap<u64, JoinHandle<()>>,
    events_tx: mpsc::UnboundedSender<FetchEvent>,
    events_rx: mpsc::UnboundedReceiver<FetchEvent>,
    output: mpsc::Sender<FeedPayload>,
    queue_capacity: usize,
    skip: SkipAhead,
    stats: FeedStats,
    stats_tx: watch::Sender<DownloaderStats>,
    last_released: Option<ChangeId>,
    stop: CancellationToken,
}

impl FeedActor {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            self.dispatch_ready();

            if self.ledger.is_empty() {
                warn!("No requests left, feed downloader stopping");
                break;
            }

            let wants_dispatch = self.free_slots > 0 && self.ledger.has_ready();

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = limiter_ready(self.limiter.as_deref()), if wants_dispatch => {
                    self.dispatch_one();
                }
                _ = tick.tick() => {
                    self.stats.tick();
                    if let Some(end) = self.skip.check(Instant::now()) {
                        log_skip_end(end);
                    }
                }
            }

            if !self.release_finished().await {
                break;
            }
            self.publish_stats();
        }

        self.shutdown().await;
    }

    fn permits_dispatch(&self) -> bool {
        self.limiter.as_ref().map_or(true, |l| l.check().is_ok())
    }

    fn dispatch_ready(&mut self) {
        while self.free_slots > 0 && self.ledger.has_ready() && self.permits_dispatch() {
            self.dispatch_one();
        }
    }

    fn dispatch_one(&mut self) {
        let Some(request) = self.ledger.take_ready() else {
            return;
        };
        let seq = request.seq;
        let id = request.id.clone();
        let skip_data = request.skip_data;
        if let (Some(added), Some(submitted)) = (request.times.added, request.times.submitted) {
            self.stats
                .record_dispatch_delay(submitted.saturating_duration_since(added));
        }

        self.free_slots -= 1;
        debug!(id = %id, skip_data, "Dispatching feed request");

        let handle = tokio::spawn(fetch_page(
            self.http.clone(),
            self.base_url.clone(),
            seq,
            id,
            skip_data,
            self.events_tx.clone(),
        ));
        self.in_flight.insert(seq, handle);
    }

    fn handle_event(&mut self, event: FetchEvent) {
        match event {
            FetchEvent::Peeked { seq, next, at } => self.handle_peek(seq, next, at),
            FetchEvent::Done { seq, result } => {
                self.free_slots += 1;
                self.in_flight.remove(&seq);
                self.handle_done(seq, result);
            }
        }
    }

    fn handle_peek(&mut self, seq: u64, next: ChangeId, at: Instant) {
        let skip_new = self.skip.is_active();
        let Some(request) = self.ledger.get_mut(seq) else {
            return;
        };
        if request.submitted_next.is_some() {
            return;
        }

        if let Some(submitted) = request.times.submitted {
            self.stats.record_peek(at.saturating_duration_since(submitted));
        }
        request.times.peeked = Some(at);
        request.submitted_next = Some(next.clone());
        if request.skip_data {
            request.finished = true;
        }

        debug!(next = %next, "Peeked next change id");
        self.ledger.add(next, skip_new);
    }

    fn handle_done(&mut self, seq: u64, result: FetchResult) {
        let Some(request) = self.ledger.get_mut(seq) else {
            return;
        };
        if let Some(submitted) = request.times.submitted {
            self.stats.record_request(submitted.elapsed());
        }

        match result {
            FetchResult::Skipped => {}
            FetchResult::Failed(error) => {
                if request.finished {
                    return;
                }
                let id = request.id.clone();
                let failures = self.ledger.requeue(seq);
                if should_warn(failures) {
                    warn!(id = %id, failures, error = %error, "Feed request failed, redownloading");
                } else {
                    debug!(id = %id, failures, error = %error, "Feed request failed, redownloading");
                }
            }
            FetchResult::Completed {
                status,
                body,
                first_byte,
            } => {
                request.times.started = first_byte;
                if status != StatusCode::OK {
                    let (code, message) = parse_error_envelope(&body)
                        .map(|e| (e.code, e.message))
                        .unwrap_or_default();
                    let id = request.id.clone();
                    let failures = self.ledger.requeue(seq);
                    if should_warn(failures) {
                        warn!(
                            id = %id,
                            status = status.as_u16(),
                            code,
                            message = message.as_deref().unwrap_or(""),
                            failures,
                            "Feed returned an error, retrying"
                        );
                    }
                    return;
                }

                if request.submitted_next.is_none() {
                    match peek_next_id(&body) {
                        Some(next) => {
                            info!(id = %request.id, "Full peek was required to find next id");
                            request.submitted_next = Some(next.clone());
                            request.times.peeked = Some(Instant::now());
                            let skip_new = self.skip.is_active();
                            self.ledger.add(next, skip_new);
                        }
                        None => {
                            let id = request.id.clone();
                            let failures = self.ledger.requeue(seq);
                            if !should_warn(failures) {
                                return;
                            }
                            match parse_error_envelope(&body) {
                                Some(e) => warn!(
                                    id = %id,
                                    code = e.code,
                                    message = e.message.as_deref().unwrap_or(""),
                                    failures,
                                    "Feed returned an error, retrying"
                                ),
                                None => warn!(
                                    id = %id,
                                    bytes = body.len(),
                                    failures,
                                    "Next change id not found, redownloading"
                                ),
                            }
                            return;
                        }
                    }
                }

                if let Some(request) = self.ledger.get_mut(seq) {
                    request.payload = body;
                    request.finished = true;
                }
            }
        }
    }

    /// Hand finished head-of-ledger requests to the consumer. Returns false
    /// once the downloader should stop.
    async fn release_finished(&mut self) -> bool {
        while let Some(request) = self.ledger.pop_finished() {
            let Some(next) = request.submitted_next else {
                continue;
            };
            let delta = request.id.delta(&next);
            self.stats.record_release(delta);
            self.last_released = Some(request.id.clone());
            if let Some(end) = self.skip.record(delta, Instant::now()) {
                log_skip_end(end);
            }

            if request.skip_data {
                continue;
            }

            let queued_at = Instant::now();
            let payload = FeedPayload {
                change_id: request.id,
                next_change_id: next,
                body: request.payload,
            };

            match self.output.send_timeout(payload, QUEUE_PUSH_TIMEOUT).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(payload)) => {
                    warn!(
                        capacity = self.queue_capacity,
                        "Result queue is full, waiting for the parser"
                    );
                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => return false,
                        sent = self.output.send(payload) => {
                            if sent.is_err() {
                                return false;
                            }
                        }
                    }
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    info!("Payload consumer has gone away, feed downloader stopping");
                    return false;
                }
            }
            self.stats.record_queue(queued_at.elapsed());
        }
        true
    }

    fn publish_stats(&self) {
        let mut snapshot = self.stats.snapshot();
        snapshot.in_flight = self.in_flight.len();
        snapshot.skip_ahead = self.skip.is_active();
        snapshot.last_released = self.last_released.as_ref().map(ToString::to_string);
        snapshot.pending = self
            .ledger
            .pending_ids()
            .iter()
            .map(ToString::to_string)
            .collect();
        self.stats_tx.send_replace(snapshot);
    }

    async fn shutdown(mut self) {
        let outstanding = self.in_flight.len();
        for (_, handle) in self.in_flight.drain() {
            handle.abort();
            let _ = handle.await;
        }
        self.publish_stats();
        info!(
            outstanding,
            pending = self.ledger.len(),
            "Feed downloader stopped"
        );
    }
}

/// A request stuck on the same id keeps retrying, but only every tenth
/// failure after the first few is reported.
fn should_warn(failures: u32) -> bool {
    failures <= 3 || failures % 10 == 0
}

fn log_skip_end(end: SkipAheadEnd) {
    match end {
        SkipAheadEnd::CaughtUp { average_delta } => {
            info!(average_delta, "Caught up with the feed, skip-ahead finished")
        }
        SkipAheadEnd::TimedOut => warn!("Skip-ahead timed out before catching up"),
    }
}

#[instrument(skip_all, fields(id = %id))]
async fn fetch_page(
    http: reqwest::Client,
    base_url: String,
    seq: u64,
    id: ChangeId,
    skip_data: bool,
    events: mpsc::UnboundedSender<FetchEvent>,
) {
    let result = stream_page(&http, &base_url, seq, &id, skip_data, &events).await;
    let _ = events.send(FetchEvent::Done { seq, result });
}

async fn stream_page(
    http: &reqwest::Client,
    base_url: &str,
    seq: u64,
    id: &ChangeId,
    skip_data: bool,
    events: &mpsc::UnboundedSender<FetchEvent>,
) -> FetchResult {
    let mut response = match http
        .get(base_url)
        .query(&[("id", id.as_str())])
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => return FetchResult::Failed(e.to_string()),
    };

    let status = response.status();
    let mut buffer = BytesMut::new();
    let mut first_byte = None;
    let mut peek_attempted = status != StatusCode::OK;

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                first_byte.get_or_insert_with(Instant::now);
                buffer.extend_from_slice(&chunk);

                if !peek_attempted && buffer.len() >= PEEK_BYTES {
                    peek_attempted = true;
                    if let Some(next) = peek_next_id(&buffer[..PEEK_BYTES]) {
                        let _ = events.send(FetchEvent::Peeked {
                            seq,
                            next,
                            at: Instant::now(),
                        });
                        if skip_data {
                            return FetchResult::Skipped;
                        }
                    }
                }
            }
            Ok(None) => break,
            Err(e) => return FetchResult::Failed(e.to_string()),
        }
    }

    FetchResult::Completed {
        status,
        body: buffer.freeze(),
        first_byte,
    }
}
