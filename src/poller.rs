//! Upstream poller.
//!
//! Fetches public event pages at the fastest rate the remote quota allows,
//! coordinating with peer pollers through the shared rate-limit cache.
//! Each event is classified, deduplicated and enqueued exactly once per
//! poller instance. Transient upstream trouble never escapes the run loop;
//! only configuration and permanent authentication failures do.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{classify, Event, RawEvent};
use crate::limits::breaker::CircuitBreaker;
use crate::limits::dedup::DedupSet;
use crate::limits::rate::{poller_key, QuotaObservation, RateLimitCache, TokenBucket};
use crate::metrics;
use crate::queue::QueueHandle;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exponential backoff base for 5xx and transport errors.
const BACKOFF_BASE_MS: u64 = 500;
/// Backoff ceiling.
const BACKOFF_CAP_MS: u64 = 60_000;
/// Jitter added after a rate-limit reset sleep.
const RESET_JITTER_MS: u64 = 2_000;
/// Corrupt events are logged at most once per reason per this interval.
const CORRUPT_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub struct Poller {
    client: reqwest::Client,
    config: Arc<Config>,
    queue: QueueHandle,
    rate_cache: Arc<RateLimitCache>,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    dedup: DedupSet,
    etag: Option<String>,
    /// Highest event id seen, numeric when ids parse as integers.
    cursor: u64,
    consecutive_errors: u32,
    corrupt_log_times: HashMap<&'static str, Instant>,
    instance: Uuid,
}

impl Poller {
    pub fn new(
        config: Arc<Config>,
        queue: QueueHandle,
        rate_cache: Arc<RateLimitCache>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("forgewatch/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            queue,
            rate_cache,
            bucket: TokenBucket::new(),
            breaker: CircuitBreaker::new(
                config.breaker_failure_limit,
                Duration::from_millis(config.breaker_cooldown_ms),
            ),
            dedup: DedupSet::new(Duration::from_secs(config.dedup_ttl_min as u64 * 60)),
            etag: None,
            cursor: 0,
            consecutive_errors: 0,
            corrupt_log_times: HashMap::new(),
            instance: Uuid::new_v4(),
            config,
        })
    }

    /// Run until cancelled. The in-flight page is always drained before
    /// returning.
    pub async fn start(mut self, cancel: CancellationToken) -> Result<()> {
        info!(instance = %self.instance, url = %self.config.upstream_url, "poller started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let token_wait = self.bucket.time_to_token();
            if token_wait > Duration::ZERO {
                if sleep_or_cancel(token_wait.min(Duration::from_secs(5)), &cancel).await {
                    break;
                }
                continue;
            }

            // Checked after the token wait: once allow() admits the
            // half-open probe, the very next step is the probe request.
            if !self.breaker.allow() {
                metrics::BREAKER_OPEN.set(1);
                if sleep_or_cancel(Duration::from_millis(500), &cancel).await {
                    break;
                }
                continue;
            }
            metrics::BREAKER_OPEN.set(0);

            match self.tick().await {
                Ok(enqueued) => {
                    self.breaker.on_success();
                    self.consecutive_errors = 0;
                    debug!(enqueued, "poll tick complete");
                    if sleep_or_cancel(
                        Duration::from_millis(self.config.poll_interval_ms),
                        &cancel,
                    )
                    .await
                    {
                        break;
                    }
                }
                Err(Error::RateLimited { reset_unix }) => {
                    // Quota exhaustion is the protocol working, not a
                    // failure: the upstream answered, so the breaker closes.
                    self.breaker.on_success();
                    self.consecutive_errors = 0;
                    let wait = duration_until_unix(reset_unix)
                        + Duration::from_millis(fastrand::u64(0..RESET_JITTER_MS));
                    warn!(reset_unix, wait_ms = wait.as_millis() as u64, "rate limited");
                    if sleep_or_cancel(wait, &cancel).await {
                        break;
                    }
                    // The window rolled over; one probe relearns the quota.
                    self.bucket.grant(1.0);
                }
                Err(e) if e.is_fatal() => {
                    metrics::BREAKER_OPEN.set(0);
                    return Err(e);
                }
                Err(e) => {
                    self.breaker.on_failure();
                    self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                    let backoff = backoff_with_jitter(self.consecutive_errors);
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "poll failed");
                    if sleep_or_cancel(backoff, &cancel).await {
                        break;
                    }
                }
            }
        }

        info!(instance = %self.instance, "poller stopped");
        Ok(())
    }

    /// One page fetch: read quota headers, filter, dedup, enqueue.
    async fn tick(&mut self) -> Result<usize> {
        self.bucket.try_take();

        let page = match self.fetch_page().await? {
            Some(body) => body,
            // 304: nothing new, nothing spent.
            None => return Ok(0),
        };

        let mut raw = page.to_vec();
        let events: Vec<RawEvent> = match simd_json::from_slice(&mut raw) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "unparseable events page");
                return Ok(0);
            }
        };

        let mut enqueued = 0usize;
        let mut newest_cursor = self.cursor;
        for raw_event in events {
            metrics::EVENTS_POLLED.inc();

            if let Ok(numeric_id) = raw_event.id.parse::<u64>() {
                if numeric_id <= self.cursor {
                    continue;
                }
                newest_cursor = newest_cursor.max(numeric_id);
            }

            let event: Event = match raw_event.try_into() {
                Ok(event) => event,
                Err(Error::CorruptEvent { reason }) => {
                    metrics::CORRUPT_EVENTS.inc();
                    self.log_corrupt(reason);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let priority = match classify(&event.kind, &event.id, self.config.priority_sample_low)
            {
                Some(priority) => priority,
                None => {
                    metrics::EVENTS_SAMPLED_OUT.inc();
                    continue;
                }
            };

            if !self.dedup.insert(&event.id) {
                metrics::EVENTS_DEDUPED.inc();
                continue;
            }

            let outcome = self
                .queue
                .enqueue(event, priority, self.config.enqueue_wait())
                .await?;
            if outcome == crate::queue::EnqueueOutcome::Enqueued {
                metrics::EVENTS_ENQUEUED.with_label_values(&[priority.as_str()]).inc();
                enqueued += 1;
            }
        }

        self.cursor = newest_cursor;
        Ok(enqueued)
    }

    /// Fetch one page. `None` means 304 (cursor unchanged upstream).
    async fn fetch_page(&mut self) -> Result<Option<Bytes>> {
        let mut request = self
            .client
            .get(&self.config.upstream_url)
            .query(&[("per_page", self.config.page_size)]);
        if let Some(etag) = &self.etag {
            request = request.header(header::IF_NONE_MATCH, etag.clone());
        }

        let response = request.send().await?;
        let status = response.status();

        self.observe_quota(&response);

        match status {
            StatusCode::NOT_MODIFIED => Ok(None),
            StatusCode::UNAUTHORIZED => Err(Error::UpstreamAuth { status: status.as_u16() }),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                let reset_unix = header_u64(&response, "x-ratelimit-reset")
                    .unwrap_or_else(|| unix_now() + 60);
                Err(Error::RateLimited { reset_unix })
            }
            s if s.is_server_error() => Err(Error::UpstreamStatus { status: s.as_u16() }),
            s if s.is_success() => {
                self.etag = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(Some(response.bytes().await?))
            }
            s => Err(Error::UpstreamStatus { status: s.as_u16() }),
        }
    }

    /// Headers are the sole source of truth for quota; publish them to the
    /// shared cache and resize the local bucket to this poller's share.
    fn observe_quota(&mut self, response: &reqwest::Response) {
        let remaining = header_u64(response, "x-ratelimit-remaining");
        let reset_unix = header_u64(response, "x-ratelimit-reset");
        if let (Some(remaining), Some(reset_unix)) = (remaining, reset_unix) {
            let obs = QuotaObservation {
                remaining,
                reset_unix,
                observed_at_ms: unix_now_ms(),
            };
            self.rate_cache.update(&poller_key(&self.config.region), obs);

            let secs_to_reset = reset_unix.saturating_sub(unix_now());
            self.bucket
                .resize(remaining, self.config.active_pollers, secs_to_reset);
        }
    }

    fn log_corrupt(&mut self, reason: &'static str) {
        let now = Instant::now();
        let due = self
            .corrupt_log_times
            .get(reason)
            .map(|last| now.duration_since(*last) >= CORRUPT_LOG_INTERVAL)
            .unwrap_or(true);
        if due {
            warn!(reason, "dropping corrupt events");
            self.corrupt_log_times.insert(reason, now);
        }
    }
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn duration_until_unix(reset_unix: u64) -> Duration {
    Duration::from_secs(reset_unix.saturating_sub(unix_now()))
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10));
    let capped = exp.min(BACKOFF_CAP_MS);
    Duration::from_millis(capped / 2 + fastrand::u64(0..=capped / 2))
}

/// Sleep unless cancelled first; returns whether cancellation won.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
