//! Stream processor.
//!
//! Consumes the event queue in batches, drives the four detectors in
//! parallel per event, fuses the component scores, persists and publishes
//! the result, then folds the event into the actor's baseline. Events are
//! sharded onto worker lanes by actor id; within a lane processing is
//! strictly serial, so an actor's later events always see the baseline
//! their earlier events produced.

use crate::config::Config;
use crate::detect::{self, DetectorContext, DetectorParams, features};
use crate::error::Result;
use crate::event::{Event, EventType, Payload, Priority};
use crate::fuse::{self, Severity};
use crate::history::HistoryStore;
use crate::metrics;
use crate::profile::RepoTouch;
use crate::publish::{self, ProcessingStats, Publisher, channels};
use crate::queue::{DropCounters, QueueConsumer, QueueHandle};
use crate::record::{AnomalyRecord, RecordStore, Summarizer};
use crate::sink::AuditHandle;
use crate::store::ProfileStore;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Profile maturity required before the pre-filter may trust it.
const PREFILTER_MIN_SAMPLES: u64 = 50;
/// Event-type share above which the type counts as routine for the actor.
const PREFILTER_ROUTINE_SHARE: f64 = 0.20;

/// Everything the processor needs, injected so tests can swap the edges.
pub struct ProcessorParts {
    pub config: Arc<Config>,
    pub profiles: Arc<dyn ProfileStore>,
    pub records: Arc<dyn RecordStore>,
    pub publisher: Arc<dyn Publisher>,
    pub summarizer: Arc<dyn Summarizer>,
    pub history: Arc<HistoryStore>,
    pub queue: QueueHandle,
    pub drops: Arc<DropCounters>,
    pub audit: Option<AuditHandle>,
}

#[derive(Debug, Clone, Copy)]
pub struct EventOutcome {
    pub final_score: f64,
    pub severity: Severity,
    pub reported: bool,
    pub detector_timeouts: u32,
    pub prefiltered: bool,
    pub failed: bool,
}

impl EventOutcome {
    fn quiet(prefiltered: bool) -> Self {
        Self {
            final_score: 0.0,
            severity: Severity::Info,
            reported: false,
            detector_timeouts: 0,
            prefiltered,
            failed: false,
        }
    }

    fn failed() -> Self {
        Self { failed: true, ..Self::quiet(false) }
    }
}

struct LaneMessage {
    event: Event,
    priority: Priority,
    done: oneshot::Sender<EventOutcome>,
}

pub struct StreamProcessor {
    inner: Arc<ProcessorParts>,
}

impl StreamProcessor {
    pub fn new(parts: ProcessorParts) -> Self {
        Self { inner: Arc::new(parts) }
    }

    /// Score a single event outside the batch loop, with the per-event
    /// deadline and redelivery semantics applied.
    pub async fn process_one(&self, event: Event, priority: Priority) -> EventOutcome {
        process_event(&self.inner, event, priority).await
    }

    /// Run until the queue closes or the token cancels. The batch in
    /// flight always completes.
    pub async fn run(&self, mut consumer: QueueConsumer, cancel: CancellationToken) {
        let config = self.inner.config.clone();
        let lane_count = config.lanes;

        let mut lanes: Vec<mpsc::Sender<LaneMessage>> = Vec::with_capacity(lane_count);
        let mut lane_handles = Vec::with_capacity(lane_count);
        for lane_id in 0..lane_count {
            let (tx, rx) = mpsc::channel::<LaneMessage>(config.batch_max * 2);
            lanes.push(tx);
            let inner = self.inner.clone();
            lane_handles.push(tokio::spawn(async move {
                lane_worker(lane_id, inner, rx).await;
            }));
        }

        info!(lanes = lane_count, batch_max = config.batch_max, "stream processor started");

        loop {
            let (batch, stop) = self.collect_batch(&mut consumer, &cancel).await;
            if !batch.is_empty() {
                self.process_batch(batch, &lanes).await;
            }
            if stop {
                break;
            }
        }

        drop(lanes);
        for handle in lane_handles {
            let _ = handle.await;
        }
        info!("stream processor stopped");
    }

    /// Accumulate up to `batch_max` events or until `batch_max_wait` has
    /// passed since the first one.
    async fn collect_batch(
        &self,
        consumer: &mut QueueConsumer,
        cancel: &CancellationToken,
    ) -> (Vec<(Event, Priority)>, bool) {
        let config = &self.inner.config;
        let mut batch = Vec::with_capacity(config.batch_max);

        let first = tokio::select! {
            _ = cancel.cancelled() => return (batch, true),
            item = consumer.pop() => item,
        };
        let Some(first) = first else {
            return (batch, true);
        };
        batch.push(first);

        let deadline = tokio::time::Instant::now() + config.batch_max_wait();
        while batch.len() < config.batch_max {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match consumer.pop_timeout(remaining).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) => return (batch, true),
                Err(()) => break,
            }
        }
        (batch, false)
    }

    /// Dispatch a batch across the lanes and wait for all of it, bounded
    /// by the batch deadline, then publish the batch stats.
    async fn process_batch(&self, batch: Vec<(Event, Priority)>, lanes: &[mpsc::Sender<LaneMessage>]) {
        let batch_size = batch.len();
        let mut receivers = Vec::with_capacity(batch_size);

        for (event, priority) in batch {
            let lane = (event.actor_hash() % lanes.len() as u64) as usize;
            let (done, rx) = oneshot::channel();
            receivers.push(rx);
            if lanes[lane].send(LaneMessage { event, priority, done }).await.is_err() {
                warn!(lane, "lane closed while dispatching");
            }
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.batch_timeout();
        let mut processed = 0u64;
        let mut reported = 0u64;
        let mut timeouts = 0u64;
        for rx in receivers {
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(outcome)) => {
                    processed += 1;
                    if outcome.reported {
                        reported += 1;
                    }
                    timeouts += outcome.detector_timeouts as u64;
                }
                Ok(Err(_)) => {
                    // Lane dropped the sender; counted as a failure.
                    processed += 1;
                }
                Err(_) => {
                    // Batch deadline passed; remaining events finish in
                    // their lanes but are not awaited.
                    timeouts += 1;
                }
            }
        }

        metrics::BATCHES_PROCESSED.inc();
        let stats = ProcessingStats {
            events_processed: processed,
            anomalies_detected: reported,
            batch_size,
            dropped_by_priority: self.inner.drops.snapshot(),
            detector_timeouts: timeouts,
        };
        if let Ok(payload) = serde_json::to_value(&stats) {
            let _ = self.inner.publisher.publish(channels::PROCESSING_STATS, payload).await;
        }
        debug!(batch_size, reported, "batch complete");
    }
}

async fn lane_worker(lane_id: usize, inner: Arc<ProcessorParts>, mut rx: mpsc::Receiver<LaneMessage>) {
    debug!(lane = lane_id, "lane worker active");
    while let Some(message) = rx.recv().await {
        let outcome = process_event(&inner, message.event, message.priority).await;
        let _ = message.done.send(outcome);
    }
    debug!(lane = lane_id, "lane worker stopped");
}

/// Per-event pipeline with the per-event deadline applied. Transient
/// failures requeue the event for at-least-once redelivery.
async fn process_event(inner: &Arc<ProcessorParts>, event: Event, priority: Priority) -> EventOutcome {
    let deadline = inner.config.event_timeout();
    match tokio::time::timeout(deadline, process_event_inner(inner, &event, priority)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) if e.is_transient() => {
            warn!(event_id = %event.id, error = %e, "transient failure, requeueing");
            let _ = inner.queue.requeue(event, priority).await;
            EventOutcome::failed()
        }
        Ok(Err(e)) => {
            warn!(event_id = %event.id, error = %e, "event processing failed");
            EventOutcome::failed()
        }
        Err(_) => {
            warn!(event_id = %event.id, "event deadline exceeded");
            EventOutcome { detector_timeouts: 1, ..EventOutcome::failed() }
        }
    }
}

async fn process_event_inner(
    inner: &Arc<ProcessorParts>,
    event: &Event,
    priority: Priority,
) -> Result<EventOutcome> {
    let config = &inner.config;
    let timer = metrics::PROCESSING_LATENCY.start_timer();

    // Cheap rejection of routine low-priority events. Never applied to
    // high or medium priority.
    if priority == Priority::Low {
        if let Some(user) = inner.profiles.get_user(event.actor.id).await? {
            if user.n >= PREFILTER_MIN_SAMPLES
                && user.type_share(event.kind.as_str()) >= PREFILTER_ROUTINE_SHARE
            {
                metrics::EVENTS_PREFILTERED.inc();
                inner.records.persist_event(event).await?;
                inner.history.record(event, config.coord_window_min);
                timer.observe_duration();
                return Ok(EventOutcome::quiet(true));
            }
        }
    }

    let user = inner.profiles.get_user(event.actor.id).await?.unwrap_or_default();
    let repo = inner.profiles.get_repo(event.repo.id).await?.unwrap_or_default();

    let history = inner.history.record(event, config.coord_window_min);
    let feature_vector = features::extract(
        &history.actor_events,
        event.created_at,
        config.burst_window_min,
        config.burst_min_count,
        config.burst_min_rate,
    );

    let distinct_repo_actors = history.distinct_repo_actors;
    let ctx = Arc::new(DetectorContext {
        event: event.clone(),
        user,
        repo,
        history,
        features: feature_vector,
        params: DetectorParams::from_config(config),
    });

    let outputs = detect::run_all(ctx, config.detector_timeout()).await;
    let mut detector_timeouts = 0u32;
    for output in &outputs {
        match output.degraded.as_deref() {
            Some("timeout") => {
                detector_timeouts += 1;
                metrics::DETECTOR_TIMEOUTS.with_label_values(&[output.kind.name()]).inc();
            }
            Some(_) => {
                metrics::DETECTOR_ERRORS.with_label_values(&[output.kind.name()]).inc();
            }
            None => {}
        }
    }

    let fused = fuse::fuse(outputs[0].score, outputs[1].score, outputs[2].score, outputs[3].score);

    // The event itself is persisted exactly once regardless of the score.
    inner.records.persist_event(event).await?;

    let mut reported = false;
    if fused.final_score >= config.report_floor {
        let mut record = AnomalyRecord::build(event, &fused, &outputs, chrono::Utc::now());
        record.ai_summary = inner.summarizer.summarize(&record).await;

        if inner.records.insert(record.clone()).await? {
            reported = true;
            metrics::ANOMALIES_DETECTED
                .with_label_values(&[fused.severity.channel_tag()])
                .inc();

            if let Some(audit) = &inner.audit {
                if let Ok(line) = serde_json::to_string(&record) {
                    audit.submit(line);
                }
            }

            if fused.severity >= Severity::High {
                warn!(
                    event_id = %event.id,
                    repo = %event.repo.name,
                    actor = %event.actor.login,
                    score = fused.final_score,
                    primary = fused.primary.name(),
                    "anomaly detected"
                );
            }

            if let Ok(payload) = serde_json::to_value(&record) {
                publish::publish_record(
                    inner.publisher.as_ref(),
                    event.actor.id,
                    event.repo.id,
                    fused.severity,
                    payload,
                )
                .await?;
            }
        }
    }

    // Baseline updates happen after detection, never before, so the event
    // was scored against the baseline that preceded it.
    inner
        .profiles
        .upsert_user(
            event.actor.id,
            &feature_vector,
            &event.kind,
            event.created_at,
            config.ewma_alpha,
            config.mvn_n,
        )
        .await?;

    let contextual = &outputs[3];
    let touch = RepoTouch {
        ts: event.created_at,
        distinct_actors_recent: distinct_repo_actors,
        popularity_event: matches!(
            event.kind,
            EventType::Watch | EventType::Star | EventType::Fork
        ),
        fork_event: event.kind == EventType::Fork,
        dependency_manifest_touch: push_touches_manifest(event),
        criticality: (!contextual.is_degraded()).then_some(contextual.score),
    };
    inner.profiles.touch_repo(event.repo.id, touch).await?;

    metrics::EVENTS_PROCESSED.inc();
    timer.observe_duration();

    Ok(EventOutcome {
        final_score: fused.final_score,
        severity: fused.severity,
        reported,
        detector_timeouts,
        prefiltered: false,
        failed: false,
    })
}

fn push_touches_manifest(event: &Event) -> bool {
    match &event.payload {
        Payload::Push(push) => push
            .commits
            .iter()
            .flat_map(|c| c.files.iter())
            .any(|f| crate::detect::content::is_dependency_manifest(&f.path)),
        _ => false,
    }
}
