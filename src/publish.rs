//! Real-time fan-out.
//!
//! Publishing is channel-keyed: every record lands on `anomalies`, its
//! severity channel, and the per-actor and per-repo channels; batch stats
//! go to `processing_stats`. The in-process bus serves a single node; the
//! HTTP bridge forwards the same channel stream to an external broker so
//! subscribers can span processor instances.

use crate::error::{Error, Result};
use crate::fuse::Severity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

pub mod channels {
    use crate::fuse::Severity;

    pub const ANOMALIES: &str = "anomalies";
    pub const PROCESSING_STATS: &str = "processing_stats";

    pub fn severity(severity: Severity) -> String {
        format!("anomalies_{}", severity.channel_tag())
    }

    pub fn user(actor_id: u64) -> String {
        format!("user_{actor_id}")
    }

    pub fn repo(repo_id: u64) -> String {
        format!("repo_{repo_id}")
    }
}

/// Per-batch stats message published on `processing_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub events_processed: u64,
    pub anomalies_detected: u64,
    pub batch_size: usize,
    /// Cumulative drop counts by priority since startup.
    pub dropped_by_priority: HashMap<String, u64>,
    pub detector_timeouts: u64,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()>;
}

/// Fan a record's payload out to all of its channels.
pub async fn publish_record(
    publisher: &dyn Publisher,
    actor_id: u64,
    repo_id: u64,
    severity: Severity,
    payload: serde_json::Value,
) -> Result<()> {
    publisher.publish(channels::ANOMALIES, payload.clone()).await?;
    publisher.publish(&channels::severity(severity), payload.clone()).await?;
    publisher.publish(&channels::user(actor_id), payload.clone()).await?;
    publisher.publish(&channels::repo(repo_id), payload).await?;
    Ok(())
}

/// Single-process broadcast bus. Subscribers that lag are dropped by the
/// broadcast ring; cross-lane ordering is not preserved.
pub struct MemoryBus {
    topics: RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>,
    capacity: usize,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self { topics: RwLock::new(HashMap::new()), capacity: capacity.max(16) }
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut topics = self.topics.write().unwrap();
        topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

#[async_trait]
impl Publisher for MemoryBus {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()> {
        let topics = self.topics.read().unwrap();
        if let Some(sender) = topics.get(channel) {
            // No subscribers is fine; the send result only signals that.
            let _ = sender.send(payload);
        }
        Ok(())
    }
}

/// One channel-tagged message on the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub broker_url: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub channel_capacity: usize,
    pub timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker_url: "http://localhost:4222".to_string(),
            batch_size: 100,
            flush_interval_ms: 1_000,
            max_retries: 3,
            retry_base_delay_ms: 100,
            channel_capacity: 10_000,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct BridgeStats {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub dropped: AtomicU64,
    pub batches: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
struct MessageBatch<'a> {
    messages: &'a [ChannelMessage],
}

/// Bridges the channel stream to an external broker over HTTP with bounded
/// buffering, batching and retry. Messages that outlive the retry budget
/// are dropped and counted, never blocked on.
pub struct HttpBridge {
    tx: mpsc::Sender<ChannelMessage>,
    stats: Arc<BridgeStats>,
}

impl HttpBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let stats = Arc::new(BridgeStats::default());
        let worker_stats = stats.clone();

        tokio::spawn(async move {
            Self::worker(rx, config, worker_stats).await;
        });

        Self { tx, stats }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    async fn worker(
        mut rx: mpsc::Receiver<ChannelMessage>,
        config: BridgeConfig,
        stats: Arc<BridgeStats>,
    ) {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_max_idle_per_host(10)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "bridge client construction failed");
                return;
            }
        };

        let url = format!("{}/publish", config.broker_url.trim_end_matches('/'));
        let mut batch: Vec<ChannelMessage> = Vec::with_capacity(config.batch_size);
        let mut interval = tokio::time::interval(Duration::from_millis(config.flush_interval_ms));

        info!(url = %url, "broker bridge started");

        loop {
            tokio::select! {
                message = rx.recv() => {
                    match message {
                        Some(message) => {
                            batch.push(message);
                            if batch.len() >= config.batch_size {
                                Self::flush(&client, &url, &mut batch, &config, &stats).await;
                            }
                        }
                        None => break,
                    }
                }
                _ = interval.tick() => {
                    if !batch.is_empty() {
                        Self::flush(&client, &url, &mut batch, &config, &stats).await;
                    }
                }
            }
        }

        if !batch.is_empty() {
            Self::flush(&client, &url, &mut batch, &config, &stats).await;
        }

        info!("broker bridge stopped");
    }

    async fn flush(
        client: &reqwest::Client,
        url: &str,
        batch: &mut Vec<ChannelMessage>,
        config: &BridgeConfig,
        stats: &BridgeStats,
    ) {
        let messages = std::mem::take(batch);
        let count = messages.len();
        let payload = MessageBatch { messages: &messages };

        for attempt in 0..=config.max_retries {
            match client.post(url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    stats.sent.fetch_add(count as u64, Ordering::Relaxed);
                    stats.batches.fetch_add(1, Ordering::Relaxed);
                    debug!(count, "forwarded messages to broker");
                    return;
                }
                Ok(response) => {
                    warn!(attempt, status = %response.status(), "broker returned error");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "broker unreachable");
                }
            }

            if attempt < config.max_retries {
                stats.retried.fetch_add(1, Ordering::Relaxed);
                let delay = config.retry_base_delay_ms * (1u64 << attempt);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        stats.failed.fetch_add(count as u64, Ordering::Relaxed);
        error!(count, "dropped messages after max retries");
    }
}

#[async_trait]
impl Publisher for HttpBridge {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()> {
        let message = ChannelMessage { channel: channel.to_string(), payload };
        self.tx.try_send(message).map_err(|_| {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            Error::Publish { channel: channel.to_string(), reason: "bridge buffer full".into() }
        })
    }
}

/// Publishes to several sinks; the in-process bus and the bridge usually.
pub struct FanoutPublisher {
    sinks: Vec<Arc<dyn Publisher>>,
}

impl FanoutPublisher {
    pub fn new(sinks: Vec<Arc<dyn Publisher>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl Publisher for FanoutPublisher {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> Result<()> {
        for sink in &self.sinks {
            // A failing sink does not stop the others.
            if let Err(e) = sink.publish(channel, payload.clone()).await {
                debug!(channel, error = %e, "publish sink failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_bus_delivers_to_subscribers() {
        let bus = MemoryBus::default();
        let mut rx = bus.subscribe(channels::ANOMALIES);

        bus.publish(channels::ANOMALIES, json!({"event_id": "1"})).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got["event_id"], "1");
    }

    #[tokio::test]
    async fn test_memory_bus_channel_isolation() {
        let bus = MemoryBus::default();
        let mut critical = bus.subscribe(&channels::severity(Severity::Critical));
        let mut low = bus.subscribe(&channels::severity(Severity::Low));

        bus.publish(&channels::severity(Severity::Critical), json!({"s": "c"}))
            .await
            .unwrap();

        assert!(critical.try_recv().is_ok());
        assert!(low.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_record_hits_all_channels() {
        let bus = MemoryBus::default();
        let mut all = bus.subscribe(channels::ANOMALIES);
        let mut sev = bus.subscribe(&channels::severity(Severity::High));
        let mut user = bus.subscribe(&channels::user(7));
        let mut repo = bus.subscribe(&channels::repo(9));

        publish_record(&bus, 7, 9, Severity::High, json!({"event_id": "x"}))
            .await
            .unwrap();

        assert!(all.try_recv().is_ok());
        assert!(sev.try_recv().is_ok());
        assert!(user.try_recv().is_ok());
        assert!(repo.try_recv().is_ok());
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(channels::severity(Severity::Critical), "anomalies_critical");
        assert_eq!(channels::user(42), "user_42");
        assert_eq!(channels::repo(7), "repo_7");
    }
}
