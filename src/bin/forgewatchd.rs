//! forgewatchd: the detection daemon.
//!
//! Wires poller -> queue -> stream processor, serves the admin surface
//! (health, metrics, stats), and shuts the pipeline down in order on
//! ctrl-c: poller first, then the processor once its batch completes.

use axum::{Json, Router, extract::State, routing::get};
use forgewatch::config::Config;
use forgewatch::history::HistoryStore;
use forgewatch::limits::rate::RateLimitCache;
use forgewatch::metrics;
use forgewatch::poller::Poller;
use forgewatch::processor::{ProcessorParts, StreamProcessor};
use forgewatch::publish::{FanoutPublisher, HttpBridge, MemoryBus, Publisher};
use forgewatch::queue::event_queue;
use forgewatch::record::{MemoryRecordStore, NoopSummarizer, RecordStore};
use forgewatch::sink::AuditSink;
use forgewatch::store::{MemoryProfileStore, ProfileStore};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AdminState {
    profiles: Arc<dyn ProfileStore>,
    records: Arc<dyn RecordStore>,
}

#[derive(Serialize)]
struct StatsResponse {
    version: &'static str,
    status: &'static str,
    detectors: u8,
    resident_profiles: usize,
    anomaly_records: usize,
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler() -> String {
    metrics::render()
}

async fn stats_handler(State(state): State<AdminState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        detectors: forgewatch::detect::NUM_DETECTORS as u8,
        resident_profiles: state.profiles.resident_profiles().await,
        anomaly_records: state.records.record_count().await,
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "startup aborted");
            std::process::exit(1);
        }
    };

    metrics::init();
    info!(
        upstream = %config.upstream_url,
        lanes = config.lanes,
        batch_max = config.batch_max,
        "initializing forgewatch"
    );

    let (queue, consumer, drops) = event_queue(config.queue_capacity);
    let rate_cache = Arc::new(RateLimitCache::new());
    let profile_backend = Arc::new(MemoryProfileStore::new(config.profile_cache_max));
    let profiles: Arc<dyn ProfileStore> = profile_backend.clone();
    let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let history = Arc::new(HistoryStore::new(16, config.profile_cache_max));

    // Profiles age out after the retention TTL; sweep hourly.
    {
        let store = profile_backend.clone();
        let ttl_days = config.profile_ttl_days;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3_600));
            loop {
                interval.tick().await;
                store.prune_stale(chrono::Utc::now(), ttl_days).await;
                metrics::RESIDENT_PROFILES.set(store.resident_profiles().await as i64);
            }
        });
    }

    // In-process bus always; HTTP bridge when a broker is configured.
    let bus = Arc::new(MemoryBus::default());
    let mut sinks: Vec<Arc<dyn Publisher>> = vec![bus.clone()];
    if let Ok(broker_url) = std::env::var("FORGEWATCH_BROKER_URL") {
        let bridge_config =
            forgewatch::publish::BridgeConfig { broker_url, ..Default::default() };
        sinks.push(Arc::new(HttpBridge::new(bridge_config)));
    }
    let publisher: Arc<dyn Publisher> = Arc::new(FanoutPublisher::new(sinks));

    let (audit, audit_join) = if config.audit_dir.is_empty() {
        (None, None)
    } else {
        let dir = PathBuf::from(&config.audit_dir);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!(dir = %dir.display(), error = %e, "cannot create audit directory");
            std::process::exit(1);
        }
        let (handle, join) = AuditSink::spawn(dir);
        (Some(handle), Some(join))
    };

    let cancel = CancellationToken::new();

    let poller = match Poller::new(config.clone(), queue.clone(), rate_cache) {
        Ok(poller) => poller,
        Err(e) => {
            error!(error = %e, "poller construction failed");
            std::process::exit(1);
        }
    };
    let poller_cancel = cancel.clone();
    let poller_handle = tokio::spawn(async move {
        if let Err(e) = poller.start(poller_cancel).await {
            error!(error = %e, "poller exited fatally");
        }
    });

    let processor = StreamProcessor::new(ProcessorParts {
        config: config.clone(),
        profiles: profiles.clone(),
        records: records.clone(),
        publisher,
        summarizer: Arc::new(NoopSummarizer),
        history,
        queue: queue.clone(),
        drops,
        audit: audit.clone(),
    });
    let processor_cancel = cancel.clone();
    let processor_handle = tokio::spawn(async move {
        processor.run(consumer, processor_cancel).await;
    });

    let admin_state = AdminState { profiles: profiles.clone(), records: records.clone() };
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .with_state(admin_state);

    let listener = match TcpListener::bind(&config.admin_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.admin_addr, error = %e, "cannot bind admin address");
            std::process::exit(1);
        }
    };
    info!(addr = %config.admin_addr, "admin surface listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
            info!("shutting down, draining in-flight work");
            shutdown.cancel();
        })
        .await
        .expect("admin server crashed");

    cancel.cancel();
    let _ = poller_handle.await;
    drop(queue);
    let _ = processor_handle.await;

    drop(audit);
    if let Some(join) = audit_join {
        let _ = join.join();
    }
    info!("pipeline drained, goodbye");
}
