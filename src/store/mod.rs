//! Profile storage.
//!
//! A key-value surface with per-key read-modify-write: concurrent callers
//! on the same key serialize, callers on distinct keys proceed in parallel.
//! The in-memory backend shards keys across mutexes and bounds its resident
//! set with the scored cache.

pub mod cache;

use crate::error::Result;
use crate::event::EventType;
use crate::profile::{FeatureVec, RepoProfile, RepoTouch, UserProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use cache::{CacheConfig, ProfileCache};

/// Smoothing rate for the repo contributor estimate and dependency ratio.
const CONTRIBUTOR_ALPHA: f64 = 0.1;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Point read; may be served from cache.
    async fn get_user(&self, id: u64) -> Result<Option<UserProfile>>;

    async fn get_repo(&self, id: u64) -> Result<Option<RepoProfile>>;

    /// Load, apply the EWMA baseline update, refresh the multivariate
    /// cache when due, persist. Atomic per key.
    async fn upsert_user(
        &self,
        id: u64,
        features: &FeatureVec,
        kind: &EventType,
        ts: DateTime<Utc>,
        alpha: f64,
        mvn_n: u64,
    ) -> Result<UserProfile>;

    /// Fold one event into the repository baseline. Atomic per key.
    async fn touch_repo(&self, id: u64, touch: RepoTouch) -> Result<RepoProfile>;

    /// Number of profiles currently resident, for stats surfaces.
    async fn resident_profiles(&self) -> usize;
}

pub struct MemoryProfileStore {
    user_shards: Vec<Mutex<ProfileCache<UserProfile>>>,
    repo_shards: Vec<Mutex<ProfileCache<RepoProfile>>>,
}

impl MemoryProfileStore {
    pub fn new(max_cached: usize) -> Self {
        let shards = 16;
        let per_shard = (max_cached / shards).max(64);
        let config = CacheConfig { max_entries: per_shard, min_accesses_for_eviction: 10 };
        Self {
            user_shards: (0..shards)
                .map(|_| Mutex::new(ProfileCache::new(config.clone())))
                .collect(),
            repo_shards: (0..shards)
                .map(|_| Mutex::new(ProfileCache::new(config.clone())))
                .collect(),
        }
    }

    fn user_shard(&self, id: u64) -> &Mutex<ProfileCache<UserProfile>> {
        &self.user_shards[(id % self.user_shards.len() as u64) as usize]
    }

    fn repo_shard(&self, id: u64) -> &Mutex<ProfileCache<RepoProfile>> {
        &self.repo_shards[(id % self.repo_shards.len() as u64) as usize]
    }

    /// Drop profiles whose last observation is older than the TTL.
    pub async fn prune_stale(&self, now: DateTime<Utc>, ttl_days: i64) {
        for shard in &self.user_shards {
            shard.lock().await.retain(|_, p| !p.is_stale(now, ttl_days));
        }
    }
}

impl Default for MemoryProfileStore {
    fn default() -> Self {
        Self::new(50_000)
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get_user(&self, id: u64) -> Result<Option<UserProfile>> {
        let mut shard = self.user_shard(id).lock().await;
        Ok(shard.get(id).cloned())
    }

    async fn get_repo(&self, id: u64) -> Result<Option<RepoProfile>> {
        let mut shard = self.repo_shard(id).lock().await;
        Ok(shard.get(id).cloned())
    }

    async fn upsert_user(
        &self,
        id: u64,
        features: &FeatureVec,
        kind: &EventType,
        ts: DateTime<Utc>,
        alpha: f64,
        mvn_n: u64,
    ) -> Result<UserProfile> {
        let mut shard = self.user_shard(id).lock().await;
        let profile = shard.get_or_create(id, 0, UserProfile::default);
        profile.observe(features, alpha, ts);
        profile.record_event_type(kind.as_str());
        // Maintained here, on the canonical profile, so the rebuild
        // counter actually batches inversions; reader clones carry the
        // cached matrix along.
        profile.inverse_covariance(mvn_n);
        Ok(profile.clone())
    }

    async fn touch_repo(&self, id: u64, touch: RepoTouch) -> Result<RepoProfile> {
        let mut shard = self.repo_shard(id).lock().await;
        let profile = shard.get_or_create(id, 0, RepoProfile::default);
        profile.observe(&touch, CONTRIBUTOR_ALPHA);
        Ok(profile.clone())
    }

    async fn resident_profiles(&self) -> usize {
        let mut total = 0;
        for shard in &self.user_shards {
            total += shard.lock().await.len();
        }
        for shard in &self.repo_shards {
            total += shard.lock().await.len();
        }
        total
    }
}
