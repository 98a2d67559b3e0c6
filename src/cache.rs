//! In-process, read-through cache over slowly-changing reference data.
//!
//! Message processing must not touch the database on the hot path: sources,
//! per-channel allow-patterns, per-destination footers and the destination
//! list are all served from memory here. Writers replace entries wholesale so
//! concurrent readers see either the old or the new snapshot, never a partial
//! update. Staleness is handled by explicit invalidation and the operator
//! `/refresh` command; there is no TTL.

use crate::db::{self, Pool};
use crate::model::{Destination, SourceDisplay};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long a (chat, message) pair suppresses duplicate deliveries.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(10);

/// One immutable snapshot of the destination list plus its derived indices.
/// The map and region list are built together from the same list, so the two
/// synchronous accessors can never disagree.
#[derive(Debug, Default)]
pub struct DestinationIndex {
    pub list: Vec<Destination>,
    pub map: HashMap<String, i64>,
    pub regions: Vec<String>,
}

impl DestinationIndex {
    fn build(list: Vec<Destination>) -> Self {
        let map: HashMap<String, i64> = list
            .iter()
            .map(|d| (d.name.to_lowercase(), d.channel_id))
            .collect();
        let regions = list.iter().map(|d| d.name.to_lowercase()).collect();
        DestinationIndex { list, map, regions }
    }
}

/// Counts reported back by operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub sources: usize,
    pub destinations: usize,
    pub regions: usize,
}

pub struct RefCache {
    pool: Pool,
    sources: RwLock<HashMap<i64, SourceDisplay>>,
    patterns: RwLock<HashMap<i64, Vec<String>>>,
    // Maps channel id to the fetched footer; a present `None` value means
    // "fetched, destination has no footer" and is not refetched.
    footers: RwLock<HashMap<i64, Option<String>>>,
    destinations: RwLock<Arc<DestinationIndex>>,
    initialized: AtomicBool,
    recent: Mutex<HashMap<(i64, i64), Instant>>,
}

impl RefCache {
    pub fn new(pool: Pool) -> Self {
        RefCache {
            pool,
            sources: RwLock::new(HashMap::new()),
            patterns: RwLock::new(HashMap::new()),
            footers: RwLock::new(HashMap::new()),
            destinations: RwLock::new(Arc::new(DestinationIndex::default())),
            initialized: AtomicBool::new(false),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Check-and-register a recently seen (chat, message) pair. Returns true
    /// without re-registering when the pair was already seen inside the
    /// window. Pruning happens on every call, bounding the map without a
    /// background task.
    pub fn is_duplicate_message(&self, chat_id: i64, message_id: i64) -> bool {
        self.is_duplicate_at(chat_id, message_id, Instant::now())
    }

    fn is_duplicate_at(&self, chat_id: i64, message_id: i64, now: Instant) -> bool {
        let key = (chat_id, message_id);
        let mut recent = self.recent.lock().expect("duplicate window poisoned");
        recent.retain(|_, seen| now.duration_since(*seen) < DUPLICATE_WINDOW);
        if recent.contains_key(&key) {
            return true;
        }
        recent.insert(key, now);
        false
    }

    async fn ensure_warm(&self) -> Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            self.warm().await?;
        }
        Ok(())
    }

    /// Pre-load the full source and destination sets.
    pub async fn warm(&self) -> Result<()> {
        info!("warming cache");
        self.refresh_sources().await?;
        self.refresh_destinations().await?;
        self.initialized.store(true, Ordering::Release);
        let stats = self.stats();
        info!(
            sources = stats.sources,
            destinations = stats.destinations,
            "cache warmed"
        );
        Ok(())
    }

    pub async fn get_source(&self, channel_id: i64) -> Result<Option<SourceDisplay>> {
        self.ensure_warm().await?;
        if let Some(source) = self
            .sources
            .read()
            .expect("sources lock poisoned")
            .get(&channel_id)
        {
            return Ok(Some(source.clone()));
        }
        // Not part of the warm snapshot (e.g. just joined); fetch it alone.
        debug!(channel_id, "source not in cache, fetching individually");
        let fetched = db::get_source(&self.pool, channel_id).await?;
        if let Some(source) = &fetched {
            self.sources
                .write()
                .expect("sources lock poisoned")
                .insert(channel_id, source.clone());
        }
        Ok(fetched)
    }

    pub async fn refresh_sources(&self) -> Result<()> {
        info!("refreshing sources cache");
        let fresh = db::get_sources(&self.pool).await?;
        let count = fresh.len();
        *self.sources.write().expect("sources lock poisoned") = fresh;
        info!(count, "sources cache loaded");
        Ok(())
    }

    pub async fn get_patterns(&self, channel_id: i64) -> Result<Vec<String>> {
        if let Some(patterns) = self
            .patterns
            .read()
            .expect("patterns lock poisoned")
            .get(&channel_id)
        {
            return Ok(patterns.clone());
        }
        debug!(channel_id, "patterns not in cache, fetching");
        let fetched = db::get_patterns(&self.pool, channel_id).await?;
        self.patterns
            .write()
            .expect("patterns lock poisoned")
            .insert(channel_id, fetched.clone());
        Ok(fetched)
    }

    pub async fn refresh_patterns(&self, channel_id: i64) -> Result<()> {
        let fetched = db::get_patterns(&self.pool, channel_id).await?;
        self.patterns
            .write()
            .expect("patterns lock poisoned")
            .insert(channel_id, fetched);
        Ok(())
    }

    pub async fn get_footer(&self, channel_id: i64) -> Result<Option<String>> {
        if let Some(footer) = self
            .footers
            .read()
            .expect("footers lock poisoned")
            .get(&channel_id)
        {
            return Ok(footer.clone());
        }
        debug!(channel_id, "footer not in cache, fetching");
        let fetched = db::get_footer(&self.pool, channel_id).await?;
        self.footers
            .write()
            .expect("footers lock poisoned")
            .insert(channel_id, fetched.clone());
        Ok(fetched)
    }

    pub async fn refresh_footer(&self, channel_id: i64) -> Result<()> {
        let fetched = db::get_footer(&self.pool, channel_id).await?;
        self.footers
            .write()
            .expect("footers lock poisoned")
            .insert(channel_id, fetched);
        Ok(())
    }

    pub async fn get_destinations(&self) -> Result<Vec<Destination>> {
        self.ensure_warm().await?;
        Ok(self.destination_index().list.clone())
    }

    /// Current destination snapshot with both derived indices. Synchronous
    /// and O(1); never performs I/O.
    pub fn destination_index(&self) -> Arc<DestinationIndex> {
        self.destinations
            .read()
            .expect("destinations lock poisoned")
            .clone()
    }

    /// Precomputed region-name → destination-id map.
    pub fn destination_map(&self) -> HashMap<String, i64> {
        self.destination_index().map.clone()
    }

    /// Precomputed region-name list.
    pub fn destination_regions(&self) -> Vec<String> {
        self.destination_index().regions.clone()
    }

    pub async fn refresh_destinations(&self) -> Result<()> {
        info!("refreshing destinations cache");
        let list = db::get_destinations(&self.pool).await?;
        let index = Arc::new(DestinationIndex::build(list));
        let regions = index.regions.len();
        *self.destinations.write().expect("destinations lock poisoned") = index;
        info!(regions, "destination index rebuilt");
        Ok(())
    }

    /// Force a full reload; backs the operator `/refresh` command.
    pub async fn refresh_all(&self) -> Result<CacheStats> {
        info!("refreshing all caches");
        self.refresh_sources().await?;
        self.refresh_destinations().await?;
        self.initialized.store(true, Ordering::Release);
        Ok(self.stats())
    }

    pub fn invalidate_source(&self, channel_id: i64) {
        if self
            .sources
            .write()
            .expect("sources lock poisoned")
            .remove(&channel_id)
            .is_some()
        {
            debug!(channel_id, "invalidated source cache entry");
        }
    }

    pub fn invalidate_patterns(&self, channel_id: i64) {
        if self
            .patterns
            .write()
            .expect("patterns lock poisoned")
            .remove(&channel_id)
            .is_some()
        {
            debug!(channel_id, "invalidated patterns cache entry");
        }
    }

    pub fn invalidate_footer(&self, channel_id: i64) {
        if self
            .footers
            .write()
            .expect("footers lock poisoned")
            .remove(&channel_id)
            .is_some()
        {
            debug!(channel_id, "invalidated footer cache entry");
        }
    }

    pub fn clear_all(&self) {
        info!("clearing all caches");
        self.sources.write().expect("sources lock poisoned").clear();
        self.patterns.write().expect("patterns lock poisoned").clear();
        self.footers.write().expect("footers lock poisoned").clear();
        *self.destinations.write().expect("destinations lock poisoned") =
            Arc::new(DestinationIndex::default());
        self.recent
            .lock()
            .expect("duplicate window poisoned")
            .clear();
        self.initialized.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.destination_index();
        CacheStats {
            sources: self.sources.read().expect("sources lock poisoned").len(),
            destinations: index.list.len(),
            regions: index.regions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::setup_test_pool;

    async fn seeded_cache() -> RefCache {
        let pool = setup_test_pool().await;
        sqlx::query(
            "INSERT INTO destinations (channel_id, name, group_id, footer) VALUES \
             (-2001, 'Ukraine', NULL, 'footer-ua'), \
             (-2002, 'Asien', NULL, NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO sources (channel_id, channel_name, destination, is_spread, is_active) \
             VALUES (-1001, 'frontline', -2001, 1, 1)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO bloats (channel_id, pattern) VALUES (-1001, 'Breaking:')")
            .execute(&pool)
            .await
            .unwrap();
        RefCache::new(pool)
    }

    #[tokio::test]
    async fn cold_read_warms_then_serves_from_memory() {
        let cache = seeded_cache().await;
        let source = cache.get_source(-1001).await.unwrap().unwrap();
        assert_eq!(source.display_name, "frontline");

        // Warm load pulled destinations too.
        assert_eq!(cache.get_destinations().await.unwrap().len(), 2);
        let index = cache.destination_index();
        assert_eq!(index.list.len(), 2);
        assert_eq!(index.map.get("ukraine"), Some(&-2001));

        // Delete behind the cache's back; the cached entry still serves.
        sqlx::query("DELETE FROM bloats")
            .execute(&cache.pool)
            .await
            .unwrap();
        sqlx::query("DELETE FROM sources")
            .execute(&cache.pool)
            .await
            .unwrap();
        assert!(cache.get_source(-1001).await.unwrap().is_some());

        cache.invalidate_source(-1001);
        assert!(cache.get_source(-1001).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn miss_after_warm_fetches_individually() {
        let cache = seeded_cache().await;
        cache.warm().await.unwrap();

        sqlx::query(
            "INSERT INTO sources (channel_id, channel_name, is_spread, is_active) \
             VALUES (-1005, 'latecomer', 1, 1)",
        )
        .execute(&cache.pool)
        .await
        .unwrap();

        let source = cache.get_source(-1005).await.unwrap().unwrap();
        assert_eq!(source.display_name, "latecomer");
    }

    #[tokio::test]
    async fn footer_none_is_cached() {
        let cache = seeded_cache().await;
        assert!(cache.get_footer(-2002).await.unwrap().is_none());

        // A footer appearing later is not observed until invalidation: the
        // empty value itself was memoized.
        sqlx::query("UPDATE destinations SET footer = 'late' WHERE channel_id = -2002")
            .execute(&cache.pool)
            .await
            .unwrap();
        assert!(cache.get_footer(-2002).await.unwrap().is_none());

        cache.invalidate_footer(-2002);
        assert_eq!(cache.get_footer(-2002).await.unwrap().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn patterns_memoized_and_refreshable() {
        let cache = seeded_cache().await;
        assert_eq!(cache.get_patterns(-1001).await.unwrap(), vec!["Breaking:"]);

        sqlx::query("INSERT INTO bloats (channel_id, pattern) VALUES (-1001, 'Alert:')")
            .execute(&cache.pool)
            .await
            .unwrap();
        assert_eq!(cache.get_patterns(-1001).await.unwrap().len(), 1);

        cache.refresh_patterns(-1001).await.unwrap();
        assert_eq!(cache.get_patterns(-1001).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn destination_indices_stay_consistent_after_refresh() {
        let cache = seeded_cache().await;
        cache.warm().await.unwrap();

        sqlx::query("INSERT INTO destinations (channel_id, name) VALUES (-2003, 'Afrika')")
            .execute(&cache.pool)
            .await
            .unwrap();
        cache.refresh_destinations().await.unwrap();

        let index = cache.destination_index();
        // Every region is a key in the map and every map id is in the list.
        for region in &index.regions {
            assert!(index.map.contains_key(region));
        }
        for id in index.map.values() {
            assert!(index.list.iter().any(|d| d.channel_id == *id));
        }
        assert_eq!(index.regions.len(), 3);
    }

    #[tokio::test]
    async fn refresh_all_reports_stats() {
        let cache = seeded_cache().await;
        let stats = cache.refresh_all().await.unwrap();
        assert_eq!(
            stats,
            CacheStats {
                sources: 1,
                destinations: 2,
                regions: 2
            }
        );
    }

    #[tokio::test]
    async fn duplicate_window_suppresses_then_expires() {
        let cache = seeded_cache().await;
        let start = Instant::now();

        assert!(!cache.is_duplicate_at(-1001, 5, start));
        assert!(cache.is_duplicate_at(-1001, 5, start + Duration::from_secs(3)));
        // Different message id is independent.
        assert!(!cache.is_duplicate_at(-1001, 6, start + Duration::from_secs(3)));
        // Past the window the entry has been pruned.
        assert!(!cache.is_duplicate_at(-1001, 5, start + Duration::from_secs(14)));
    }
}
