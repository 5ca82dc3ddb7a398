//! Run-scoped High Court / Bench lookup table.
//!
//! Reads are served from moka caches; a court's benches are discovered at
//! most once per run unless a refresh is requested. Refreshes are serialized:
//! one in flight at a time, and a caller that waited behind a refresh of the
//! same court which has since completed joins that result instead of
//! navigating again.

use moka::future::Cache;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::navigation;
use crate::core::types::{Bench, HighCourt};
use crate::core::{PortalConfig, PortalError, PortalResult};
use crate::scraping::PortalDriver;

pub struct Topology {
    cfg: Arc<PortalConfig>,
    courts: Cache<(), Arc<Vec<HighCourt>>>,
    benches: Cache<String, Arc<Vec<Bench>>>,
    /// Generation at which each court was last re-listed. Held for the
    /// whole refresh, so it doubles as the single-writer lock.
    refreshed: Mutex<HashMap<String, u64>>,
    generation: AtomicU64,
    refreshes: AtomicU64,
}

/// Listing pages that do not render in time mean the portal is down, not
/// that the caller should retry. Applied only at the public discovery entry
/// points; the search pipeline sees the raw timeout and may restart.
fn unavailable(e: PortalError) -> PortalError {
    match e {
        PortalError::Timeout { what, timeout_ms } => PortalError::PortalUnavailable(format!(
            "{} did not render within {}ms",
            what, timeout_ms
        )),
        other => other,
    }
}

impl Topology {
    pub fn new(cfg: Arc<PortalConfig>) -> Self {
        Self {
            cfg,
            courts: Cache::builder().max_capacity(1).build(),
            benches: Cache::builder().max_capacity(256).build(),
            refreshed: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Bumped by every completed refresh, whichever court it covered.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Refreshes that actually navigated the portal.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Acquire)
    }

    async fn fetch_courts(&self, portal: &mut dyn PortalDriver) -> PortalResult<Vec<HighCourt>> {
        navigation::open_search_form(portal, &self.cfg).await?;
        let courts = navigation::court_options(portal, &self.cfg).await?;
        info!("Enumerated {} high courts", courts.len());
        Ok(courts)
    }

    async fn fetch_benches(&self, portal: &mut dyn PortalDriver, court_id: &str) -> PortalResult<Vec<Bench>> {
        navigation::open_search_form(portal, &self.cfg).await?;
        navigation::select_court(portal, &self.cfg, court_id).await?;
        let benches = navigation::bench_options(portal, &self.cfg, court_id).await?;
        info!("Found {} benches for court value {}", benches.len(), court_id);
        Ok(benches)
    }

    async fn courts(&self, portal: &mut dyn PortalDriver) -> PortalResult<Arc<Vec<HighCourt>>> {
        self.courts
            .try_get_with((), async { self.fetch_courts(portal).await.map(Arc::new) })
            .await
            .map_err(|e| (*e).clone())
    }

    async fn benches(&self, portal: &mut dyn PortalDriver, court_id: &str) -> PortalResult<Arc<Vec<Bench>>> {
        self.benches
            .try_get_with(court_id.to_string(), async {
                self.fetch_benches(portal, court_id).await.map(Arc::new)
            })
            .await
            .map_err(|e| (*e).clone())
    }

    /// Courts in dropdown order. Cached for the run.
    pub async fn discover_courts(&self, portal: &mut dyn PortalDriver) -> PortalResult<Arc<Vec<HighCourt>>> {
        self.courts(portal).await.map_err(unavailable)
    }

    /// Benches of one court in dropdown order. Cached per court for the run.
    pub async fn discover_benches(
        &self,
        portal: &mut dyn PortalDriver,
        court_id: &str,
    ) -> PortalResult<Arc<Vec<Bench>>> {
        self.benches(portal, court_id).await.map_err(unavailable)
    }

    /// Cached-only lookup; `None` when the court has not been discovered.
    pub async fn cached_benches(&self, court_id: &str) -> Option<Arc<Vec<Bench>>> {
        self.benches.get(court_id).await
    }

    pub async fn has_bench(&self, portal: &mut dyn PortalDriver, court_id: &str, bench_id: &str) -> PortalResult<bool> {
        let courts = self.courts(portal).await?;
        if !courts.iter().any(|c| c.id == court_id) {
            return Ok(false);
        }
        let benches = self.benches(portal, court_id).await?;
        Ok(benches.iter().any(|b| b.id == bench_id))
    }

    /// Re-read the court list and `court_id`'s benches from the portal.
    ///
    /// `seen_generation` is the generation the caller observed before deciding
    /// its view was stale. If a refresh of the same court finished since then,
    /// this returns immediately with the current generation. A refresh of some
    /// other court does not count.
    pub async fn refresh(
        &self,
        portal: &mut dyn PortalDriver,
        court_id: &str,
        seen_generation: u64,
    ) -> PortalResult<u64> {
        let mut refreshed = self.refreshed.lock().await;

        if let Some(&at) = refreshed.get(court_id) {
            if at > seen_generation {
                info!(court = court_id, generation = at, "topology: joined completed refresh");
                return Ok(self.generation());
            }
        }

        warn!(court = court_id, "topology: refreshing stale court/bench listing");
        let courts = self.fetch_courts(portal).await?;
        let court_known = courts.iter().any(|c| c.id == court_id);
        self.courts.insert((), Arc::new(courts)).await;

        if court_known {
            let benches = self.fetch_benches(portal, court_id).await?;
            self.benches.insert(court_id.to_string(), Arc::new(benches)).await;
        } else {
            self.benches.invalidate(court_id).await;
        }

        self.refreshes.fetch_add(1, Ordering::AcqRel);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        refreshed.insert(court_id.to_string(), generation);
        Ok(generation)
    }

    /// Every court with its benches, for `--discover`.
    pub async fn discover_all(
        &self,
        portal: &mut dyn PortalDriver,
    ) -> PortalResult<Vec<(HighCourt, Arc<Vec<Bench>>)>> {
        let courts = self.discover_courts(portal).await?;
        let mut out = Vec::with_capacity(courts.len());
        for court in courts.iter() {
            match self.discover_benches(portal, &court.id).await {
                Ok(benches) => out.push((court.clone(), benches)),
                Err(e) => {
                    warn!("Failed to enumerate benches for {}: {}", court.name, e);
                    out.push((court.clone(), Arc::new(Vec::new())));
                }
            }
        }
        Ok(out)
    }
}
