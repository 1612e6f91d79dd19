use std::sync::Arc;

use crate::archive::WatermarkStore;
use crate::cache::CacheRegistry;
use crate::catalog::{Catalog, SharedCatalog};
use crate::health::HealthMetrics;
use crate::repository::Repository;
use crate::schedule::ScheduleRegistry;
use crate::supervisor::Supervisor;

/// Shared structures injected into every long-lived loop.
pub struct SharedState<R: Repository> {
    pub repo: Arc<R>,
    pub catalog: Arc<SharedCatalog>,
    pub registry: Arc<ScheduleRegistry>,
    pub caches: Arc<CacheRegistry>,
    pub watermarks: Arc<WatermarkStore>,
    pub supervisor: Arc<Supervisor>,
    pub health: Option<Arc<HealthMetrics>>,
}

impl<R: Repository> SharedState<R> {
    pub fn new(repo: Arc<R>, catalog: Catalog, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            repo,
            catalog: Arc::new(SharedCatalog::new(catalog)),
            registry: Arc::new(ScheduleRegistry::new()),
            caches: Arc::new(CacheRegistry::new()),
            watermarks: Arc::new(WatermarkStore::new()),
            supervisor: Arc::new(Supervisor::new(health.clone())),
            health,
        }
    }
}

impl<R: Repository> Clone for SharedState<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            catalog: Arc::clone(&self.catalog),
            registry: Arc::clone(&self.registry),
            caches: Arc::clone(&self.caches),
            watermarks: Arc::clone(&self.watermarks),
            supervisor: Arc::clone(&self.supervisor),
            health: self.health.clone(),
        }
    }
}
