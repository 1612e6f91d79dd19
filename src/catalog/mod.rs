//! Configured targets and metric groups.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::metric::{MetricGroup, MetricGroupId, TargetId};

/// A monitored system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    /// Base URL the HTTP probe appends metric-group queries to.
    pub endpoint: String,
    pub metric_groups: Vec<MetricGroupId>,
}

/// Immutable snapshot of targets and metric groups.
#[derive(Debug, Default)]
pub struct Catalog {
    targets: HashMap<TargetId, Arc<Target>>,
    groups: HashMap<MetricGroupId, Arc<MetricGroup>>,
}

impl Catalog {
    pub fn new(targets: Vec<Target>, groups: Vec<MetricGroup>) -> Self {
        Self {
            targets: targets.into_iter().map(|t| (t.id, Arc::new(t))).collect(),
            groups: groups.into_iter().map(|g| (g.id, Arc::new(g))).collect(),
        }
    }

    pub fn target(&self, id: TargetId) -> Option<Arc<Target>> {
        self.targets.get(&id).cloned()
    }

    pub fn target_ids(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.targets.keys().copied()
    }

    pub fn group(&self, id: MetricGroupId) -> Option<Arc<MetricGroup>> {
        self.groups.get(&id).cloned()
    }

    /// Every configured (target, metric group) pair, ordered by ids.
    pub fn pairs(&self) -> Vec<(Arc<Target>, Arc<MetricGroup>)> {
        let mut pairs: Vec<(Arc<Target>, Arc<MetricGroup>)> = self
            .targets
            .values()
            .flat_map(|target| {
                target
                    .metric_groups
                    .iter()
                    .filter_map(|id| self.groups.get(id))
                    .map(|group| (Arc::clone(target), Arc::clone(group)))
            })
            .collect();
        pairs.sort_by_key(|(t, g)| (t.id, g.id));
        pairs
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Catalog behind an atomic reference. Reload replaces it whole.
pub struct SharedCatalog {
    inner: ArcSwap<Catalog>,
}

impl SharedCatalog {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            inner: ArcSwap::from_pointee(catalog),
        }
    }

    pub fn load(&self) -> Arc<Catalog> {
        self.inner.load_full()
    }

    /// Swaps in a new catalog, returning the previous one.
    pub fn store(&self, catalog: Catalog) -> Arc<Catalog> {
        self.inner.swap(Arc::new(catalog))
    }
}
