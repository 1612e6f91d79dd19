//! Component-failure reporting and the shared repository-accessibility flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::health::HealthMetrics;
use crate::repository::Repository;

/// A long-lived loop that terminated on an unexpected error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentFailure {
    pub component: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

pub struct Supervisor {
    accessible: AtomicBool,
    failures: parking_lot::Mutex<Vec<ComponentFailure>>,
    health: Option<Arc<HealthMetrics>>,
}

impl Supervisor {
    pub fn new(health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            accessible: AtomicBool::new(true),
            failures: parking_lot::Mutex::new(Vec::new()),
            health,
        }
    }

    /// Records that `component` stopped because of `err`. The component is
    /// not restarted.
    pub fn report_failure(&self, component: &str, err: &anyhow::Error) {
        error!(component, error = %format!("{err:#}"), "component failed");

        if let Some(health) = &self.health {
            health
                .component_failures
                .with_label_values(&[component])
                .inc();
        }

        self.failures.lock().push(ComponentFailure {
            component: component.to_string(),
            error: format!("{err:#}"),
            at: Utc::now(),
        });
    }

    /// Failures recorded so far, oldest first.
    pub fn failures(&self) -> Vec<ComponentFailure> {
        self.failures.lock().clone()
    }

    pub fn is_accessible(&self) -> bool {
        self.accessible.load(Ordering::Acquire)
    }

    /// Flips the accessibility flag, logging transitions only.
    pub fn set_accessible(&self, accessible: bool) {
        let previous = self.accessible.swap(accessible, Ordering::AcqRel);
        if previous == accessible {
            return;
        }

        if accessible {
            info!("repository reachable again");
        } else {
            warn!("repository unreachable, pausing repository work");
        }

        if let Some(health) = &self.health {
            health
                .repository_accessible
                .set(if accessible { 1.0 } else { 0.0 });
        }
    }

    /// Pings the repository every `interval` while it is marked
    /// inaccessible, and marks it accessible once a ping succeeds.
    pub async fn watch<R: Repository>(
        &self,
        repo: Arc<R>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if self.is_accessible() {
                        continue;
                    }
                    match repo.ping().await {
                        Ok(()) => self.set_accessible(true),
                        Err(e) => warn!(error = %e, "repository still unreachable"),
                    }
                }
            }
        }
    }
}
