//! Retention purging, one schedule at a time.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PurgerConfig;
use crate::metric::{ChangeSpeed, MetricGroup};
use crate::repository::{sql, Repository, RepositoryError};
use crate::schedule::InstanceSchedule;
use crate::state::SharedState;

pub struct Purger<R: Repository> {
    state: SharedState<R>,
    cfg: PurgerConfig,
}

impl<R: Repository> Purger<R> {
    pub fn new(state: SharedState<R>, cfg: PurgerConfig) -> Self {
        Self { state, cfg }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval = ?self.cfg.interval,
            purge_interval = ?self.cfg.purge_interval,
            "purger started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("purger stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if !self.state.supervisor.is_accessible() {
                        debug!("repository inaccessible, skipping purge cycle");
                        continue;
                    }

                    match self.run_cycle(Utc::now(), &cancel).await {
                        Ok(purged) => {
                            if purged > 0 {
                                debug!(purged, "purge cycle complete");
                            }
                        }
                        Err(e) if RepositoryError::is_connectivity(&e) => {
                            warn!(error = %e, "purge cycle interrupted");
                            self.state.supervisor.set_accessible(false);
                        }
                        Err(e) => {
                            self.state.supervisor.report_failure("purger", &e);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Purges every schedule whose last purge is older than the purge
    /// interval, pausing between schedules. Returns how many were purged.
    pub async fn run_cycle(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let registry = &self.state.registry;
        let catalog = self.state.catalog.load();
        let purge_interval = Duration::from_std(self.cfg.purge_interval)
            .context("purge interval out of range")?;
        let mut purged = 0;

        for (id, last_purged) in registry.purge_candidates() {
            if now - last_purged < purge_interval {
                continue;
            }

            let Some(instance) = registry.get(id) else {
                continue;
            };
            let Some(group) = catalog.group(instance.metric_group_id) else {
                continue;
            };
            if group.change_speed == ChangeSpeed::Static {
                continue;
            }

            if self.purge_one(&instance, &group, now).await? {
                purged += 1;
            }

            if !self.pause(cancel).await {
                break;
            }
        }

        Ok(purged)
    }

    /// Deletes the expired rows of one schedule and records the purge.
    /// Returns false if the data table does not exist yet.
    async fn purge_one(
        &self,
        instance: &InstanceSchedule,
        group: &MetricGroup,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let repo = &*self.state.repo;
        let cutoff = now - Duration::hours(i64::from(instance.schedule.retention_hours));
        let statement = sql::purge(instance.target_id, group, cutoff);

        let deleted = match repo.execute(&statement).await {
            Ok(()) => true,
            Err(e) if RepositoryError::is_missing_object(&e) => {
                debug!(target_id = instance.target_id, group = %group.name, "no data table yet");
                false
            }
            Err(e) => {
                if let Some(health) = &self.state.health {
                    health.purge_errors.inc();
                }
                return Err(e.context(format!(
                    "purging {} of target {}",
                    group.name, instance.target_id
                )));
            }
        };

        self.state.registry.mark_purged(instance.id, now);
        repo.execute(&sql::insert_schedule_state(
            instance.target_id,
            instance.metric_group_id,
            instance.last_polled,
            now,
            now,
        ))
        .await
        .context("recording purge time")?;

        if deleted {
            if let Some(health) = &self.state.health {
                health.purge_runs.inc();
            }
            debug!(
                target_id = instance.target_id,
                group = %group.name,
                %cutoff,
                "expired rows purged"
            );
        }

        Ok(deleted)
    }

    /// Sleeps between schedules. Returns false if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        if self.cfg.pause.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.cfg.pause) => true,
        }
    }
}
