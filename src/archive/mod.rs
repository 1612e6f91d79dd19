//! Tiered rollups of fast-changing data.
//!
//! Every cycle evaluates each (target, metric group, tier) triple. A due
//! tier replaces the raw rows of its window with one averaged row per
//! bucket (and per dictionary id), then advances its watermark. The
//! select, delete, insert and watermark write share one transaction; the
//! in-memory watermark moves only after that transaction commits.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::coerce_row;
use crate::metric::{MetricGroup, MetricGroupId, TargetId, Value};
use crate::repository::sql::{self, FactRow};
use crate::repository::{Executor, Repository, RepositoryError, Transaction};
use crate::state::SharedState;

/// Watermark of a tier that has never run: 2000-01-01T00:00:00Z.
const WATERMARK_EPOCH_SECS: i64 = 946_684_800;

/// One rollup level of a metric group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveTier {
    pub id: i64,
    pub metric_group_id: MetricGroupId,
    /// Minimum age of the data this tier touches.
    pub offset_minutes: u32,
    /// Bucket width.
    pub interval_seconds: u32,
}

impl ArchiveTier {
    pub const fn new(
        id: i64,
        metric_group_id: MetricGroupId,
        offset_minutes: u32,
        interval_seconds: u32,
    ) -> Self {
        Self {
            id,
            metric_group_id,
            offset_minutes,
            interval_seconds,
        }
    }

    pub fn offset(&self) -> Duration {
        Duration::minutes(i64::from(self.offset_minutes))
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(i64::from(self.interval_seconds))
    }

    /// `watermark + offset + interval < now`.
    pub fn is_due(&self, watermark: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        watermark + self.offset() + self.interval() < now
    }

    /// Rounds down to the tier's bucket grid (anchored at the unix epoch).
    pub fn floor(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let interval = i64::from(self.interval_seconds.max(1));
        let secs = t.timestamp();
        Utc.timestamp_opt(secs - secs.rem_euclid(interval), 0)
            .single()
            .unwrap_or(t)
    }

    /// `[from, to)` to archive, given this tier's watermark and the
    /// watermark of the next coarser level.
    pub fn window(
        &self,
        watermark: DateTime<Utc>,
        next_level: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            self.floor(next_level.max(watermark)),
            self.floor(now - self.offset()),
        )
    }
}

pub fn watermark_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(WATERMARK_EPOCH_SECS, 0)
        .single()
        .unwrap_or_default()
}

/// Per (tier, target) archive watermarks.
#[derive(Debug, Default)]
pub struct WatermarkStore {
    marks: DashMap<(i64, TargetId), DateTime<Utc>>,
}

impl WatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watermark of (tier, target), created at the epoch on first use.
    pub fn get(&self, tier_id: i64, target_id: TargetId) -> DateTime<Utc> {
        *self
            .marks
            .entry((tier_id, target_id))
            .or_insert_with(watermark_epoch)
    }

    /// Moves a watermark forward. Returns false if `to` is not later than
    /// the current value.
    pub fn advance(&self, tier_id: i64, target_id: TargetId, to: DateTime<Utc>) -> bool {
        let mut mark = self
            .marks
            .entry((tier_id, target_id))
            .or_insert_with(watermark_epoch);
        if to > *mark {
            *mark = to;
            true
        } else {
            false
        }
    }

    /// Restores persisted watermarks. Returns how many rows were read.
    pub async fn load<E: Executor>(&self, repo: &E) -> Result<usize> {
        let rows = repo
            .query(&sql::select_watermarks())
            .await
            .context("loading archive watermarks")?;

        for row in &rows {
            let (Some(tier_id), Some(target_id), Some(at)) = (
                row.first().and_then(Value::as_i64),
                row.get(1).and_then(Value::as_i64),
                row.get(2).and_then(Value::as_datetime),
            ) else {
                warn!(?row, "skipping malformed watermark row");
                continue;
            };
            self.advance(tier_id, target_id, at);
        }

        Ok(rows.len())
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

/// Result of evaluating one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierOutcome {
    NotDue,
    /// The rollup committed; `rows` averaged rows were written.
    Archived {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        rows: usize,
    },
    /// The data table does not exist yet.
    MissingTable,
}

pub struct Archiver<R: Repository> {
    state: SharedState<R>,
    interval: StdDuration,
}

impl<R: Repository> Archiver<R> {
    pub fn new(state: SharedState<R>, interval: StdDuration) -> Self {
        Self { state, interval }
    }

    /// Runs archive cycles until cancelled or an unexpected error.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval = ?self.interval, "archiver started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("archiver stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if !self.state.supervisor.is_accessible() {
                        debug!("repository inaccessible, skipping archive cycle");
                        continue;
                    }

                    let result = self.run_cycle(Utc::now()).await;
                    if !self.handle_cycle_result(result) {
                        return;
                    }
                }
            }
        }
    }

    /// Returns false when the loop must terminate.
    fn handle_cycle_result(&self, result: Result<usize>) -> bool {
        match result {
            Ok(archived) => {
                if archived > 0 {
                    debug!(archived, "archive cycle complete");
                }
                true
            }
            Err(e) if RepositoryError::is_connectivity(&e) => {
                warn!(error = %e, "archive cycle interrupted");
                self.state.supervisor.set_accessible(false);
                true
            }
            Err(e) => {
                self.state.supervisor.report_failure("archiver", &e);
                false
            }
        }
    }

    /// Evaluates every tier of every archivable schedule once. Returns how
    /// many tiers were archived.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<usize> {
        let catalog = self.state.catalog.load();
        let mut archived = 0;

        for instance in self.state.registry.snapshot() {
            let Some(group) = catalog.group(instance.metric_group_id) else {
                continue;
            };
            if !group.is_archivable() {
                continue;
            }

            for tier in &group.archive_tiers {
                let outcome = self.archive_tier(instance.target_id, &group, tier, now).await?;
                if matches!(outcome, TierOutcome::Archived { .. }) {
                    archived += 1;
                }
            }
        }

        Ok(archived)
    }

    /// Evaluates one (target, group, tier) triple.
    pub async fn archive_tier(
        &self,
        target_id: TargetId,
        group: &MetricGroup,
        tier: &ArchiveTier,
        now: DateTime<Utc>,
    ) -> Result<TierOutcome> {
        let watermarks = &self.state.watermarks;
        let watermark = watermarks.get(tier.id, target_id);

        if !tier.is_due(watermark, now) {
            self.skipped("not_due");
            return Ok(TierOutcome::NotDue);
        }

        let next_level = match group.next_tier(tier) {
            Some(next) => watermarks.get(next.id, target_id),
            None => now - Duration::hours(i64::from(group.schedule.retention_hours)),
        };
        let (from, to) = tier.window(watermark, next_level, now);

        let started = Instant::now();
        let tx = self
            .state
            .repo
            .begin()
            .await
            .context("beginning archive transaction")?;

        let rows = match roll_up(&tx, target_id, group, tier, from, to, now).await {
            Ok(rows) => rows,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "archive rollback failed");
                }
                if RepositoryError::is_missing_object(&e) {
                    debug!(target_id, tier = tier.id, "no data table yet, nothing to archive");
                    self.skipped("missing_table");
                    return Ok(TierOutcome::MissingTable);
                }
                if let Some(health) = &self.state.health {
                    health.archive_errors.inc();
                }
                return Err(e.context(format!(
                    "archiving tier {} of target {target_id}",
                    tier.id
                )));
            }
        };

        tx.commit().await.context("committing archive transaction")?;
        watermarks.advance(tier.id, target_id, to);

        if let Some(health) = &self.state.health {
            health.archive_rollups.inc();
            health
                .archive_duration
                .observe(started.elapsed().as_secs_f64());
        }

        info!(
            target_id,
            group = %group.name,
            tier = tier.id,
            %from,
            %to,
            rows,
            "tier archived"
        );

        Ok(TierOutcome::Archived { from, to, rows })
    }

    fn skipped(&self, reason: &str) {
        if let Some(health) = &self.state.health {
            health.archive_skips.with_label_values(&[reason]).inc();
        }
    }
}

/// Replaces the raw rows of `[from, to)` with bucket averages stamped at
/// the bucket midpoint, then records the new watermark.
async fn roll_up<E: Executor>(
    tx: &E,
    target_id: TargetId,
    group: &MetricGroup,
    tier: &ArchiveTier,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut facts = Vec::new();

    if from < to {
        let rows = tx
            .query(&sql::select_rollup(
                target_id,
                group,
                tier.interval_seconds,
                from,
                to,
            ))
            .await
            .context("selecting rollup")?;

        let half = Duration::seconds(i64::from(tier.interval_seconds / 2));
        let metric_start = if group.multi_row { 2 } else { 1 };

        for row in &rows {
            let bucket = row
                .first()
                .and_then(Value::as_datetime)
                .ok_or_else(|| anyhow!("rollup row has no bucket"))?;
            let dict_id = if group.multi_row {
                Some(
                    row.get(1)
                        .and_then(Value::as_i64)
                        .ok_or_else(|| anyhow!("rollup row has no dictId"))?,
                )
            } else {
                None
            };
            facts.push(FactRow {
                dt: bucket + half,
                dict_id,
                metrics: coerce_row(row, metric_start, &group.metric_columns)?,
            });
        }

        tx.execute(&sql::delete_range(target_id, group, from, to))
            .await
            .context("deleting archived range")?;

        if let Some(insert) = sql::insert_facts(target_id, group, &facts) {
            tx.execute(&insert).await.context("inserting rollup rows")?;
        }
    }

    tx.execute(&sql::insert_watermark(tier.id, target_id, to, now))
        .await
        .context("writing watermark")?;

    Ok(facts.len())
}
