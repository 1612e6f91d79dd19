//! Schedule registry and due queue.
//!
//! Holds one [`InstanceSchedule`] per (target, metric group) pair and at
//! most one pending due entry per instance. Fire times sit on a fixed grid
//! anchored at the schedule's offset from midnight (UTC), independent of
//! when the entry was registered or rescheduled.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use dashmap::DashMap;

use crate::metric::{MetricGroupId, TargetId};

/// Identifier of an instance schedule.
pub type InstanceId = i64;

/// Sampling cadence of a metric group on one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Offset of the grid from midnight, in seconds.
    pub offset_seconds: u32,
    /// Sampling period, in seconds. Never zero.
    pub interval_seconds: u32,
    /// How long raw data is kept, in hours.
    pub retention_hours: u32,
}

impl Schedule {
    pub const fn new(offset_seconds: u32, interval_seconds: u32, retention_hours: u32) -> Self {
        Self {
            offset_seconds,
            interval_seconds,
            retention_hours,
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::hours(i64::from(self.retention_hours))
    }

    /// Next fire time strictly after `now`.
    ///
    /// Computed from whole seconds since midnight, so a fire time past the
    /// end of the day lands on the next day without any date comparison.
    pub fn next_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let midnight = now.date_naive().and_time(NaiveTime::MIN);
        let midnight = Utc.from_utc_datetime(&midnight);
        let t = (now - midnight).num_seconds();
        let next = next_fire_second(
            i64::from(self.offset_seconds),
            i64::from(self.interval_seconds.max(1)),
            t,
        );
        midnight + Duration::seconds(next)
    }
}

/// Next grid point `(k + 1) * interval + offset` after time-of-day `t`,
/// where `k` is the number of whole intervals elapsed since the offset.
/// May exceed one day.
pub fn next_fire_second(offset: i64, interval: i64, t: i64) -> i64 {
    let k = (t - offset).div_euclid(interval);
    (k + 1) * interval + offset
}

/// Per (target, metric group) schedule with its mutable timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSchedule {
    pub id: InstanceId,
    pub target_id: TargetId,
    pub metric_group_id: MetricGroupId,
    pub schedule: Schedule,
    pub last_polled: DateTime<Utc>,
    pub last_purged: DateTime<Utc>,
}

/// Timestamp used for "never polled" / "never purged".
pub fn never() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A pending fire of one instance schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueEntry {
    pub fire_time: DateTime<Utc>,
    pub instance_id: InstanceId,
}

/// Concurrent registry of instance schedules and their due entries.
///
/// Every map is independently sharded; no operation takes a global lock.
pub struct ScheduleRegistry {
    instances: DashMap<InstanceId, InstanceSchedule>,
    pairs: DashMap<(TargetId, MetricGroupId), InstanceId>,
    due: DashMap<InstanceId, DateTime<Utc>>,
    next_id: AtomicI64,
}

impl Default for ScheduleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduleRegistry {
    pub fn new() -> Self {
        Self {
            instances: DashMap::with_capacity(64),
            pairs: DashMap::with_capacity(64),
            due: DashMap::with_capacity(64),
            next_id: AtomicI64::new(1),
        }
    }

    /// Registers a (target, metric group) pair and queues its first fire.
    pub fn register(
        &self,
        target_id: TargetId,
        metric_group_id: MetricGroupId,
        schedule: Schedule,
    ) -> InstanceId {
        self.register_at(target_id, metric_group_id, schedule, Utc::now())
    }

    /// Like [`register`](Self::register) with an explicit clock reading.
    ///
    /// Registering a known pair keeps its id and replaces its schedule.
    pub fn register_at(
        &self,
        target_id: TargetId,
        metric_group_id: MetricGroupId,
        schedule: Schedule,
        now: DateTime<Utc>,
    ) -> InstanceId {
        let pair = self.pairs.entry((target_id, metric_group_id)).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.instances.insert(
                id,
                InstanceSchedule {
                    id,
                    target_id,
                    metric_group_id,
                    schedule,
                    last_polled: never(),
                    last_purged: never(),
                },
            );
            id
        });
        let id = *pair;
        drop(pair);

        if let Some(mut instance) = self.instances.get_mut(&id) {
            if instance.schedule != schedule {
                instance.schedule = schedule;
                self.due.remove(&id);
            }
        }

        self.reschedule_at(id, now);
        id
    }

    /// Removes an instance schedule and its pending due entry.
    pub fn deregister(&self, id: InstanceId) -> Option<InstanceSchedule> {
        let (_, instance) = self.instances.remove(&id)?;
        self.pairs
            .remove_if(&(instance.target_id, instance.metric_group_id), |_, v| *v == id);
        self.due.remove(&id);
        Some(instance)
    }

    /// Removes every schedule of a target. Returns how many were removed.
    pub fn deregister_target(&self, target_id: TargetId) -> usize {
        let ids: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|entry| entry.target_id == target_id)
            .map(|entry| entry.id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.deregister(id))
            .count()
    }

    /// Due entries with a fire time at or before `now`, earliest first.
    pub fn due_before(&self, now: DateTime<Utc>) -> Vec<DueEntry> {
        let mut entries: Vec<DueEntry> = self
            .due
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| DueEntry {
                fire_time: *entry.value(),
                instance_id: *entry.key(),
            })
            .collect();
        entries.sort_by_key(|e| (e.fire_time, e.instance_id));
        entries
    }

    /// Queues the next fire of an instance. Idempotent.
    ///
    /// Returns false if the instance is not registered.
    pub fn reschedule(&self, id: InstanceId) -> bool {
        self.reschedule_at(id, Utc::now())
    }

    pub fn reschedule_at(&self, id: InstanceId, now: DateTime<Utc>) -> bool {
        let Some(schedule) = self.instances.get(&id).map(|i| i.schedule) else {
            return false;
        };
        self.due.entry(id).or_insert_with(|| schedule.next_fire(now));
        true
    }

    /// Clears the pending due entry of an instance, returning its fire time.
    pub fn take_due(&self, id: InstanceId) -> Option<DateTime<Utc>> {
        self.due.remove(&id).map(|(_, t)| t)
    }

    /// Pending fire time of an instance.
    pub fn pending(&self, id: InstanceId) -> Option<DateTime<Utc>> {
        self.due.get(&id).map(|t| *t)
    }

    pub fn mark_polled(&self, id: InstanceId, at: DateTime<Utc>) -> bool {
        match self.instances.get_mut(&id) {
            Some(mut instance) => {
                instance.last_polled = at;
                true
            }
            None => false,
        }
    }

    pub fn mark_purged(&self, id: InstanceId, at: DateTime<Utc>) -> bool {
        match self.instances.get_mut(&id) {
            Some(mut instance) => {
                instance.last_purged = at;
                true
            }
            None => false,
        }
    }

    /// Restores persisted timestamps for a registered pair.
    pub fn restore(
        &self,
        target_id: TargetId,
        metric_group_id: MetricGroupId,
        last_polled: DateTime<Utc>,
        last_purged: DateTime<Utc>,
    ) -> bool {
        let Some(id) = self.instance_for(target_id, metric_group_id) else {
            return false;
        };
        match self.instances.get_mut(&id) {
            Some(mut instance) => {
                instance.last_polled = instance.last_polled.max(last_polled);
                instance.last_purged = instance.last_purged.max(last_purged);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: InstanceId) -> Option<InstanceSchedule> {
        self.instances.get(&id).map(|i| i.clone())
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    pub fn instance_for(
        &self,
        target_id: TargetId,
        metric_group_id: MetricGroupId,
    ) -> Option<InstanceId> {
        self.pairs.get(&(target_id, metric_group_id)).map(|id| *id)
    }

    /// Consistent-per-entry copy of every instance schedule, ordered by id.
    pub fn snapshot(&self) -> Vec<InstanceSchedule> {
        let mut all: Vec<InstanceSchedule> =
            self.instances.iter().map(|entry| entry.clone()).collect();
        all.sort_by_key(|i| i.id);
        all
    }

    /// Most recent poll across all schedules of a target.
    pub fn last_poll(&self, target_id: TargetId) -> Option<DateTime<Utc>> {
        self.instances
            .iter()
            .filter(|entry| entry.target_id == target_id)
            .map(|entry| entry.last_polled)
            .max()
    }

    /// (instance, last purged) for every schedule.
    pub fn purge_candidates(&self) -> Vec<(InstanceId, DateTime<Utc>)> {
        let mut all: Vec<(InstanceId, DateTime<Utc>)> = self
            .instances
            .iter()
            .map(|entry| (entry.id, entry.last_purged))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.due.len()
    }
}
