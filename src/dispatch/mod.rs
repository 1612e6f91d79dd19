//! Dispatcher: turns due entries into running probes.
//!
//! Each tick launches a probe for every due entry, up to
//! `dispatcher.max_in_flight` concurrent probes. Entries that find the pool
//! full stay queued for the next tick. Completions are reaped as they
//! finish: results go to the write queue and the instance is rescheduled.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::metric::TargetId;
use crate::probe::{Probe, ProbeError};
use crate::repository::Repository;
use crate::schedule::InstanceId;
use crate::state::SharedState;
use crate::writer::ProbeMessage;

/// Output of one probe task.
#[derive(Debug)]
pub struct Completion {
    pub instance_id: InstanceId,
    pub target_id: TargetId,
    pub message: Result<ProbeMessage, ProbeError>,
}

/// Running probe tasks.
#[derive(Default)]
pub struct InFlight {
    tasks: JoinSet<Completion>,
    ids: HashMap<task::Id, (InstanceId, TargetId)>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for the next probe task to finish.
    pub async fn join_next(&mut self) -> Option<Result<Completion, JoinError>> {
        self.tasks.join_next().await
    }
}

pub struct Dispatcher<R: Repository, P: Probe> {
    state: SharedState<R>,
    probe: Arc<P>,
    queue: mpsc::Sender<ProbeMessage>,
    permits: Arc<Semaphore>,
    cfg: DispatcherConfig,
}

impl<R: Repository, P: Probe> Dispatcher<R, P> {
    pub fn new(
        state: SharedState<R>,
        probe: Arc<P>,
        queue: mpsc::Sender<ProbeMessage>,
        cfg: DispatcherConfig,
    ) -> Self {
        Self {
            state,
            probe,
            queue,
            permits: Arc::new(Semaphore::new(cfg.max_in_flight.max(1))),
            cfg,
        }
    }

    /// Runs until cancelled. In-flight probes are abandoned on stop.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut in_flight = InFlight::new();

        info!(
            tick = ?self.cfg.tick,
            max_in_flight = self.cfg.max_in_flight,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(abandoned = in_flight.len(), "dispatcher stopped");
                    return;
                }
                Some(joined) = in_flight.tasks.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = self.complete(&mut in_flight, joined, Utc::now()) {
                        self.state.supervisor.report_failure("dispatcher", &e);
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.launch_due(&mut in_flight, Utc::now());
                }
            }
        }
    }

    /// Launches a probe for every entry due at `now` (plus the configured
    /// fire tolerance). Returns how many were launched.
    pub fn launch_due(&self, in_flight: &mut InFlight, now: DateTime<Utc>) -> usize {
        let registry = &self.state.registry;
        let catalog = self.state.catalog.load();
        let tolerance =
            Duration::from_std(self.cfg.fire_tolerance).unwrap_or_else(|_| Duration::zero());
        let mut launched = 0;

        for entry in registry.due_before(now + tolerance) {
            let id = entry.instance_id;
            let Some(instance) = registry.get(id) else {
                registry.take_due(id);
                continue;
            };

            let Some(target) = catalog.target(instance.target_id) else {
                let removed = registry.deregister_target(instance.target_id);
                warn!(
                    target_id = instance.target_id,
                    removed,
                    "unknown target, schedules removed"
                );
                continue;
            };

            let group = catalog
                .group(instance.metric_group_id)
                .filter(|_| target.metric_groups.contains(&instance.metric_group_id));
            let Some(group) = group else {
                registry.deregister(id);
                warn!(
                    target_id = instance.target_id,
                    group_id = instance.metric_group_id,
                    "unknown metric group, schedule removed"
                );
                continue;
            };

            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                debug!(pending = registry.pending_len(), "probe pool saturated, deferring");
                break;
            };

            registry.take_due(id);

            let probe = Arc::clone(&self.probe);
            let target_id = instance.target_id;
            let handle = in_flight.tasks.spawn(async move {
                let _permit = permit;
                let message = probe
                    .probe(id, &target, &group)
                    .await
                    .map(|result_set| ProbeMessage {
                        instance_id: id,
                        target_id,
                        metric_group: group,
                        result_set,
                    });
                Completion {
                    instance_id: id,
                    target_id,
                    message,
                }
            });
            in_flight.ids.insert(handle.id(), (id, target_id));

            debug!(instance_id = id, target_id, fire_time = %entry.fire_time, "probe launched");
            launched += 1;
        }

        if let Some(health) = &self.state.health {
            health.probes_launched.inc_by(launched as f64);
            health.probes_in_flight.set(in_flight.len() as f64);
            health.schedules_registered.set(registry.len() as f64);
        }

        launched
    }

    /// Handles one finished probe task. Fails only when the write queue is
    /// closed.
    pub fn complete(
        &self,
        in_flight: &mut InFlight,
        joined: Result<Completion, JoinError>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let registry = &self.state.registry;

        let (instance_id, target_id, message) = match joined {
            Ok(completion) => {
                in_flight.ids.retain(|_, (id, _)| *id != completion.instance_id);
                (completion.instance_id, completion.target_id, completion.message)
            }
            Err(e) => {
                let Some((instance_id, target_id)) = in_flight.ids.remove(&e.id()) else {
                    warn!(error = %e, "untracked probe task failed");
                    return Ok(());
                };
                let kind = if e.is_panic() { "panic" } else { "cancelled" };
                self.probe_failed(instance_id, target_id, kind, &e.to_string());
                self.reschedule(instance_id, target_id, now);
                return Ok(());
            }
        };

        match message {
            Ok(message) => {
                let probed_at = message.result_set.probed_at;
                match self.queue.try_send(message) {
                    Ok(()) => {
                        registry.mark_polled(instance_id, probed_at);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(instance_id, target_id, "write queue full, dropping sample");
                        if let Some(health) = &self.state.health {
                            health.samples_dropped.with_label_values(&["queue_full"]).inc();
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        bail!("write queue closed");
                    }
                }
            }
            Err(e) => self.probe_failed(instance_id, target_id, e.kind(), &e.to_string()),
        }

        self.reschedule(instance_id, target_id, now);

        if let Some(health) = &self.state.health {
            health.probes_in_flight.set(in_flight.len() as f64);
        }

        Ok(())
    }

    /// Queues the next fire. An instance deregistered while its probe ran
    /// stays gone; the rest of its target's schedules are removed only when
    /// the target itself has left the catalog.
    fn reschedule(&self, instance_id: InstanceId, target_id: TargetId, now: DateTime<Utc>) {
        let registry = &self.state.registry;
        if registry.reschedule_at(instance_id, now) {
            return;
        }
        if self.state.catalog.load().target(target_id).is_some() {
            debug!(instance_id, target_id, "instance gone, not rescheduled");
            return;
        }
        let removed = registry.deregister_target(target_id);
        debug!(instance_id, target_id, removed, "target gone, schedules removed");
    }

    fn probe_failed(&self, instance_id: InstanceId, target_id: TargetId, kind: &str, error: &str) {
        warn!(instance_id, target_id, kind, error, "probe failed");
        if let Some(health) = &self.state.health {
            health.probe_failures.with_label_values(&[kind]).inc();
        }
    }
}
