use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::Archiver;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::health::api::ReadApi;
use crate::health::HealthMetrics;
use crate::migrate::Migrator;
use crate::probe::http::HttpProbe;
use crate::probe::Probe;
use crate::purge::Purger;
use crate::repository::{sql, ClickHouseRepository, Repository, RepositoryError};
use crate::state::SharedState;
use crate::writer::Writer;

/// Result of matching the schedule registry to a catalog.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSync {
    pub registered: usize,
    pub removed: usize,
}

/// Agent orchestrates all loops: dispatcher, writer, archiver, purger and
/// the repository watchdog.
pub struct Agent<R: Repository, P: Probe> {
    cfg: Config,
    state: SharedState<R>,
    probe: Arc<P>,
    health: Arc<HealthMetrics>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl Agent<ClickHouseRepository, HttpProbe> {
    /// Builds an agent backed by ClickHouse and the HTTP probe.
    pub fn from_config(cfg: Config) -> Result<Self> {
        let repo = Arc::new(ClickHouseRepository::new(cfg.repository.clone()));
        let probe = Arc::new(HttpProbe::new(&cfg.probe).context("creating HTTP probe")?);
        Self::new(cfg, repo, probe)
    }
}

impl<R: Repository, P: Probe> Agent<R, P> {
    /// Creates a new Agent, initializing health metrics and shared state.
    pub fn new(cfg: Config, repo: Arc<R>, probe: Arc<P>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let state = SharedState::new(repo, cfg.catalog(), Some(Arc::clone(&health)));

        Ok(Self {
            cfg,
            state,
            probe,
            health,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> &SharedState<R> {
        &self.state
    }

    /// Start all components and begin sampling.
    pub async fn start(&mut self) -> Result<()> {
        // Health server first so probes respond during migrations.
        let api = Arc::new(ReadApi::new(
            Arc::clone(&self.state.catalog),
            Arc::clone(&self.state.caches),
        ));
        self.health
            .start(Some(api))
            .await
            .context("starting health metrics server")?;

        if self.cfg.repository.migrations.enabled {
            info!("running repository migrations");
            Migrator::new(&*self.state.repo)
                .up()
                .await
                .context("applying repository migrations")?;
        }

        let catalog = self.state.catalog.load();
        let sync = self.sync_schedules(&catalog, Utc::now());
        info!(
            targets = catalog.target_count(),
            metric_groups = catalog.group_count(),
            schedules = sync.registered,
            "schedules registered"
        );

        self.restore_state().await;
        self.spawn_loops();

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components. The writer drains its queue before
    /// schedule state is persisted.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "agent task ended abnormally");
            }
        }

        if let Err(e) = self.persist_schedule_state(Utc::now()).await {
            warn!(error = %e, "persisting schedule state failed");
        }

        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }

    /// Swaps in the catalog of `cfg` and registers or removes schedules to
    /// match it. Loop settings keep the values they were started with.
    pub fn reload(&mut self, cfg: Config) -> Result<ScheduleSync> {
        cfg.validate().context("validating reloaded configuration")?;

        let previous = self.state.catalog.store(cfg.catalog());
        let catalog = self.state.catalog.load();
        let sync = self.sync_schedules(&catalog, Utc::now());

        for target_id in previous.target_ids() {
            if catalog.target(target_id).is_none() {
                self.state.caches.remove_target(target_id);
                debug!(target_id, "target removed, caches evicted");
            }
        }

        self.cfg.metric_groups = cfg.metric_groups;
        self.cfg.targets = cfg.targets;

        info!(
            targets = catalog.target_count(),
            metric_groups = catalog.group_count(),
            registered = sync.registered,
            removed = sync.removed,
            "configuration reloaded"
        );

        Ok(sync)
    }

    /// Registers every (target, metric group) pair of `catalog` and removes
    /// schedules whose pair is gone.
    pub fn sync_schedules(&self, catalog: &Catalog, now: DateTime<Utc>) -> ScheduleSync {
        let registry = &self.state.registry;
        let mut live = HashSet::new();
        let mut sync = ScheduleSync::default();

        for (target, group) in catalog.pairs() {
            live.insert(registry.register_at(target.id, group.id, group.schedule, now));
            sync.registered += 1;
        }

        for instance in registry.snapshot() {
            if !live.contains(&instance.id) && registry.deregister(instance.id).is_some() {
                debug!(
                    target_id = instance.target_id,
                    metric_group_id = instance.metric_group_id,
                    "schedule removed"
                );
                sync.removed += 1;
            }
        }

        self.health.schedules_registered.set(registry.len() as f64);
        sync
    }

    /// Loads watermarks and last-polled/last-purged timestamps. Failures
    /// leave the defaults in place.
    async fn restore_state(&self) {
        match self.state.watermarks.load(&*self.state.repo).await {
            Ok(n) => info!(watermarks = n, "archive watermarks restored"),
            Err(e) => self.restore_failed("archive watermarks", &e),
        }

        match self.restore_schedule_state().await {
            Ok(n) => info!(schedules = n, "schedule state restored"),
            Err(e) => self.restore_failed("schedule state", &e),
        }
    }

    fn restore_failed(&self, what: &str, err: &anyhow::Error) {
        if RepositoryError::is_connectivity(err) {
            self.state.supervisor.set_accessible(false);
        }
        warn!(error = %err, "{what} not restored");
    }

    /// Applies persisted timestamps to registered schedules. Returns how
    /// many schedules were updated.
    pub async fn restore_schedule_state(&self) -> Result<usize> {
        let rows = self
            .state
            .repo
            .query(&sql::select_schedule_state())
            .await
            .context("loading schedule state")?;

        let mut restored = 0;
        for row in rows {
            let parsed = match row.as_slice() {
                [target_id, group_id, last_polled, last_purged] => target_id
                    .as_i64()
                    .zip(group_id.as_i64())
                    .zip(last_polled.as_datetime().zip(last_purged.as_datetime())),
                _ => None,
            };

            let Some(((target_id, group_id), (last_polled, last_purged))) = parsed else {
                warn!(?row, "skipping malformed schedule state row");
                continue;
            };

            if self
                .state
                .registry
                .restore(target_id, group_id, last_polled, last_purged)
            {
                restored += 1;
            }
        }

        Ok(restored)
    }

    /// Writes the timestamps of every registered schedule.
    pub async fn persist_schedule_state(&self, now: DateTime<Utc>) -> Result<()> {
        for instance in self.state.registry.snapshot() {
            self.state
                .repo
                .execute(&sql::insert_schedule_state(
                    instance.target_id,
                    instance.metric_group_id,
                    instance.last_polled,
                    instance.last_purged,
                    now,
                ))
                .await
                .with_context(|| {
                    format!(
                        "persisting state of target {} group {}",
                        instance.target_id, instance.metric_group_id
                    )
                })?;
        }

        Ok(())
    }

    fn spawn_loops(&mut self) {
        let (tx, rx) = mpsc::channel(self.cfg.writer.queue_size.max(1));

        let writer = Writer::new(self.state.clone());
        let cancel = self.cancel.child_token();
        self.tasks.spawn(async move { writer.run(rx, cancel).await });

        let dispatcher = Dispatcher::new(
            self.state.clone(),
            Arc::clone(&self.probe),
            tx,
            self.cfg.dispatcher.clone(),
        );
        let cancel = self.cancel.child_token();
        self.tasks.spawn(async move { dispatcher.run(cancel).await });

        if self.cfg.archiver.enabled {
            let archiver = Archiver::new(self.state.clone(), self.cfg.archiver.interval);
            let cancel = self.cancel.child_token();
            self.tasks.spawn(async move { archiver.run(cancel).await });
        }

        if self.cfg.purger.enabled {
            let purger = Purger::new(self.state.clone(), self.cfg.purger.clone());
            let cancel = self.cancel.child_token();
            self.tasks.spawn(async move { purger.run(cancel).await });
        }

        let supervisor = Arc::clone(&self.state.supervisor);
        let repo = Arc::clone(&self.state.repo);
        let interval = self.cfg.repository.reconnect_interval;
        let cancel = self.cancel.child_token();
        self.tasks
            .spawn(async move { supervisor.watch(repo, interval, cancel).await });
    }
}
