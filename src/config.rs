use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::archive::ArchiveTier;
use crate::catalog::{Catalog, Target};
use crate::metric::{ChangeSpeed, Column, MetricGroup};
use crate::schedule::Schedule;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Top-level configuration for the wristband agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Repository (ClickHouse) connection configuration.
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Due-queue scanning configuration.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Write path configuration.
    #[serde(default)]
    pub writer: WriterConfig,

    /// Probe configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Archive tier rollup configuration.
    #[serde(default)]
    pub archiver: ArchiverConfig,

    /// Retention purge configuration.
    #[serde(default)]
    pub purger: PurgerConfig,

    /// Metric group definitions.
    #[serde(default)]
    pub metric_groups: Vec<MetricGroupConfig>,

    /// Monitored targets.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    /// Native protocol endpoint (host:port). Default: "localhost:9000".
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Database holding the agent's own state tables. Default: "wristband".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// How often to retry an unreachable repository. Default: 30s.
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Due-queue scanning configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Scan period. Default: 25ms.
    #[serde(default = "default_tick", with = "humantime_serde")]
    pub tick: Duration,

    /// Entries due within this window of now fire on the current tick.
    /// Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub fire_tolerance: Duration,

    /// Maximum concurrently running probes. Default: 64.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

/// Write path configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Capacity of the probe result queue. Default: 1024.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

/// Probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Request timeout. Default: 10s.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Connect timeout. Default: 5s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Archive tier rollup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiverConfig {
    /// Enable the archiver. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Outer cycle period. Default: 1m.
    #[serde(default = "default_archive_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Retention purge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PurgerConfig {
    /// Enable the purger. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Outer cycle period. Default: 1m.
    #[serde(default = "default_purge_cycle", with = "humantime_serde")]
    pub interval: Duration,

    /// Minimum time between purges of one schedule. Default: 6h.
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,

    /// Pause between two purged schedules. Default: 250ms.
    #[serde(default = "default_purge_pause", with = "humantime_serde")]
    pub pause: Duration,
}

/// One metric group.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricGroupConfig {
    pub id: i64,

    pub name: String,

    /// Four-character probe family code, used in table names.
    pub probe_code: String,

    /// Path appended to the target endpoint by the HTTP probe.
    pub query: String,

    pub change_speed: ChangeSpeed,

    #[serde(default)]
    pub multi_row: bool,

    #[serde(default)]
    pub cumulative: bool,

    #[serde(default)]
    pub key_columns: Vec<Column>,

    #[serde(default)]
    pub attribute_columns: Vec<Column>,

    /// Change speed of the dictionary attributes. Default: static.
    #[serde(default = "default_attribute_change_speed")]
    pub attribute_change_speed: ChangeSpeed,

    pub metric_columns: Vec<Column>,

    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub archive_tiers: Vec<ArchiveTierConfig>,
}

/// Sampling cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Offset of the sampling grid from midnight (UTC). Default: 0s.
    #[serde(default, with = "humantime_serde")]
    pub offset: Duration,

    /// Sampling period.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Raw data retention, whole hours. Default: 24h.
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,
}

/// One rollup level.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveTierConfig {
    pub id: i64,

    /// Minimum age of data this tier rolls up, whole minutes.
    #[serde(with = "humantime_serde")]
    pub offset: Duration,

    /// Bucket width, whole seconds.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// One monitored target.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub id: i64,

    pub name: String,

    /// Base URL of the target's probe endpoint.
    pub endpoint: String,

    /// Metric groups sampled on this target.
    pub metric_groups: Vec<i64>,
}

// --- Default value functions ---

fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "localhost:9000".to_string()
}

fn default_database() -> String {
    "wristband".to_string()
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_tick() -> Duration {
    Duration::from_millis(25)
}

fn default_max_in_flight() -> usize {
    64
}

fn default_queue_size() -> usize {
    1024
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_archive_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_purge_cycle() -> Duration {
    Duration::from_secs(60)
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(360 * 60)
}

fn default_purge_pause() -> Duration {
    Duration::from_millis(250)
}

fn default_attribute_change_speed() -> ChangeSpeed {
    ChangeSpeed::Static
}

fn default_retention() -> Duration {
    Duration::from_secs(SECONDS_PER_DAY)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig::default(),
            health: HealthConfig::default(),
            dispatcher: DispatcherConfig::default(),
            writer: WriterConfig::default(),
            probe: ProbeConfig::default(),
            archiver: ArchiverConfig::default(),
            purger: PurgerConfig::default(),
            metric_groups: Vec::new(),
            targets: Vec::new(),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            reconnect_interval: default_reconnect_interval(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            fire_tolerance: Duration::ZERO,
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: default_probe_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_archive_interval(),
        }
    }
}

impl Default for PurgerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_purge_cycle(),
            purge_interval: default_purge_interval(),
            pause: default_purge_pause(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.repository.endpoint.is_empty() {
            bail!("repository.endpoint is required");
        }

        if !is_identifier(&self.repository.database) {
            bail!("repository.database must be an identifier");
        }

        if self.repository.reconnect_interval.is_zero() {
            bail!("repository.reconnect_interval must be positive");
        }

        if self.dispatcher.tick.is_zero() {
            bail!("dispatcher.tick must be positive");
        }

        if self.dispatcher.max_in_flight == 0 {
            bail!("dispatcher.max_in_flight must be positive");
        }

        if self.writer.queue_size == 0 {
            bail!("writer.queue_size must be positive");
        }

        if self.probe.timeout.is_zero() {
            bail!("probe.timeout must be positive");
        }

        if self.archiver.enabled && self.archiver.interval.is_zero() {
            bail!("archiver.interval must be positive");
        }

        if self.purger.enabled && self.purger.interval.is_zero() {
            bail!("purger.interval must be positive");
        }

        let mut group_ids = HashSet::new();
        let mut tier_ids = HashSet::new();
        for group in &self.metric_groups {
            if !group_ids.insert(group.id) {
                bail!("duplicate metric group id: {}", group.id);
            }
            group
                .validate(&mut tier_ids)
                .with_context(|| format!("metric group {} ({})", group.id, group.name))?;
        }

        let mut target_ids = HashSet::new();
        for target in &self.targets {
            if !target_ids.insert(target.id) {
                bail!("duplicate target id: {}", target.id);
            }
            if target.id < 0 {
                bail!("target {}: id must not be negative", target.id);
            }
            if target.endpoint.is_empty() {
                bail!("target {}: endpoint is required", target.id);
            }
            for group_id in &target.metric_groups {
                if !group_ids.contains(group_id) {
                    bail!("target {}: unknown metric group {group_id}", target.id);
                }
            }
        }

        Ok(())
    }

    /// Builds the runtime catalog from the validated configuration.
    pub fn catalog(&self) -> Catalog {
        let groups = self.metric_groups.iter().map(MetricGroupConfig::to_group).collect();
        let targets = self
            .targets
            .iter()
            .map(|t| Target {
                id: t.id,
                name: t.name.clone(),
                endpoint: t.endpoint.clone(),
                metric_groups: t.metric_groups.clone(),
            })
            .collect();

        Catalog::new(targets, groups)
    }
}

impl MetricGroupConfig {
    fn validate(&self, tier_ids: &mut HashSet<i64>) -> Result<()> {
        if self.id < 0 {
            bail!("id must not be negative");
        }

        if self.probe_code.len() != 4 || !self.probe_code.chars().all(|c| c.is_ascii_alphanumeric())
        {
            bail!("probe_code must be 4 alphanumeric characters");
        }

        if self.metric_columns.is_empty() {
            bail!("metric_columns must not be empty");
        }

        let mut names = HashSet::new();
        for column in self
            .key_columns
            .iter()
            .chain(&self.attribute_columns)
            .chain(&self.metric_columns)
        {
            if !is_identifier(&column.name) {
                bail!("column name is not an identifier: {}", column.name);
            }
            if !names.insert(column.name.as_str()) {
                bail!("duplicate column name: {}", column.name);
            }
        }

        if self.cumulative {
            if let Some(column) = self
                .metric_columns
                .iter()
                .find(|c| !c.data_type.is_diffable())
            {
                bail!(
                    "cumulative metric column {} must be small_int or double, got {}",
                    column.name,
                    column.data_type
                );
            }
        }

        if self.multi_row {
            if self.key_columns.is_empty() {
                bail!("multi-row groups need key_columns");
            }
            if self.change_speed != ChangeSpeed::Fast {
                bail!("multi-row groups must be fast-changing");
            }
            if self.attribute_change_speed == ChangeSpeed::Fast {
                bail!("attribute_change_speed must be static or slow");
            }
        } else if !self.key_columns.is_empty() || !self.attribute_columns.is_empty() {
            bail!("single-row groups cannot have key or attribute columns");
        }

        let schedule = &self.schedule;
        if schedule.interval.is_zero() || schedule.interval.subsec_nanos() != 0 {
            bail!("schedule.interval must be a positive whole number of seconds");
        }
        if schedule.offset.as_secs() >= SECONDS_PER_DAY || schedule.offset.subsec_nanos() != 0 {
            bail!("schedule.offset must be whole seconds below 24h");
        }
        if schedule.retention.as_secs() < 3600 || schedule.retention.as_secs() % 3600 != 0 {
            bail!("schedule.retention must be a whole number of hours, at least 1h");
        }

        if !self.archive_tiers.is_empty() && self.change_speed != ChangeSpeed::Fast {
            bail!("only fast-changing groups can have archive tiers");
        }

        let mut offsets = HashSet::new();
        for tier in &self.archive_tiers {
            if !tier_ids.insert(tier.id) {
                bail!("duplicate archive tier id: {}", tier.id);
            }
            if tier.offset.is_zero() || tier.offset.as_secs() % 60 != 0 || tier.offset.subsec_nanos() != 0
            {
                bail!("archive tier {}: offset must be a positive whole number of minutes", tier.id);
            }
            if tier.interval.is_zero() || tier.interval.subsec_nanos() != 0 {
                bail!("archive tier {}: interval must be a positive whole number of seconds", tier.id);
            }
            if !offsets.insert(tier.offset) {
                bail!("archive tier {}: duplicate offset", tier.id);
            }
        }

        Ok(())
    }

    fn to_group(&self) -> MetricGroup {
        let mut archive_tiers: Vec<ArchiveTier> = self
            .archive_tiers
            .iter()
            .map(|t| {
                ArchiveTier::new(
                    t.id,
                    self.id,
                    saturating_u32(t.offset.as_secs() / 60),
                    saturating_u32(t.interval.as_secs()),
                )
            })
            .collect();
        archive_tiers.sort_by_key(|t| t.offset_minutes);

        MetricGroup {
            id: self.id,
            name: self.name.clone(),
            probe_code: self.probe_code.clone(),
            query: self.query.clone(),
            change_speed: self.change_speed,
            multi_row: self.multi_row,
            cumulative: self.cumulative,
            key_columns: self.key_columns.clone(),
            attribute_columns: self.attribute_columns.clone(),
            attribute_change_speed: self.attribute_change_speed,
            metric_columns: self.metric_columns.clone(),
            schedule: Schedule::new(
                saturating_u32(self.schedule.offset.as_secs()),
                saturating_u32(self.schedule.interval.as_secs()),
                saturating_u32(self.schedule.retention.as_secs() / 3600),
            ),
            archive_tiers,
        }
    }
}

fn saturating_u32(v: u64) -> u32 {
    u32::try_from(v).unwrap_or(u32::MAX)
}

/// ASCII identifier: letter or underscore, then letters, digits, underscores.
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
