use anyhow::{bail, Context, Result};

use crate::repository::{Executor, Statement};

/// One schema step: forward and reverse SQL.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// Schema steps, ascending.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

const CREATE_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version Int64,
    dirty UInt8,
    sequence UInt64
) ENGINE = TinyLog";

const CLEAR_MIGRATIONS: &str = "TRUNCATE TABLE schema_migrations";

/// Applies the agent-state schema (watermarks, schedule state).
///
/// Keeps a golang-migrate compatible `schema_migrations` table so the
/// schema can also be managed by external tooling.
pub struct Migrator<'a, E: Executor> {
    repo: &'a E,
}

impl<'a, E: Executor> Migrator<'a, E> {
    pub fn new(repo: &'a E) -> Self {
        Self { repo }
    }

    /// Brings the schema to the newest embedded version.
    pub async fn up(&self) -> Result<()> {
        let (from, dirty) = self.status().await?;
        if dirty {
            bail!("schema version {from} is dirty; fix it by hand before upgrading");
        }

        let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
        if pending.is_empty() {
            tracing::info!(version = from, "schema up to date");
            return Ok(());
        }

        for migration in &pending {
            let version = migration.version;
            tracing::info!(from, version, "upgrading agent-state schema");

            self.record(version, true).await?;
            self.run_script(migration.up_sql)
                .await
                .with_context(|| format!("upgrading schema to version {version}"))?;
            self.record(version, false).await?;
        }

        tracing::info!(
            version = latest_version(),
            applied = pending.len(),
            "schema upgraded"
        );
        Ok(())
    }

    /// Reverts the newest applied version.
    pub async fn down(&self) -> Result<()> {
        let (current, _) = self.status().await?;
        if current == 0 {
            tracing::info!("schema empty, nothing to revert");
            return Ok(());
        }

        let Some(migration) = MIGRATIONS.iter().find(|m| m.version == current) else {
            bail!("schema version {current} is not embedded in this build");
        };

        tracing::info!(version = current, "reverting agent-state schema");

        self.record(current, true).await?;
        self.run_script(migration.down_sql)
            .await
            .with_context(|| format!("reverting schema version {current}"))?;

        let previous = previous_version(current);
        if previous == 0 {
            self.repo
                .execute(&Statement::new(CLEAR_MIGRATIONS))
                .await
                .context("clearing schema_migrations")?;
        } else {
            self.record(previous, false).await?;
        }

        tracing::info!(version = previous, "schema reverted");
        Ok(())
    }

    /// Recorded version and dirty flag; `(0, false)` for an empty schema.
    pub async fn status(&self) -> Result<(u32, bool)> {
        self.repo
            .execute(&Statement::new(CREATE_MIGRATIONS_TABLE))
            .await
            .context("ensuring schema_migrations exists")?;

        let rows = self
            .repo
            .query(&Statement::new(
                "SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1",
            ))
            .await
            .context("reading schema_migrations")?;

        let Some(row) = rows.first() else {
            return Ok((0, false));
        };

        let (Some(version), Some(dirty)) = (
            row.first().and_then(|v| v.as_i64()),
            row.get(1).and_then(|v| v.as_i64()),
        ) else {
            bail!("malformed schema_migrations row: {row:?}");
        };

        let version = u32::try_from(version)
            .with_context(|| format!("schema version {version} out of range"))?;
        Ok((version, dirty != 0))
    }

    /// Replaces the single tracking row.
    async fn record(&self, version: u32, dirty: bool) -> Result<()> {
        self.repo
            .execute(&Statement::new(CLEAR_MIGRATIONS))
            .await
            .context("clearing schema_migrations")?;

        let dirty_val = u8::from(dirty);
        self.repo
            .execute(&Statement::new(format!(
                "INSERT INTO schema_migrations (version, dirty, sequence) \
                 VALUES ({version}, {dirty_val}, 1)"
            )))
            .await
            .with_context(|| format!("recording schema version {version}"))
    }

    async fn run_script(&self, sql: &str) -> Result<()> {
        for statement in split_statements(sql) {
            self.repo
                .execute(&Statement::new(statement))
                .await
                .with_context(|| {
                    let head = statement.lines().next().unwrap_or_default();
                    format!("schema statement failed: {head}")
                })?;
        }
        Ok(())
    }
}

fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

fn previous_version(version: u32) -> u32 {
    MIGRATIONS
        .iter()
        .rev()
        .map(|m| m.version)
        .find(|v| *v < version)
        .unwrap_or(0)
}

/// Semicolon-separated statements, blanks dropped.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';').map(str::trim).filter(|s| !s.is_empty()).collect()
}
