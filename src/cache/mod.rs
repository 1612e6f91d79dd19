//! In-memory state caches.
//!
//! Dictionary caches map business keys to surrogate ids; data caches hold
//! the latest sample per surrogate id (per target id for single-row
//! groups). Reloads build a fresh table and swap it in by reference, so
//! readers holding the old `Arc` keep a consistent view.

pub mod store;
pub mod table;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dashmap::{DashMap, DashSet};

pub use self::store::{CacheError, CacheRow, MultiKeyStore, TableSchema};
pub use self::table::{CacheTable, CachedEntry};

use crate::metric::{ChangeSpeed, MetricGroup, MetricGroupId, TargetId, Value};
use crate::repository::{sql, Executor, RepositoryError, Row};

/// Every live cache table, keyed by table identity.
pub struct CacheRegistry {
    tables: DashMap<String, Arc<CacheTable>>,
    /// (target, group) pairs whose data cache was seeded from the repository.
    seeded: DashSet<(TargetId, MetricGroupId)>,
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self {
            tables: DashMap::with_capacity(64),
            seeded: DashSet::new(),
        }
    }

    /// Dictionaries are per target.
    pub fn dictionary_key(target_id: TargetId, group: &MetricGroup) -> String {
        sql::dictionary_table(target_id, group)
    }

    /// Multi-row data caches are per target; single-row data caches are
    /// shared by all targets and keyed by target id inside the table.
    pub fn data_key(target_id: TargetId, group: &MetricGroup) -> String {
        if group.multi_row {
            sql::data_table(target_id, group)
        } else {
            group.data_table_name()
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<CacheTable>> {
        self.tables.get(key).map(|t| Arc::clone(&t))
    }

    pub fn dictionary(&self, target_id: TargetId, group: &MetricGroup) -> Option<Arc<CacheTable>> {
        self.get(&Self::dictionary_key(target_id, group))
    }

    pub fn data(&self, target_id: TargetId, group: &MetricGroup) -> Option<Arc<CacheTable>> {
        self.get(&Self::data_key(target_id, group))
    }

    /// Swaps in a table, returning the shared reference now in place.
    pub fn replace(&self, key: String, table: CacheTable) -> Arc<CacheTable> {
        let table = Arc::new(table);
        self.tables.insert(key, Arc::clone(&table));
        table
    }

    /// Returns the table under `key`, creating it on first use.
    pub fn get_or_try_insert(
        &self,
        key: &str,
        create: impl FnOnce() -> Result<CacheTable, CacheError>,
    ) -> Result<Arc<CacheTable>, CacheError> {
        if let Some(table) = self.get(key) {
            return Ok(table);
        }
        let entry = self
            .tables
            .entry(key.to_string())
            .or_try_insert_with(|| create().map(Arc::new))?;
        Ok(Arc::clone(&entry))
    }

    /// Drops every cache of a target. Shared single-row tables keep their
    /// rows; stale rows there are harmless and overwritten on re-register.
    pub fn remove_target(&self, target_id: TargetId) {
        let prefix = format!("{}.", sql::schema_name(target_id));
        self.tables.retain(|key, _| !key.starts_with(&prefix));
        self.seeded.retain(|(target, _)| *target != target_id);
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Coerces `columns.len()` cells starting at `from` into their declared types.
pub(crate) fn coerce_row(
    row: &[Value],
    from: usize,
    columns: &[crate::metric::Column],
) -> Result<Vec<Value>> {
    columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            row.get(from + i)
                .cloned()
                .ok_or_else(|| anyhow!("row is missing column {}", column.name))?
                .coerce(column.data_type)
                .with_context(|| format!("column {}", column.name))
        })
        .collect()
}

fn cell_i64(row: &Row, idx: usize, name: &str) -> Result<i64> {
    row.get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("row has no integer {name}"))
}

/// Rebuilds the dictionary cache of (target, group) from the repository
/// and swaps it in.
///
/// Slow dictionaries load only their open rows. The id allocator is seeded
/// past the largest id ever written, including closed rows.
pub async fn load_dictionary<E: Executor>(
    repo: &E,
    caches: &CacheRegistry,
    target_id: TargetId,
    group: &MetricGroup,
) -> Result<Arc<CacheTable>> {
    let key = CacheRegistry::dictionary_key(target_id, group);
    let fresh = match caches.get(&key) {
        Some(current) => current.clone_and_clear(),
        None => CacheTable::new(group.dictionary_schema(), false)?,
    };

    let rows = repo
        .query(&sql::select_dictionary(target_id, group))
        .await
        .with_context(|| format!("loading dictionary {key}"))?;

    let slow = group.attribute_change_speed == ChangeSpeed::Slow;
    let key_count = group.key_columns.len();
    let attribute_start = 1 + key_count;
    let valid_from_idx = attribute_start + group.attribute_columns.len();

    for row in &rows {
        let id = cell_i64(row, 0, "id")?;
        let keys = coerce_row(row, 1, &group.key_columns)?;
        let attributes = coerce_row(row, attribute_start, &group.attribute_columns)?;
        let valid_from = if slow {
            row.get(valid_from_idx).and_then(Value::as_datetime)
        } else {
            None
        };

        if let Err(e) = fresh.add(Some(id), keys, attributes, valid_from) {
            tracing::warn!(table = %key, id, error = %e, "skipping conflicting dictionary row");
        }
    }

    let max_rows = repo
        .query(&sql::select_max_dictionary_id(target_id, group))
        .await
        .with_context(|| format!("reading max id of {key}"))?;
    if let Some(max_id) = max_rows.first().and_then(|r| r.first()).and_then(Value::as_i64) {
        fresh.advance_ids(max_id + 1);
    }

    tracing::debug!(table = %key, rows = fresh.len(), "dictionary cache loaded");

    Ok(caches.replace(key, fresh))
}

/// Returns the dictionary cache, loading it on first use.
///
/// A missing table creates the target's tables and loads once more.
pub async fn ensure_dictionary<E: Executor>(
    repo: &E,
    caches: &CacheRegistry,
    target_id: TargetId,
    group: &MetricGroup,
) -> Result<Arc<CacheTable>> {
    if let Some(table) = caches.dictionary(target_id, group) {
        return Ok(table);
    }

    match load_dictionary(repo, caches, target_id, group).await {
        Ok(table) => Ok(table),
        Err(e) if RepositoryError::is_missing_object(&e) => {
            tracing::info!(target_id, group = %group.name, "creating tables for new target");
            create_tables(repo, target_id, group).await?;
            load_dictionary(repo, caches, target_id, group).await
        }
        Err(e) => Err(e),
    }
}

/// Creates the schema and tables of (target, group) if absent.
pub async fn create_tables<E: Executor>(
    repo: &E,
    target_id: TargetId,
    group: &MetricGroup,
) -> Result<()> {
    for statement in sql::create_tables(target_id, group) {
        repo.execute(&statement)
            .await
            .with_context(|| format!("creating tables for target {target_id}"))?;
    }
    Ok(())
}

/// Returns the data cache of (target, group), seeding it with the latest
/// stored sample the first time the pair is seen.
///
/// Seeding keeps cumulative deltas continuous across restarts. A missing
/// table seeds nothing.
pub async fn ensure_data<E: Executor>(
    repo: &E,
    caches: &CacheRegistry,
    target_id: TargetId,
    group: &MetricGroup,
) -> Result<Arc<CacheTable>> {
    let key = CacheRegistry::data_key(target_id, group);
    let table = caches.get_or_try_insert(&key, || {
        CacheTable::new(group.data_schema(), group.cumulative)
    })?;

    if caches.seeded.contains(&(target_id, group.id)) {
        return Ok(table);
    }

    let rows = match repo.query(&sql::select_latest(target_id, group)).await {
        Ok(rows) => rows,
        Err(e) if RepositoryError::is_missing_object(&e) => Vec::new(),
        Err(e) => return Err(e).with_context(|| format!("seeding data cache {key}")),
    };

    for row in &rows {
        if group.is_interval_data() {
            let valid_from = row.get(0).and_then(Value::as_datetime);
            let metrics = coerce_row(row, 2, &group.metric_columns)?;
            table.add_or_update(Some(target_id), Vec::new(), metrics, valid_from)?;
        } else if group.multi_row {
            let dict_id = cell_i64(row, 0, "dictId")?;
            let metrics = coerce_row(row, 1, &group.metric_columns)?;
            table.add_or_update(Some(dict_id), Vec::new(), metrics, None)?;
        } else {
            let metrics = coerce_row(row, 0, &group.metric_columns)?;
            table.add_or_update(Some(target_id), Vec::new(), metrics, None)?;
        }
    }

    caches.seeded.insert((target_id, group.id));
    tracing::debug!(table = %key, target_id, rows = rows.len(), "data cache seeded");

    Ok(table)
}
