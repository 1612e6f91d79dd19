//! In-memory repository for integration tests.
//!
//! Evaluates the statement shapes the crate emits: inserts, range deletes,
//! dictionary reads with `FINAL` collapse, latest-sample reads, rollups and
//! grouped maxima. Qualified tables (`schema.table`) must be created before
//! use, like on a fresh server.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use wristband::archive::ArchiveTier;
use wristband::catalog::{Catalog, Target};
use wristband::metric::{ChangeSpeed, Column, DataType, MetricGroup, Value};
use wristband::repository::{
    Executor, Repository, RepositoryError, Row, Statement, Transaction,
};
use wristband::schedule::Schedule;

/// Midnight 2024-01-01 UTC.
pub const T0: i64 = 1_704_067_200;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(T0 + secs, 0).unwrap()
}

pub type StoredRow = HashMap<String, Value>;

#[derive(Default)]
struct Inner {
    tables: Mutex<HashMap<String, Vec<StoredRow>>>,
    log: Mutex<Vec<String>>,
    failures: Mutex<Vec<(String, RepositoryError)>>,
}

#[derive(Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next statement containing `needle` fails with `err`.
    pub fn fail_once(&self, needle: &str, err: RepositoryError) {
        self.inner.failures.lock().push((needle.to_string(), err));
    }

    pub fn log(&self) -> Vec<String> {
        self.inner.log.lock().clone()
    }

    pub fn statements_containing(&self, needle: &str) -> Vec<String> {
        self.log().into_iter().filter(|s| s.contains(needle)).collect()
    }

    /// Every stored row of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.inner
            .tables
            .lock()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.inner.tables.lock().contains_key(table)
    }
}

impl Inner {
    fn record(&self, statement: &Statement) -> Result<()> {
        let sql = statement.render()?;
        {
            let mut failures = self.failures.lock();
            if let Some(pos) = failures.iter().position(|(n, _)| sql.contains(n.as_str())) {
                let (_, err) = failures.remove(pos);
                return Err(err.into());
            }
        }
        self.log.lock().push(sql);
        Ok(())
    }

    fn execute(&self, statement: &Statement) -> Result<()> {
        self.record(statement)?;
        let text = statement.text();
        let params = statement.params();

        if let Some(rest) = text.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
            let name = first_word(rest);
            self.tables.lock().entry(name.to_string()).or_default();
        } else if let Some(rest) = text.strip_prefix("DROP TABLE IF EXISTS ") {
            self.tables.lock().remove(first_word(rest));
        } else if let Some(rest) = text.strip_prefix("TRUNCATE TABLE ") {
            if let Some(rows) = self.tables.lock().get_mut(first_word(rest)) {
                rows.clear();
            }
        } else if let Some(rest) = text.strip_prefix("INSERT INTO ") {
            self.insert(rest, params)?;
        } else if let Some(rest) = text.strip_prefix("DELETE FROM ") {
            self.delete(rest, params)?;
        }
        Ok(())
    }

    fn insert(&self, rest: &str, params: &[Value]) -> Result<()> {
        let table = first_word(rest);
        let open = rest.find('(').ok_or_else(|| anyhow!("insert without columns"))?;
        let close = rest[open..]
            .find(')')
            .ok_or_else(|| anyhow!("unterminated column list"))?;
        let columns: Vec<String> = rest[open + 1..open + close]
            .split(',')
            .map(|c| c.trim().to_string())
            .collect();

        // Literal VALUES (used by the migration bookkeeping).
        let values: Vec<Value> = if params.is_empty() {
            let tail = &rest[open + close..];
            let start = tail.rfind('(').ok_or_else(|| anyhow!("insert without values"))?;
            tail[start + 1..]
                .trim_end_matches(')')
                .split(',')
                .map(|v| Value::Int(v.trim().parse().unwrap_or_default()))
                .collect()
        } else {
            params.to_vec()
        };

        let mut tables = self.tables.lock();
        let rows = table_mut(&mut tables, table)?;
        for chunk in values.chunks(columns.len()) {
            rows.push(columns.iter().cloned().zip(chunk.iter().cloned()).collect());
        }
        Ok(())
    }

    fn delete(&self, rest: &str, params: &[Value]) -> Result<()> {
        let table = first_word(rest);
        let clauses = predicates(rest, params)?;

        let mut tables = self.tables.lock();
        let rows = table_mut(&mut tables, table)?;
        rows.retain(|row| !clauses.iter().all(|clause| clause.matches(row)));
        Ok(())
    }

    fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        self.record(statement)?;
        let text = statement.text();
        let params = statement.params();

        let from_at = text.find(" FROM ").ok_or_else(|| anyhow!("query without FROM"))?;
        let select_list = split_top_level(&text["SELECT ".len()..from_at]);
        let table = first_word(&text[from_at + " FROM ".len()..]);

        let tables = self.tables.lock();
        let stored = table_ref(&tables, table)?;

        if text.contains("max(id)") {
            let max = stored.iter().filter_map(|r| r.get("id")?.as_i64()).max();
            return Ok(vec![vec![Value::Int(max.unwrap_or(0))]]);
        }

        if text.contains("intDiv(") {
            return rollup(stored, &select_list, text, params);
        }

        if text.contains("GROUP BY") {
            return Ok(group_max(stored, &select_list, text));
        }

        let mut rows: Vec<StoredRow> = stored.to_vec();

        if text.contains(" FINAL") && text.contains("ORDER BY id") {
            rows = collapse(rows, "id", "updated");
            if text.contains("endDate IS NULL") {
                rows.retain(|r| r.get("endDate").map_or(true, Value::is_null));
            }
            rows.sort_by_key(|r| r.get("id").and_then(Value::as_i64));
        } else if text.contains("(SELECT max(dt)") {
            let latest = rows.iter().filter_map(|r| r.get("dt")?.as_datetime()).max();
            rows.retain(|r| r.get("dt").and_then(Value::as_datetime) == latest);
            rows.sort_by_key(|r| r.get("dictId").and_then(Value::as_i64));
        } else if text.contains("ORDER BY dt DESC LIMIT 1") {
            rows.sort_by_key(|r| r.get("dt").and_then(Value::as_datetime));
            rows = rows.pop().into_iter().collect();
        } else if text.contains("ORDER BY startDate DESC LIMIT 1") {
            rows = collapse(rows, "startDate", "endDate");
            rows.sort_by_key(|r| r.get("startDate").and_then(Value::as_datetime));
            rows = rows.pop().into_iter().collect();
        }

        Ok(rows.iter().map(|r| project(r, &select_list)).collect())
    }
}

impl Executor for MemoryRepository {
    async fn execute(&self, statement: &Statement) -> Result<()> {
        self.inner.execute(statement)
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        self.inner.query(statement)
    }
}

impl Repository for MemoryRepository {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        self.inner.log.lock().push("BEGIN".to_string());
        Ok(MemoryTransaction {
            inner: Arc::clone(&self.inner),
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryTransaction {
    inner: Arc<Inner>,
}

impl Executor for MemoryTransaction {
    async fn execute(&self, statement: &Statement) -> Result<()> {
        self.inner.execute(statement)
    }

    async fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        self.inner.query(statement)
    }
}

impl Transaction for MemoryTransaction {
    async fn commit(self) -> Result<()> {
        self.inner.log.lock().push("COMMIT".to_string());
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.inner.log.lock().push("ROLLBACK".to_string());
        Ok(())
    }
}

// --- Statement evaluation helpers ---

fn first_word(s: &str) -> &str {
    s.split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
}

fn missing(table: &str) -> anyhow::Error {
    RepositoryError::MissingObject(format!("table {table} does not exist")).into()
}

fn table_mut<'a>(
    tables: &'a mut HashMap<String, Vec<StoredRow>>,
    table: &str,
) -> Result<&'a mut Vec<StoredRow>> {
    if table.contains('.') {
        tables.get_mut(table).ok_or_else(|| missing(table))
    } else {
        Ok(tables.entry(table.to_string()).or_default())
    }
}

fn table_ref<'a>(
    tables: &'a HashMap<String, Vec<StoredRow>>,
    table: &str,
) -> Result<&'a [StoredRow]> {
    match tables.get(table) {
        Some(rows) => Ok(rows),
        None if table.contains('.') => Err(missing(table)),
        None => Ok(&[]),
    }
}

/// Splits on commas outside parentheses.
fn split_top_level(list: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut depth = 0;
    let mut current = String::new();
    for ch in list.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                items.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }
    items
}

fn alias(item: &str) -> &str {
    item.rsplit(" AS ").next().unwrap_or(item).trim()
}

/// Timestamps leave the repository as unix seconds.
fn outgoing(value: Option<&Value>) -> Value {
    match value {
        Some(Value::DateTime(t)) => Value::Int(t.timestamp()),
        Some(v) => v.clone(),
        None => Value::Null,
    }
}

fn project(row: &StoredRow, select_list: &[String]) -> Row {
    select_list
        .iter()
        .map(|item| outgoing(row.get(alias(item))))
        .collect()
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (a.as_datetime(), b.as_datetime()) {
        return Some(a.cmp(&b));
    }
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

/// Keeps the last-inserted row with the greatest `version` per `key`.
fn collapse(rows: Vec<StoredRow>, key: &str, version: &str) -> Vec<StoredRow> {
    let mut latest: Vec<StoredRow> = Vec::new();
    for row in rows {
        let existing = latest.iter_mut().find(|r| r.get(key) == row.get(key));
        match existing {
            Some(current) => {
                let newer = match (row.get(version), current.get(version)) {
                    (Some(a), Some(b)) => compare(a, b) != Some(Ordering::Less),
                    _ => true,
                };
                if newer {
                    *current = row;
                }
            }
            None => latest.push(row),
        }
    }
    latest
}

struct Predicate {
    column: String,
    op: String,
    value: Value,
}

impl Predicate {
    fn matches(&self, row: &StoredRow) -> bool {
        let Some(ord) = row.get(&self.column).and_then(|v| compare(v, &self.value)) else {
            return false;
        };
        match self.op.as_str() {
            ">=" => ord != Ordering::Less,
            ">" => ord == Ordering::Greater,
            "<=" => ord != Ordering::Greater,
            "<" => ord == Ordering::Less,
            _ => ord == Ordering::Equal,
        }
    }
}

/// Parses `WHERE col op ? [AND col op ?]..` against bound parameters.
fn predicates(text: &str, params: &[Value]) -> Result<Vec<Predicate>> {
    let Some(at) = text.find(" WHERE ") else {
        return Ok(Vec::new());
    };
    let clause = &text[at + " WHERE ".len()..];
    let clause = clause.split(" GROUP BY ").next().unwrap_or(clause);

    clause
        .split(" AND ")
        .zip(params)
        .map(|(part, value)| {
            let mut words = part.split_whitespace();
            let column = words.next().ok_or_else(|| anyhow!("empty predicate"))?;
            let op = words.next().ok_or_else(|| anyhow!("predicate without operator"))?;
            Ok(Predicate {
                column: column.to_string(),
                op: op.to_string(),
                value: value.clone(),
            })
        })
        .collect()
}

fn rollup(
    stored: &[StoredRow],
    select_list: &[String],
    text: &str,
    params: &[Value],
) -> Result<Vec<Row>> {
    let interval: i64 = text
        .split("intDiv(toUnixTimestamp(dt), ")
        .nth(1)
        .and_then(|rest| rest.split(')').next())
        .and_then(|n| n.trim().parse().ok())
        .ok_or_else(|| anyhow!("rollup without interval"))?;
    let clauses = predicates(text, params)?;
    let multi = select_list.iter().any(|item| item == "dictId");

    let mut buckets: BTreeMap<(i64, Option<i64>), Vec<&StoredRow>> = BTreeMap::new();
    for row in stored.iter().filter(|r| clauses.iter().all(|c| c.matches(r))) {
        let Some(dt) = row.get("dt").and_then(Value::as_datetime) else {
            continue;
        };
        let bucket = dt.timestamp().div_euclid(interval) * interval;
        let dict_id = if multi {
            row.get("dictId").and_then(Value::as_i64)
        } else {
            None
        };
        buckets.entry((bucket, dict_id)).or_default().push(row);
    }

    let metric_items = &select_list[if multi { 2 } else { 1 }..];
    Ok(buckets
        .into_iter()
        .map(|((bucket, dict_id), rows)| {
            let mut out = vec![Value::Int(bucket)];
            if let Some(id) = dict_id {
                out.push(Value::Int(id));
            }
            for item in metric_items {
                let name = alias(item);
                if item.starts_with("avg(") {
                    let values: Vec<f64> = rows
                        .iter()
                        .filter_map(|r| r.get(name)?.as_f64())
                        .collect();
                    out.push(if values.is_empty() {
                        Value::Null
                    } else {
                        Value::Double(values.iter().sum::<f64>() / values.len() as f64)
                    });
                } else {
                    out.push(outgoing(rows.first().and_then(|r| r.get(name))));
                }
            }
            out
        })
        .collect())
}

/// `SELECT keys.., toUnixTimestamp(max(col)) AS col.. GROUP BY keys..`
fn group_max(stored: &[StoredRow], select_list: &[String], text: &str) -> Vec<Row> {
    let keys: Vec<&str> = text
        .split(" GROUP BY ")
        .nth(1)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .collect();

    let mut groups: BTreeMap<Vec<i64>, Vec<&StoredRow>> = BTreeMap::new();
    for row in stored {
        let key = keys
            .iter()
            .map(|k| row.get(*k).and_then(Value::as_i64).unwrap_or_default())
            .collect();
        groups.entry(key).or_default().push(row);
    }

    groups
        .into_values()
        .map(|rows| {
            select_list
                .iter()
                .map(|item| {
                    let name = alias(item);
                    if keys.contains(&name) {
                        outgoing(rows[0].get(name))
                    } else {
                        let max = rows
                            .iter()
                            .filter_map(|r| r.get(name)?.as_datetime())
                            .max();
                        max.map_or(Value::Null, |t| Value::Int(t.timestamp()))
                    }
                })
                .collect()
        })
        .collect()
}

// --- Fixtures ---

pub fn target(id: i64, metric_groups: Vec<i64>) -> Target {
    Target {
        id,
        name: format!("sql{id:02}"),
        endpoint: format!("http://sql{id:02}:8080"),
        metric_groups,
    }
}

pub fn catalog(targets: Vec<Target>, groups: Vec<MetricGroup>) -> Catalog {
    Catalog::new(targets, groups)
}

/// Multi-row fast group keyed by file id with a path attribute.
pub fn file_stats(attribute_change_speed: ChangeSpeed, cumulative: bool) -> MetricGroup {
    MetricGroup {
        id: 12,
        name: "file_stats".to_string(),
        probe_code: "fils".to_string(),
        query: "/files".to_string(),
        change_speed: ChangeSpeed::Fast,
        multi_row: true,
        cumulative,
        key_columns: vec![Column::new("file_id", DataType::Int)],
        attribute_columns: vec![Column::new("path", DataType::Text)],
        attribute_change_speed,
        metric_columns: vec![
            Column::new("reads", DataType::Double),
            Column::new("stall_ms", DataType::Double),
        ],
        schedule: Schedule::new(0, 300, 48),
        archive_tiers: vec![ArchiveTier::new(30, 12, 1440, 900)],
    }
}

/// Single-row group with one text and one numeric value.
pub fn server_info(change_speed: ChangeSpeed) -> MetricGroup {
    MetricGroup {
        id: 3,
        name: "server_info".to_string(),
        probe_code: "srvi".to_string(),
        query: "/server".to_string(),
        change_speed,
        multi_row: false,
        cumulative: false,
        key_columns: Vec::new(),
        attribute_columns: Vec::new(),
        attribute_change_speed: ChangeSpeed::Static,
        metric_columns: vec![
            Column::new("version", DataType::Text),
            Column::new("cpu_count", DataType::SmallInt),
        ],
        schedule: Schedule::new(0, 3600, 720),
        archive_tiers: Vec::new(),
    }
}
