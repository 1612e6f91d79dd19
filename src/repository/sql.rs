//! Statement builders for the per-target tables and the agent's own state
//! tables.
//!
//! Identifiers come from validated configuration and are interpolated
//! directly; values always go through placeholders.

use std::fmt::Write;

use chrono::{DateTime, Utc};

use super::Statement;
use crate::metric::{ChangeSpeed, Column, DataType, MetricGroup, MetricGroupId, TargetId, Value};

/// Agent state table holding archive watermarks.
pub const WATERMARK_TABLE: &str = "archive_watermarks";

/// Agent state table holding last-polled/last-purged timestamps.
pub const SCHEDULE_STATE_TABLE: &str = "schedule_state";

const TIMESTAMP: &str = "DateTime64(3, 'UTC')";

/// Per-target schema, e.g. `tgt000000012`.
pub fn schema_name(target_id: TargetId) -> String {
    format!("tgt{target_id:09}")
}

pub fn data_table(target_id: TargetId, group: &MetricGroup) -> String {
    format!("{}.{}", schema_name(target_id), group.data_table_name())
}

pub fn dictionary_table(target_id: TargetId, group: &MetricGroup) -> String {
    format!("{}.{}", schema_name(target_id), group.dictionary_table_name())
}

// --- Literal formatting ---

/// Formats a timestamp as a ClickHouse DateTime64(3) literal.
pub fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
pub fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// SQL literal for a bound value.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::SmallInt(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Double(v) if v.is_nan() => "nan".to_string(),
        Value::Double(v) if v.is_infinite() => {
            let sign = if *v > 0.0 { "" } else { "-" };
            format!("{sign}inf")
        }
        Value::Double(v) => v.to_string(),
        Value::Text(v) => format!("'{}'", escape_sql(v)),
        Value::DateTime(v) => format_datetime(*v),
    }
}

// --- Column list helpers ---

fn names<'a>(columns: impl IntoIterator<Item = &'a Column>) -> Vec<&'a str> {
    columns.into_iter().map(|c| c.name.as_str()).collect()
}

/// Select expression returning timestamps as unix seconds.
fn select_expr(column: &Column) -> String {
    match column.data_type {
        DataType::DateTime => format!("toUnixTimestamp({0}) AS {0}", column.name),
        _ => column.name.clone(),
    }
}

fn select_list<'a>(columns: impl IntoIterator<Item = &'a Column>) -> Vec<String> {
    columns.into_iter().map(select_expr).collect()
}

fn column_defs(out: &mut String, columns: &[Column]) {
    for column in columns {
        let _ = write!(out, ", {} Nullable({})", column.name, column.data_type.sql_type());
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// --- DDL ---

pub fn create_schema(target_id: TargetId) -> Statement {
    Statement::new(format!("CREATE DATABASE IF NOT EXISTS {}", schema_name(target_id)))
}

/// Dictionary table. A close is an insert of a newer version of the row.
pub fn create_dictionary_table(target_id: TargetId, group: &MetricGroup) -> Statement {
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (id Int64",
        dictionary_table(target_id, group)
    );
    column_defs(&mut sql, &group.key_columns);
    column_defs(&mut sql, &group.attribute_columns);
    if group.attribute_change_speed == ChangeSpeed::Slow {
        let _ = write!(sql, ", startDate {TIMESTAMP}, endDate Nullable({TIMESTAMP})");
    }
    let _ = write!(
        sql,
        ", updated {TIMESTAMP}) ENGINE = ReplacingMergeTree(updated) ORDER BY id"
    );
    Statement::new(sql)
}

pub fn create_data_table(target_id: TargetId, group: &MetricGroup) -> Statement {
    let table = data_table(target_id, group);
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {table} (");

    if group.is_interval_data() {
        let _ = write!(sql, "startDate {TIMESTAMP}, endDate {TIMESTAMP}");
        column_defs(&mut sql, &group.metric_columns);
        sql.push_str(") ENGINE = ReplacingMergeTree(endDate) ORDER BY startDate");
    } else if group.multi_row {
        let _ = write!(sql, "dt {TIMESTAMP}, dictId Int64");
        column_defs(&mut sql, &group.metric_columns);
        sql.push_str(") ENGINE = MergeTree ORDER BY (dt, dictId)");
    } else {
        let _ = write!(sql, "dt {TIMESTAMP}");
        column_defs(&mut sql, &group.metric_columns);
        sql.push_str(") ENGINE = MergeTree ORDER BY dt");
    }

    Statement::new(sql)
}

/// Everything a fresh target needs for one metric group.
pub fn create_tables(target_id: TargetId, group: &MetricGroup) -> Vec<Statement> {
    let mut statements = vec![create_schema(target_id)];
    if group.multi_row {
        statements.push(create_dictionary_table(target_id, group));
    }
    statements.push(create_data_table(target_id, group));
    statements
}

// --- Dictionary ---

/// Rows to seed a dictionary cache: `id, keys.., attributes..[, startDate]`.
/// Slow dictionaries return only open rows.
pub fn select_dictionary(target_id: TargetId, group: &MetricGroup) -> Statement {
    let mut columns = vec!["id".to_string()];
    columns.extend(select_list(&group.key_columns));
    columns.extend(select_list(&group.attribute_columns));

    let slow = group.attribute_change_speed == ChangeSpeed::Slow;
    if slow {
        columns.push("toUnixTimestamp(startDate) AS startDate".to_string());
    }

    let mut sql = format!(
        "SELECT {} FROM {} FINAL",
        columns.join(", "),
        dictionary_table(target_id, group)
    );
    if slow {
        sql.push_str(" WHERE endDate IS NULL");
    }
    sql.push_str(" ORDER BY id");
    Statement::new(sql)
}

pub fn select_max_dictionary_id(target_id: TargetId, group: &MetricGroup) -> Statement {
    Statement::new(format!(
        "SELECT max(id) AS max_id FROM {}",
        dictionary_table(target_id, group)
    ))
}

/// Inserts (or supersedes) one dictionary row version.
#[allow(clippy::too_many_arguments)]
pub fn insert_dictionary_row(
    target_id: TargetId,
    group: &MetricGroup,
    id: i64,
    keys: &[Value],
    attributes: &[Value],
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
    updated: DateTime<Utc>,
) -> Statement {
    let mut columns = vec!["id"];
    columns.extend(names(&group.key_columns));
    columns.extend(names(&group.attribute_columns));

    let slow = group.attribute_change_speed == ChangeSpeed::Slow;
    if slow {
        columns.extend(["startDate", "endDate"]);
    }
    columns.push("updated");

    let mut stmt = Statement::new(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dictionary_table(target_id, group),
        columns.join(", "),
        placeholders(columns.len())
    ))
    .bind(Value::Int(id))
    .bind_all(keys.iter().cloned())
    .bind_all(attributes.iter().cloned());

    if slow {
        stmt = stmt
            .bind(Value::DateTime(valid_from.unwrap_or(updated)))
            .bind(valid_to.map_or(Value::Null, Value::DateTime));
    }

    stmt.bind(Value::DateTime(updated))
}

// --- Facts ---

/// One fact row. `dict_id` is set for multi-row groups.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub dt: DateTime<Utc>,
    pub dict_id: Option<i64>,
    pub metrics: Vec<Value>,
}

/// Batch insert into a sample table. `None` for an empty batch.
pub fn insert_facts(target_id: TargetId, group: &MetricGroup, rows: &[FactRow]) -> Option<Statement> {
    if rows.is_empty() {
        return None;
    }

    let mut columns = vec!["dt"];
    if group.multi_row {
        columns.push("dictId");
    }
    columns.extend(names(&group.metric_columns));

    let tuple = format!("({})", placeholders(columns.len()));
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ",
        data_table(target_id, group),
        columns.join(", ")
    );
    sql.push_str(&vec![tuple.as_str(); rows.len()].join(", "));

    let mut stmt = Statement::new(sql);
    for row in rows {
        stmt = stmt.bind(Value::DateTime(row.dt));
        if group.multi_row {
            stmt = stmt.bind(row.dict_id.map_or(Value::Null, Value::Int));
        }
        stmt = stmt.bind_all(row.metrics.iter().cloned());
    }
    Some(stmt)
}

/// Inserts a validity interval for single-row slow/static data. Inserting
/// the same `startDate` with a later `endDate` extends the open interval.
pub fn insert_interval(
    target_id: TargetId,
    group: &MetricGroup,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    metrics: &[Value],
) -> Statement {
    let mut columns = vec!["startDate", "endDate"];
    columns.extend(names(&group.metric_columns));

    Statement::new(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        data_table(target_id, group),
        columns.join(", "),
        placeholders(columns.len())
    ))
    .bind(Value::DateTime(start))
    .bind(Value::DateTime(end))
    .bind_all(metrics.iter().cloned())
}

/// Latest sample, used to seed data caches.
///
/// Multi-row: `dictId, metrics..` for every row of the newest sample.
/// Single-row: `metrics..` of the newest sample. Interval data:
/// `startDate, endDate, metrics..` of the newest interval.
pub fn select_latest(target_id: TargetId, group: &MetricGroup) -> Statement {
    let table = data_table(target_id, group);
    let metrics = select_list(&group.metric_columns).join(", ");

    let sql = if group.is_interval_data() {
        format!(
            "SELECT toUnixTimestamp(startDate) AS startDate, toUnixTimestamp(endDate) AS endDate, \
             {metrics} FROM {table} FINAL ORDER BY startDate DESC LIMIT 1"
        )
    } else if group.multi_row {
        format!(
            "SELECT dictId, {metrics} FROM {table} WHERE dt = (SELECT max(dt) FROM {table}) \
             ORDER BY dictId"
        )
    } else {
        format!("SELECT {metrics} FROM {table} ORDER BY dt DESC LIMIT 1")
    };

    Statement::new(sql)
}

// --- Archive and retention ---

/// Averages of every bucket in `[from, to)`, returned as
/// `bucket[, dictId], metrics..` with `bucket` in unix seconds.
pub fn select_rollup(
    target_id: TargetId,
    group: &MetricGroup,
    interval_seconds: u32,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Statement {
    let mut columns = vec![format!(
        "intDiv(toUnixTimestamp(dt), {interval_seconds}) * {interval_seconds} AS bucket"
    )];
    let mut grouping = "bucket".to_string();
    if group.multi_row {
        columns.push("dictId".to_string());
        grouping.push_str(", dictId");
    }
    for column in &group.metric_columns {
        columns.push(match column.data_type {
            t if t.is_numeric() => format!("avg({0}) AS {0}", column.name),
            DataType::DateTime => format!("toUnixTimestamp(any({0})) AS {0}", column.name),
            _ => format!("any({0}) AS {0}", column.name),
        });
    }

    Statement::new(format!(
        "SELECT {} FROM {} WHERE dt >= ? AND dt < ? GROUP BY {grouping} ORDER BY {grouping}",
        columns.join(", "),
        data_table(target_id, group),
    ))
    .bind(Value::DateTime(from))
    .bind(Value::DateTime(to))
}

pub fn delete_range(
    target_id: TargetId,
    group: &MetricGroup,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Statement {
    Statement::new(format!(
        "DELETE FROM {} WHERE dt >= ? AND dt < ?",
        data_table(target_id, group)
    ))
    .bind(Value::DateTime(from))
    .bind(Value::DateTime(to))
}

/// Deletes rows whose retention timestamp is at or before `cutoff`.
pub fn purge(target_id: TargetId, group: &MetricGroup, cutoff: DateTime<Utc>) -> Statement {
    Statement::new(format!(
        "DELETE FROM {} WHERE {} <= ?",
        data_table(target_id, group),
        group.retention_column()
    ))
    .bind(Value::DateTime(cutoff))
}

// --- Agent state ---

/// `tier_id, target_id, archived_up_to` (unix seconds).
pub fn select_watermarks() -> Statement {
    Statement::new(format!(
        "SELECT tier_id, target_id, toUnixTimestamp(max(archived_up_to)) AS archived_up_to \
         FROM {WATERMARK_TABLE} GROUP BY tier_id, target_id"
    ))
}

pub fn insert_watermark(
    tier_id: i64,
    target_id: TargetId,
    archived_up_to: DateTime<Utc>,
    updated: DateTime<Utc>,
) -> Statement {
    Statement::new(format!(
        "INSERT INTO {WATERMARK_TABLE} (tier_id, target_id, archived_up_to, updated) \
         VALUES (?, ?, ?, ?)"
    ))
    .bind(Value::Int(tier_id))
    .bind(Value::Int(target_id))
    .bind(Value::DateTime(archived_up_to))
    .bind(Value::DateTime(updated))
}

/// `target_id, metric_group_id, last_polled, last_purged` (unix seconds).
pub fn select_schedule_state() -> Statement {
    Statement::new(format!(
        "SELECT target_id, metric_group_id, \
         toUnixTimestamp(max(last_polled)) AS last_polled, \
         toUnixTimestamp(max(last_purged)) AS last_purged \
         FROM {SCHEDULE_STATE_TABLE} GROUP BY target_id, metric_group_id"
    ))
}

pub fn insert_schedule_state(
    target_id: TargetId,
    metric_group_id: MetricGroupId,
    last_polled: DateTime<Utc>,
    last_purged: DateTime<Utc>,
    updated: DateTime<Utc>,
) -> Statement {
    Statement::new(format!(
        "INSERT INTO {SCHEDULE_STATE_TABLE} \
         (target_id, metric_group_id, last_polled, last_purged, updated) VALUES (?, ?, ?, ?, ?)"
    ))
    .bind(Value::Int(target_id))
    .bind(Value::Int(metric_group_id))
    .bind(Value::DateTime(last_polled))
    .bind(Value::DateTime(last_purged))
    .bind(Value::DateTime(updated))
}
