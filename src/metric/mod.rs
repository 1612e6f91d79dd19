//! Metric-group shapes and the value model shared by probes, caches and
//! the repository.

use std::fmt;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::archive::ArchiveTier;
use crate::cache::store::TableSchema;
use crate::schedule::Schedule;

/// Identifier of a monitored target.
pub type TargetId = i64;

/// Identifier of a metric group.
pub type MetricGroupId = i64;

/// Column data type as declared by a metric group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    SmallInt,
    Int,
    Double,
    Text,
    DateTime,
}

impl DataType {
    /// Returns the canonical config/log label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SmallInt => "small_int",
            Self::Int => "int",
            Self::Double => "double",
            Self::Text => "text",
            Self::DateTime => "date_time",
        }
    }

    /// Whether the cumulative cache can compute deltas for this type.
    pub const fn is_diffable(self) -> bool {
        matches!(self, Self::SmallInt | Self::Double)
    }

    /// Whether values of this type can be averaged by the archiver.
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::SmallInt | Self::Int | Self::Double)
    }

    /// ClickHouse column type.
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::SmallInt => "Int16",
            Self::Int => "Int64",
            Self::Double => "Float64",
            Self::Text => "String",
            Self::DateTime => "DateTime64(3, 'UTC')",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How often values of a metric group (or its dimension attributes) change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSpeed {
    Static,
    Slow,
    Fast,
}

impl ChangeSpeed {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Slow => "slow",
            Self::Fast => "fast",
        }
    }
}

impl fmt::Display for ChangeSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    SmallInt(i16),
    Int(i64),
    Double(f64),
    Text(String),
    DateTime(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view used for max scans and averaging.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::SmallInt(v) => Some(f64::from(*v)),
            Self::Int(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::SmallInt(v) => Some(i64::from(*v)),
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::DateTime(v) => Some(*v),
            Self::Int(secs) => Utc.timestamp_opt(*secs, 0).single(),
            _ => None,
        }
    }

    /// Converts a repository-returned value into the declared column type.
    ///
    /// The repository reports integers at their storage width and
    /// timestamps as unix seconds; everything else must already match.
    pub fn coerce(self, data_type: DataType) -> Result<Value> {
        let coerced = match (self, data_type) {
            (Self::Null, _) => Self::Null,
            (Self::SmallInt(v), DataType::SmallInt) => Self::SmallInt(v),
            (Self::SmallInt(v), DataType::Int) => Self::Int(i64::from(v)),
            (Self::SmallInt(v), DataType::Double) => Self::Double(f64::from(v)),
            (Self::Int(v), DataType::SmallInt) => Self::SmallInt(
                i16::try_from(v).map_err(|_| anyhow!("value {v} out of range for small_int"))?,
            ),
            (Self::Int(v), DataType::Int) => Self::Int(v),
            (Self::Int(v), DataType::Double) => Self::Double(v as f64),
            (Self::Int(v), DataType::DateTime) => Self::DateTime(
                Utc.timestamp_opt(v, 0)
                    .single()
                    .ok_or_else(|| anyhow!("invalid unix timestamp {v}"))?,
            ),
            (Self::Double(v), DataType::Double) => Self::Double(v),
            (Self::Double(v), DataType::SmallInt) => Self::SmallInt(v.round() as i16),
            (Self::Double(v), DataType::Int) => Self::Int(v.round() as i64),
            (Self::Text(v), DataType::Text) => Self::Text(v),
            (Self::DateTime(v), DataType::DateTime) => Self::DateTime(v),
            (other, data_type) => bail!("cannot convert {other:?} to {data_type}"),
        };

        Ok(coerced)
    }

    /// Parses a JSON cell from a probe payload.
    pub fn from_json(json: &serde_json::Value, data_type: DataType) -> Result<Value> {
        if json.is_null() {
            return Ok(Self::Null);
        }

        let value = match data_type {
            DataType::SmallInt => {
                let raw = json
                    .as_i64()
                    .ok_or_else(|| anyhow!("expected integer, got {json}"))?;
                Self::SmallInt(
                    i16::try_from(raw).map_err(|_| anyhow!("{raw} out of range for small_int"))?,
                )
            }
            DataType::Int => Self::Int(
                json.as_i64()
                    .ok_or_else(|| anyhow!("expected integer, got {json}"))?,
            ),
            DataType::Double => Self::Double(
                json.as_f64()
                    .ok_or_else(|| anyhow!("expected number, got {json}"))?,
            ),
            DataType::Text => Self::Text(
                json.as_str()
                    .ok_or_else(|| anyhow!("expected string, got {json}"))?
                    .to_string(),
            ),
            DataType::DateTime => match json {
                serde_json::Value::String(s) => Self::DateTime(
                    DateTime::parse_from_rfc3339(s)
                        .map_err(|e| anyhow!("invalid timestamp {s}: {e}"))?
                        .with_timezone(&Utc),
                ),
                serde_json::Value::Number(n) => {
                    let secs = n
                        .as_i64()
                        .ok_or_else(|| anyhow!("invalid unix timestamp {n}"))?;
                    Self::Int(secs).coerce(DataType::DateTime)?
                }
                other => bail!("expected timestamp, got {other}"),
            },
        };

        Ok(value)
    }

    /// JSON rendering for the read API.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::SmallInt(v) => serde_json::Value::from(*v),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Double(v) => serde_json::Value::from(*v),
            Self::Text(v) => serde_json::Value::from(v.as_str()),
            Self::DateTime(v) => serde_json::Value::from(v.to_rfc3339()),
        }
    }
}

/// Shape and policy of one metric group, as configured.
#[derive(Debug, Clone)]
pub struct MetricGroup {
    pub id: MetricGroupId,
    pub name: String,
    /// Four-character code of the probe family; prefixes table names.
    pub probe_code: String,
    /// Probe-specific request (path for the HTTP probe).
    pub query: String,
    pub change_speed: ChangeSpeed,
    pub multi_row: bool,
    pub cumulative: bool,
    pub key_columns: Vec<Column>,
    pub attribute_columns: Vec<Column>,
    pub attribute_change_speed: ChangeSpeed,
    pub metric_columns: Vec<Column>,
    pub schedule: Schedule,
    /// Archive tiers ordered by ascending offset.
    pub archive_tiers: Vec<ArchiveTier>,
}

impl MetricGroup {
    /// Data table name, e.g. `sqlp_000000004_data_multi_fast`.
    pub fn data_table_name(&self) -> String {
        format!(
            "{}_{:09}_data_{}_{}",
            self.probe_code,
            self.id,
            if self.multi_row { "multi" } else { "single" },
            self.change_speed,
        )
    }

    /// Dictionary table name, e.g. `sqlp_000000004_dict_slow`.
    pub fn dictionary_table_name(&self) -> String {
        format!(
            "{}_{:09}_dict_{}",
            self.probe_code, self.id, self.attribute_change_speed,
        )
    }

    /// Only fast-changing groups are rolled up.
    pub fn is_archivable(&self) -> bool {
        self.change_speed == ChangeSpeed::Fast
    }

    /// Single-row groups that keep validity intervals instead of samples.
    pub fn is_interval_data(&self) -> bool {
        !self.multi_row && self.change_speed != ChangeSpeed::Fast
    }

    /// Timestamp column the purger compares against the retention cutoff.
    pub fn retention_column(&self) -> &'static str {
        if self.is_interval_data() {
            "endDate"
        } else {
            "dt"
        }
    }

    /// Columns a probe must return, in order.
    pub fn expected_columns(&self) -> impl Iterator<Item = &Column> {
        let (keys, attributes): (&[Column], &[Column]) = if self.multi_row {
            (&self.key_columns, &self.attribute_columns)
        } else {
            (&[], &[])
        };
        keys.iter()
            .chain(attributes.iter())
            .chain(self.metric_columns.iter())
    }

    /// Cache shape of the dictionary: keys -> attributes.
    pub fn dictionary_schema(&self) -> TableSchema {
        TableSchema::new(self.key_columns.clone(), self.attribute_columns.clone())
    }

    /// Cache shape of the data table: surrogate id -> metrics.
    pub fn data_schema(&self) -> TableSchema {
        TableSchema::new(Vec::new(), self.metric_columns.clone())
    }

    /// Returns the tier with the next larger offset, if any.
    pub fn next_tier(&self, tier: &ArchiveTier) -> Option<&ArchiveTier> {
        self.archive_tiers
            .iter()
            .filter(|t| t.offset_minutes > tier.offset_minutes)
            .min_by_key(|t| t.offset_minutes)
    }
}
