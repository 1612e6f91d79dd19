use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::metric::{Column, DataType, Value};

/// Errors raised by cache mutations. All of them indicate a shape or
/// identity mismatch between the caller and the table.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("expected {expected} key values, got {got}")]
    KeyCount { expected: usize, got: usize },

    #[error("expected {expected} values, got {got}")]
    ValueCount { expected: usize, got: usize },

    #[error("surrogate id {0} already exists")]
    DuplicateId(i64),

    #[error("key already mapped to surrogate id {0}")]
    DuplicateKey(i64),

    #[error("unknown surrogate id {0}")]
    UnknownId(i64),

    #[error("no row matches the given key")]
    UnknownKey,

    #[error("unknown value column: {0}")]
    UnknownColumn(String),

    #[error("column {column} of type {data_type} cannot be diffed")]
    UnsupportedDiffType { column: String, data_type: DataType },
}

/// Key and value columns of a cache table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    key_columns: Vec<Column>,
    value_columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(key_columns: Vec<Column>, value_columns: Vec<Column>) -> Self {
        Self {
            key_columns,
            value_columns,
        }
    }

    pub fn key_columns(&self) -> &[Column] {
        &self.key_columns
    }

    pub fn value_columns(&self) -> &[Column] {
        &self.value_columns
    }

    /// Position of a value column by name.
    pub fn value_index(&self, name: &str) -> Option<usize> {
        self.value_columns.iter().position(|c| c.name == name)
    }
}

/// One cached row.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    pub keys: Vec<Value>,
    pub values: Vec<Value>,
    /// Start of the open validity interval (slowly-changing rows only).
    pub valid_from: Option<DateTime<Utc>>,
}

/// Key tuple with value-based hashing, used by the key index.
///
/// Doubles compare by value with NaN equal to itself and `-0.0` equal to
/// `0.0`; values of different types never compare equal.
#[derive(Debug, Clone)]
struct IndexKey(Vec<Value>);

impl IndexKey {
    fn from_slice(keys: &[Value]) -> Self {
        Self(keys.to_vec())
    }
}

fn canonical_bits(v: f64) -> u64 {
    if v == 0.0 {
        0
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

fn key_part_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Double(x), Value::Double(y)) => canonical_bits(*x) == canonical_bits(*y),
        _ => a == b,
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().zip(&other.0).all(|(a, b)| key_part_eq(a, b))
    }
}

impl Eq for IndexKey {}

impl Hash for IndexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for part in &self.0 {
            std::mem::discriminant(part).hash(state);
            match part {
                Value::Null => {}
                Value::SmallInt(v) => v.hash(state),
                Value::Int(v) => v.hash(state),
                Value::Double(v) => canonical_bits(*v).hash(state),
                Value::Text(v) => v.hash(state),
                Value::DateTime(v) => v.hash(state),
            }
        }
    }
}

/// Generic keyed table: surrogate id <-> key tuple -> value tuple.
///
/// Not synchronized; [`CacheTable`](super::table::CacheTable) wraps it
/// behind a per-table lock. Key lookups go through a hash index over the
/// key tuple. Surrogate ids are never reused until [`clear`](Self::clear).
#[derive(Debug)]
pub struct MultiKeyStore {
    schema: Arc<TableSchema>,
    rows: HashMap<i64, CacheRow>,
    index: HashMap<IndexKey, i64>,
    next_id: i64,
}

impl MultiKeyStore {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            rows: HashMap::new(),
            index: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    fn check_keys(&self, keys: &[Value]) -> Result<(), CacheError> {
        let expected = self.schema.key_columns.len();
        if keys.len() != expected {
            return Err(CacheError::KeyCount {
                expected,
                got: keys.len(),
            });
        }
        Ok(())
    }

    fn check_values(&self, values: &[Value]) -> Result<(), CacheError> {
        let expected = self.schema.value_columns.len();
        if values.len() != expected {
            return Err(CacheError::ValueCount {
                expected,
                got: values.len(),
            });
        }
        Ok(())
    }

    /// Adds a row. `None` allocates the next unused id; an explicit id at
    /// or past the allocator advances it so later allocations never collide.
    pub fn add(
        &mut self,
        id: Option<i64>,
        keys: Vec<Value>,
        values: Vec<Value>,
        valid_from: Option<DateTime<Utc>>,
    ) -> Result<i64, CacheError> {
        self.check_keys(&keys)?;
        self.check_values(&values)?;

        if !keys.is_empty() {
            if let Some(existing) = self.index.get(&IndexKey::from_slice(&keys)) {
                return Err(CacheError::DuplicateKey(*existing));
            }
        }

        let id = match id {
            Some(id) => {
                if self.rows.contains_key(&id) {
                    return Err(CacheError::DuplicateId(id));
                }
                if id >= self.next_id {
                    self.next_id = id + 1;
                }
                id
            }
            None => self.reserve_id(),
        };

        if !keys.is_empty() {
            self.index.insert(IndexKey(keys.clone()), id);
        }
        self.rows.insert(
            id,
            CacheRow {
                keys,
                values,
                valid_from,
            },
        );

        Ok(id)
    }

    pub fn get(&self, id: i64) -> Option<&CacheRow> {
        self.rows.get(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.rows.contains_key(&id)
    }

    /// Surrogate id of the row with the given key tuple.
    pub fn get_by_key(&self, keys: &[Value]) -> Option<i64> {
        if keys.is_empty() || keys.len() != self.schema.key_columns.len() {
            return None;
        }
        self.index.get(&IndexKey::from_slice(keys)).copied()
    }

    /// Replaces the values of a row, returning the previous values.
    pub fn update_by_id(&mut self, id: i64, values: Vec<Value>) -> Result<Vec<Value>, CacheError> {
        self.check_values(&values)?;
        let row = self.rows.get_mut(&id).ok_or(CacheError::UnknownId(id))?;
        Ok(std::mem::replace(&mut row.values, values))
    }

    /// Replaces the values of the row with the given key tuple.
    pub fn update_by_key(
        &mut self,
        keys: &[Value],
        values: Vec<Value>,
    ) -> Result<(i64, Vec<Value>), CacheError> {
        self.check_keys(keys)?;
        let id = self.get_by_key(keys).ok_or(CacheError::UnknownKey)?;
        let previous = self.update_by_id(id, values)?;
        Ok((id, previous))
    }

    /// Updates the matching row or adds a new one.
    ///
    /// Tables without key columns match on `id`; others match on `keys`.
    /// Returns the id and, when a row was updated, its previous values.
    pub fn add_or_update(
        &mut self,
        id: Option<i64>,
        keys: Vec<Value>,
        values: Vec<Value>,
        valid_from: Option<DateTime<Utc>>,
    ) -> Result<(i64, Option<Vec<Value>>), CacheError> {
        self.check_keys(&keys)?;

        let existing = if keys.is_empty() {
            id.filter(|id| self.rows.contains_key(id))
        } else {
            self.get_by_key(&keys)
        };

        match existing {
            Some(existing) => {
                let previous = self.update_by_id(existing, values)?;
                if valid_from.is_some() {
                    if let Some(row) = self.rows.get_mut(&existing) {
                        row.valid_from = valid_from;
                    }
                }
                Ok((existing, Some(previous)))
            }
            None => Ok((self.add(id, keys, values, valid_from)?, None)),
        }
    }

    /// Whether the row's value columns equal `attributes`.
    pub fn attributes_match(&self, id: i64, attributes: &[Value]) -> bool {
        match self.rows.get(&id) {
            Some(row) => {
                row.values.len() == attributes.len()
                    && row
                        .values
                        .iter()
                        .zip(attributes)
                        .all(|(a, b)| key_part_eq(a, b))
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: i64) -> Option<CacheRow> {
        let row = self.rows.remove(&id)?;
        if !row.keys.is_empty() {
            self.index.remove(&IndexKey::from_slice(&row.keys));
        }
        Some(row)
    }

    /// Drops all rows and restarts id allocation.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
        self.next_id = 1;
    }

    /// Empty store with the same schema.
    pub fn clone_and_clear(&self) -> Self {
        Self::new(Arc::clone(&self.schema))
    }

    /// Allocates the next surrogate id without adding a row.
    pub fn reserve_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Makes sure future allocations start at or after `next`.
    pub fn advance_ids(&mut self, next: i64) {
        if next > self.next_id {
            self.next_id = next;
        }
    }

    pub fn next_id(&self) -> i64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row ids in ascending order.
    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.rows.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
