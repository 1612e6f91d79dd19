use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::store::{CacheError, CacheRow, MultiKeyStore, TableSchema};
use crate::metric::Value;

struct TableState {
    current: MultiKeyStore,
    /// Values each row held before its last update. Cumulative tables only.
    previous: Option<MultiKeyStore>,
}

/// Read view of one cached row.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub id: i64,
    pub keys: Vec<Value>,
    /// Current values, or deltas for cumulative tables. `None` until a
    /// cumulative row has been sampled twice.
    pub values: Option<Vec<Value>>,
    pub valid_from: Option<DateTime<Utc>>,
}

/// Cache table with optional cumulative-diff semantics.
///
/// All access goes through one lock per table so the current/previous pair
/// of a cumulative table is always observed consistently.
pub struct CacheTable {
    schema: Arc<TableSchema>,
    cumulative: bool,
    state: RwLock<TableState>,
}

impl CacheTable {
    /// Creates an empty table. Cumulative tables reject value columns that
    /// cannot be diffed.
    pub fn new(schema: TableSchema, cumulative: bool) -> Result<Self, CacheError> {
        if cumulative {
            if let Some(column) = schema
                .value_columns()
                .iter()
                .find(|c| !c.data_type.is_diffable())
            {
                return Err(CacheError::UnsupportedDiffType {
                    column: column.name.clone(),
                    data_type: column.data_type,
                });
            }
        }

        Ok(Self::with_schema(Arc::new(schema), cumulative))
    }

    fn with_schema(schema: Arc<TableSchema>, cumulative: bool) -> Self {
        let previous = cumulative.then(|| {
            MultiKeyStore::new(Arc::new(TableSchema::new(
                Vec::new(),
                schema.value_columns().to_vec(),
            )))
        });

        Self {
            state: RwLock::new(TableState {
                current: MultiKeyStore::new(Arc::clone(&schema)),
                previous,
            }),
            schema,
            cumulative,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn is_cumulative(&self) -> bool {
        self.cumulative
    }

    pub fn add(
        &self,
        id: Option<i64>,
        keys: Vec<Value>,
        values: Vec<Value>,
        valid_from: Option<DateTime<Utc>>,
    ) -> Result<i64, CacheError> {
        self.state.write().current.add(id, keys, values, valid_from)
    }

    /// Values of a row; deltas against the previous sample for cumulative
    /// tables.
    pub fn get(&self, id: i64) -> Option<Vec<Value>> {
        let state = self.state.read();
        read_values(&state, id)
    }

    /// Raw current row, ignoring cumulative semantics.
    pub fn get_row(&self, id: i64) -> Option<CacheRow> {
        self.state.read().current.get(id).cloned()
    }

    pub fn get_by_key(&self, keys: &[Value]) -> Option<i64> {
        self.state.read().current.get_by_key(keys)
    }

    pub fn update_by_id(&self, id: i64, values: Vec<Value>) -> Result<(), CacheError> {
        let mut state = self.state.write();
        let previous = state.current.update_by_id(id, values)?;
        remember_previous(&mut state, id, previous)
    }

    pub fn update_by_key(&self, keys: &[Value], values: Vec<Value>) -> Result<i64, CacheError> {
        let mut state = self.state.write();
        let (id, previous) = state.current.update_by_key(keys, values)?;
        remember_previous(&mut state, id, previous)?;
        Ok(id)
    }

    /// Updates the matching row or adds a new one; see
    /// [`MultiKeyStore::add_or_update`].
    pub fn add_or_update(
        &self,
        id: Option<i64>,
        keys: Vec<Value>,
        values: Vec<Value>,
        valid_from: Option<DateTime<Utc>>,
    ) -> Result<i64, CacheError> {
        let mut state = self.state.write();
        let (id, previous) = state.current.add_or_update(id, keys, values, valid_from)?;
        if let Some(previous) = previous {
            remember_previous(&mut state, id, previous)?;
        }
        Ok(id)
    }

    pub fn attributes_match(&self, id: i64, attributes: &[Value]) -> bool {
        self.state.read().current.attributes_match(id, attributes)
    }

    pub fn reserve_id(&self) -> i64 {
        self.state.write().current.reserve_id()
    }

    pub fn advance_ids(&self, next: i64) {
        self.state.write().current.advance_ids(next);
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.current.clear();
        if let Some(previous) = state.previous.as_mut() {
            previous.clear();
        }
    }

    /// Empty table with the same schema and mode.
    pub fn clone_and_clear(&self) -> Self {
        Self::with_schema(Arc::clone(&self.schema), self.cumulative)
    }

    /// Id of the row holding the largest value in `column`.
    ///
    /// Rows whose value (or cumulative delta) is unavailable or not numeric
    /// are skipped; ties resolve to the lowest id.
    pub fn get_id_of_max_value(&self, column: &str) -> Result<Option<i64>, CacheError> {
        let index = self
            .schema
            .value_index(column)
            .ok_or_else(|| CacheError::UnknownColumn(column.to_string()))?;

        let state = self.state.read();
        let mut best: Option<(i64, f64)> = None;
        for id in state.current.ids() {
            let Some(value) = read_values(&state, id)
                .and_then(|values| values.get(index).and_then(Value::as_f64))
            else {
                continue;
            };
            if best.map_or(true, |(_, max)| value > max) {
                best = Some((id, value));
            }
        }

        Ok(best.map(|(id, _)| id))
    }

    /// Every row, ordered by id, with values as [`get`](Self::get) returns
    /// them.
    pub fn entries(&self) -> Vec<CachedEntry> {
        let state = self.state.read();
        state
            .current
            .ids()
            .into_iter()
            .filter_map(|id| {
                let row = state.current.get(id)?;
                Some(CachedEntry {
                    id,
                    keys: row.keys.clone(),
                    values: read_values(&state, id),
                    valid_from: row.valid_from,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remember_previous(state: &mut TableState, id: i64, values: Vec<Value>) -> Result<(), CacheError> {
    if let Some(previous) = state.previous.as_mut() {
        previous.add_or_update(Some(id), Vec::new(), values, None)?;
    }
    Ok(())
}

fn read_values(state: &TableState, id: i64) -> Option<Vec<Value>> {
    let current = state.current.get(id)?;
    match &state.previous {
        None => Some(current.values.clone()),
        Some(previous) => {
            let previous = previous.get(id)?;
            Some(
                current
                    .values
                    .iter()
                    .zip(&previous.values)
                    .map(|(now, before)| diff(now, before))
                    .collect(),
            )
        }
    }
}

/// Plain subtraction; a counter reset yields a negative delta.
fn diff(now: &Value, before: &Value) -> Value {
    match (now, before) {
        (Value::Double(a), Value::Double(b)) => Value::Double(a - b),
        (Value::SmallInt(a), Value::SmallInt(b)) => Value::SmallInt(a.wrapping_sub(*b)),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Column, DataType};

    fn counters() -> CacheTable {
        CacheTable::new(
            TableSchema::new(
                Vec::new(),
                vec![
                    Column::new("reads", DataType::Double),
                    Column::new("sessions", DataType::SmallInt),
                ],
            ),
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_cumulative_first_read_has_no_value() {
        let table = counters();
        table
            .add_or_update(Some(1), Vec::new(), vec![Value::Double(100.0), Value::SmallInt(3)], None)
            .unwrap();
        assert_eq!(table.get(1), None);
    }

    #[test]
    fn test_cumulative_second_read_is_delta() {
        let table = counters();
        table
            .add_or_update(Some(1), Vec::new(), vec![Value::Double(100.0), Value::SmallInt(3)], None)
            .unwrap();
        table
            .add_or_update(Some(1), Vec::new(), vec![Value::Double(140.0), Value::SmallInt(5)], None)
            .unwrap();

        assert_eq!(
            table.get(1),
            Some(vec![Value::Double(40.0), Value::SmallInt(2)])
        );
        assert_eq!(
            table.get_row(1).unwrap().values,
            vec![Value::Double(140.0), Value::SmallInt(5)]
        );
    }

    #[test]
    fn test_cumulative_counter_reset_goes_negative() {
        // Known limitation: no reset detection.
        let table = counters();
        table
            .add_or_update(Some(1), Vec::new(), vec![Value::Double(500.0), Value::SmallInt(1)], None)
            .unwrap();
        table.update_by_id(1, vec![Value::Double(20.0), Value::SmallInt(1)]).unwrap();
        assert_eq!(
            table.get(1),
            Some(vec![Value::Double(-480.0), Value::SmallInt(0)])
        );
    }

    #[test]
    fn test_cumulative_null_sample_yields_null_delta() {
        let table = counters();
        table
            .add_or_update(Some(1), Vec::new(), vec![Value::Null, Value::SmallInt(1)], None)
            .unwrap();
        table.update_by_id(1, vec![Value::Double(5.0), Value::SmallInt(4)]).unwrap();
        assert_eq!(table.get(1), Some(vec![Value::Null, Value::SmallInt(3)]));
    }

    #[test]
    fn test_cumulative_rejects_undiffable_columns() {
        let err = CacheTable::new(
            TableSchema::new(Vec::new(), vec![Column::new("total", DataType::Int)]),
            true,
        )
        .err()
        .expect("should fail");
        assert!(matches!(err, CacheError::UnsupportedDiffType { .. }));
    }

    #[test]
    fn test_plain_table_returns_current_values() {
        let table = CacheTable::new(
            TableSchema::new(Vec::new(), vec![Column::new("total", DataType::Int)]),
            false,
        )
        .unwrap();
        table.add(Some(9), Vec::new(), vec![Value::Int(3)], None).unwrap();
        assert_eq!(table.get(9), Some(vec![Value::Int(3)]));
    }

    #[test]
    fn test_id_of_max_value_uses_deltas() {
        let table = counters();
        for (id, first, second) in [(1, 10.0, 1000.0), (2, 500.0, 600.0), (3, 0.0, 5000.0)] {
            table
                .add_or_update(Some(id), Vec::new(), vec![Value::Double(first), Value::SmallInt(0)], None)
                .unwrap();
            if id != 3 {
                table
                    .update_by_id(id, vec![Value::Double(second), Value::SmallInt(0)])
                    .unwrap();
            }
        }

        // Row 3 has no previous sample, so its raw 0.0 is not a candidate.
        assert_eq!(table.get_id_of_max_value("reads").unwrap(), Some(1));
    }

    #[test]
    fn test_id_of_max_value_empty_and_unknown_column() {
        let table = counters();
        assert_eq!(table.get_id_of_max_value("reads").unwrap(), None);

        table
            .add_or_update(Some(1), Vec::new(), vec![Value::Double(1.0), Value::SmallInt(0)], None)
            .unwrap();
        assert_eq!(table.get_id_of_max_value("reads").unwrap(), None);

        let err = table.get_id_of_max_value("nope").expect_err("should fail");
        assert_eq!(err, CacheError::UnknownColumn("nope".into()));
    }

    #[test]
    fn test_clone_and_clear_keeps_mode() {
        let table = counters();
        table
            .add_or_update(Some(1), Vec::new(), vec![Value::Double(1.0), Value::SmallInt(0)], None)
            .unwrap();
        let fresh = table.clone_and_clear();
        assert!(fresh.is_empty());
        assert!(fresh.is_cumulative());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_entries_report_deltas() {
        let table = counters();
        table
            .add_or_update(Some(2), Vec::new(), vec![Value::Double(1.0), Value::SmallInt(0)], None)
            .unwrap();
        table
            .add_or_update(Some(1), Vec::new(), vec![Value::Double(1.0), Value::SmallInt(0)], None)
            .unwrap();
        table
            .add_or_update(Some(1), Vec::new(), vec![Value::Double(3.0), Value::SmallInt(1)], None)
            .unwrap();

        let entries = table.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, 1);
        assert_eq!(entries[0].values, Some(vec![Value::Double(2.0), Value::SmallInt(1)]));
        assert_eq!(entries[1].values, None);
    }
}
