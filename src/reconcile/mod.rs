//! Dimension reconciliation.
//!
//! Classifies a probed batch of dimension rows against the dictionary cache
//! and plans the dictionary writes. The plan is applied by the writer,
//! which commits it before any fact row that references its ids.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::cache::{CacheError, CacheTable, MultiKeyStore, TableSchema};
use crate::metric::{ChangeSpeed, Value};

/// Outcome for one probed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    New,
    Changed,
    Unchanged,
}

/// A dictionary write.
#[derive(Debug, Clone, PartialEq)]
pub enum DictionaryOp {
    /// A new row with an open validity interval (or a new static row).
    Open {
        id: i64,
        keys: Vec<Value>,
        attributes: Vec<Value>,
        valid_from: Option<DateTime<Utc>>,
    },
    /// Ends the validity of an existing row at `valid_to`.
    Close {
        id: i64,
        keys: Vec<Value>,
        attributes: Vec<Value>,
        valid_from: Option<DateTime<Utc>>,
        valid_to: DateTime<Utc>,
    },
}

/// One probed dimension row.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionRow {
    pub keys: Vec<Value>,
    pub attributes: Vec<Value>,
}

/// Dictionary writes for one batch plus the per-row classification.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub ops: Vec<DictionaryOp>,
    /// One entry per input row, in input order.
    pub classifications: Vec<Classification>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn opened(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, DictionaryOp::Open { .. }))
            .count()
    }

    pub fn closed(&self) -> usize {
        self.ops.len() - self.opened()
    }
}

/// Plans the dictionary writes for `rows` sampled at `sample_time`.
///
/// New keys reserve ids from the dictionary's allocator. A key repeated
/// within the batch is reconciled once; later repeats are unchanged.
pub fn reconcile(
    dictionary: &CacheTable,
    attribute_speed: ChangeSpeed,
    rows: &[DimensionRow],
    sample_time: DateTime<Utc>,
) -> Result<ReconcilePlan, CacheError> {
    let slow = attribute_speed == ChangeSpeed::Slow;
    let mut seen = MultiKeyStore::new(Arc::new(TableSchema::new(
        dictionary.schema().key_columns().to_vec(),
        Vec::new(),
    )));
    let mut plan = ReconcilePlan {
        ops: Vec::new(),
        classifications: Vec::with_capacity(rows.len()),
    };

    for row in rows {
        match seen.add(None, row.keys.clone(), Vec::new(), None) {
            Ok(_) => {}
            Err(CacheError::DuplicateKey(_)) => {
                plan.classifications.push(Classification::Unchanged);
                continue;
            }
            Err(e) => return Err(e),
        }

        let valid_from = slow.then_some(sample_time);

        let Some(existing) = dictionary.get_by_key(&row.keys) else {
            plan.ops.push(DictionaryOp::Open {
                id: dictionary.reserve_id(),
                keys: row.keys.clone(),
                attributes: row.attributes.clone(),
                valid_from,
            });
            plan.classifications.push(Classification::New);
            continue;
        };

        if !slow || dictionary.attributes_match(existing, &row.attributes) {
            plan.classifications.push(Classification::Unchanged);
            continue;
        }

        let Some(current) = dictionary.get_row(existing) else {
            return Err(CacheError::UnknownId(existing));
        };
        plan.ops.push(DictionaryOp::Close {
            id: existing,
            keys: current.keys,
            attributes: current.values,
            valid_from: current.valid_from,
            valid_to: sample_time,
        });
        plan.ops.push(DictionaryOp::Open {
            id: dictionary.reserve_id(),
            keys: row.keys.clone(),
            attributes: row.attributes.clone(),
            valid_from,
        });
        plan.classifications.push(Classification::Changed);
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{Column, DataType};
    use chrono::TimeZone;

    fn dictionary() -> CacheTable {
        CacheTable::new(
            TableSchema::new(
                vec![Column::new("server_name", DataType::Text)],
                vec![Column::new("edition", DataType::Text)],
            ),
            false,
        )
        .unwrap()
    }

    fn row(key: &str, attribute: &str) -> DimensionRow {
        DimensionRow {
            keys: vec![Value::Text(key.into())],
            attributes: vec![Value::Text(attribute.into())],
        }
    }

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    /// Applies a plan the way a dictionary reload would see it.
    fn apply(dictionary: &CacheTable, plan: &ReconcilePlan) {
        for op in &plan.ops {
            match op {
                DictionaryOp::Open {
                    id,
                    keys,
                    attributes,
                    valid_from,
                } => {
                    dictionary
                        .add(Some(*id), keys.clone(), attributes.clone(), *valid_from)
                        .unwrap();
                }
                DictionaryOp::Close { .. } => {}
            }
        }
    }

    #[test]
    fn test_new_key_opens_row() {
        let dict = dictionary();
        let plan = reconcile(&dict, ChangeSpeed::Slow, &[row("X", "A")], t(1)).unwrap();
        assert_eq!(plan.classifications, vec![Classification::New]);
        assert_eq!(
            plan.ops,
            vec![DictionaryOp::Open {
                id: 1,
                keys: vec![Value::Text("X".into())],
                attributes: vec![Value::Text("A".into())],
                valid_from: Some(t(1)),
            }]
        );
    }

    #[test]
    fn test_changed_attributes_close_then_open() {
        let dict = dictionary();
        let first = reconcile(&dict, ChangeSpeed::Slow, &[row("X", "A")], t(1)).unwrap();
        apply(&dict, &first);

        let plan = reconcile(&dict, ChangeSpeed::Slow, &[row("X", "B")], t(2)).unwrap();
        assert_eq!(plan.classifications, vec![Classification::Changed]);
        assert_eq!((plan.closed(), plan.opened()), (1, 1));

        match &plan.ops[0] {
            DictionaryOp::Close {
                id,
                valid_from,
                valid_to,
                attributes,
                ..
            } => {
                assert_eq!(*id, 1);
                assert_eq!(*valid_from, Some(t(1)));
                assert_eq!(*valid_to, t(2));
                assert_eq!(attributes, &vec![Value::Text("A".into())]);
            }
            other => panic!("expected close, got {other:?}"),
        }
        match &plan.ops[1] {
            DictionaryOp::Open { id, valid_from, .. } => {
                assert_eq!(*id, 2);
                assert_eq!(*valid_from, Some(t(2)));
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn test_unchanged_attributes_produce_no_ops() {
        let dict = dictionary();
        apply(
            &dict,
            &reconcile(&dict, ChangeSpeed::Slow, &[row("X", "A")], t(1)).unwrap(),
        );

        let plan = reconcile(&dict, ChangeSpeed::Slow, &[row("X", "A")], t(2)).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.classifications, vec![Classification::Unchanged]);
    }

    #[test]
    fn test_static_dictionary_never_changes() {
        let dict = dictionary();
        let first = reconcile(&dict, ChangeSpeed::Static, &[row("X", "A")], t(1)).unwrap();
        assert!(matches!(
            first.ops[0],
            DictionaryOp::Open { valid_from: None, .. }
        ));
        apply(&dict, &first);

        let plan = reconcile(&dict, ChangeSpeed::Static, &[row("X", "B")], t(2)).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.classifications, vec![Classification::Unchanged]);
    }

    #[test]
    fn test_duplicate_keys_in_batch_reconciled_once() {
        let dict = dictionary();
        let plan = reconcile(
            &dict,
            ChangeSpeed::Slow,
            &[row("X", "A"), row("Y", "A"), row("X", "B")],
            t(1),
        )
        .unwrap();
        assert_eq!(
            plan.classifications,
            vec![
                Classification::New,
                Classification::New,
                Classification::Unchanged
            ]
        );
        assert_eq!(plan.opened(), 2);
    }

    #[test]
    fn test_key_shape_mismatch_is_error() {
        let dict = dictionary();
        let bad = DimensionRow {
            keys: Vec::new(),
            attributes: vec![Value::Null],
        };
        let err = reconcile(&dict, ChangeSpeed::Slow, &[bad], t(1)).expect_err("should fail");
        assert_eq!(err, CacheError::KeyCount { expected: 1, got: 0 });
    }
}
