// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Query helpers: scan bounds, page budgets, filter evaluation.

use crate::protocol::{FilterExpr, QueryRequest, Status};
use crate::schema::{FieldValue, Key, Record, Schema};

/// Tracks the byte and row budget of one query page.
#[derive(Debug)]
pub struct PageBudget {
    bytes_left: usize,
    rows_left: usize,
}

impl PageBudget {
    pub fn new(bytes: usize, rows: usize, request_limit: Option<usize>) -> Self {
        Self {
            bytes_left: bytes,
            rows_left: request_limit.map_or(rows, |l| l.min(rows)),
        }
    }

    /// Charges one emitted record; returns false once either budget is hit.
    pub fn charge(&mut self, record: &Record) -> bool {
        self.rows_left = self.rows_left.saturating_sub(1);
        self.bytes_left = self.bytes_left.saturating_sub(record.payload_size());
        self.has_room()
    }

    pub fn has_room(&self) -> bool {
        self.rows_left > 0 && self.bytes_left > 0
    }
}

/// Resolves the effective scan bounds for a schema as `(floor, ceiling)`:
/// the low and high ends of the traversed range, regardless of direction.
///
/// Iteration begins at `start_key` (the high end for a reverse scan). An
/// empty partition key in a boundary means the start or end of the schema's
/// key set; the schema name is always pinned so a scan never crosses into
/// another schema.
pub fn scan_bounds(request: &QueryRequest) -> (Key, Key) {
    let (low_raw, high_raw) = if request.reverse {
        (&request.end_key, &request.start_key)
    } else {
        (&request.start_key, &request.end_key)
    };
    let floor = if low_raw.partition_key.is_empty() {
        Key::new(request.schema_name.clone(), "", "")
    } else {
        low_raw.clone()
    };
    let ceiling = if high_raw.partition_key.is_empty() {
        // the upper bound of this schema's key space: the
        // lexicographically-next schema name
        let mut next_schema = request.schema_name.clone();
        next_schema.push('\u{0}');
        Key::new(next_schema, "", "")
    } else {
        high_raw.clone()
    };
    (floor, ceiling)
}

/// Evaluates the filter predicate over a full record image.
///
/// Comparisons against unset fields are false; a type mismatch between the
/// filter value and the schema field is a `BadParameter` error.
pub fn eval_filter(filter: &FilterExpr, schema: &Schema, record: &Record) -> Result<bool, Status> {
    match filter {
        FilterExpr::Eq { field, value } => compare(schema, record, field, value, |o| o.is_eq()),
        FilterExpr::Lt { field, value } => compare(schema, record, field, value, |o| o.is_lt()),
        FilterExpr::Lte { field, value } => compare(schema, record, field, value, |o| o.is_le()),
        FilterExpr::Gt { field, value } => compare(schema, record, field, value, |o| o.is_gt()),
        FilterExpr::Gte { field, value } => compare(schema, record, field, value, |o| o.is_ge()),
        FilterExpr::And(children) => {
            for child in children {
                if !eval_filter(child, schema, record)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        FilterExpr::Or(children) => {
            for child in children {
                if eval_filter(child, schema, record)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterExpr::Not(child) => Ok(!eval_filter(child, schema, record)?),
    }
}

fn compare(
    schema: &Schema,
    record: &Record,
    field: &str,
    value: &FieldValue,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<bool, Status> {
    let idx = schema
        .field_index(field, value.field_type())
        .ok_or_else(|| {
            Status::BadParameter(format!(
                "filter field {field} with type {:?} not in schema {}",
                value.field_type(),
                schema.name
            ))
        })?;
    match record.fields.get(idx).and_then(|v| v.as_ref()) {
        Some(actual) => Ok(accept(actual.cmp(value))),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, SchemaField};
    use crate::time::Timestamp;
    use crate::txn::{Mtr, Priority};

    fn schema() -> Schema {
        Schema {
            name: "item".to_string(),
            version: 1,
            fields: vec![
                SchemaField {
                    name: "id".to_string(),
                    field_type: FieldType::String,
                },
                SchemaField {
                    name: "qty".to_string(),
                    field_type: FieldType::Int64,
                },
            ],
            partition_key_fields: vec![0],
            range_key_fields: vec![],
        }
    }

    fn record(qty: Option<i64>) -> Record {
        Record {
            schema_name: "item".to_string(),
            schema_version: 1,
            fields: vec![
                Some(FieldValue::String("x".to_string())),
                qty.map(FieldValue::Int64),
            ],
        }
    }

    fn query(start_pk: &str, end_pk: &str) -> QueryRequest {
        QueryRequest {
            collection: "c".to_string(),
            pvid: 1,
            mtr: Mtr::new(Timestamp::from_nanos(100), Priority::MEDIUM, 1),
            schema_name: "item".to_string(),
            start_key: Key::new("item", start_pk, ""),
            end_key: Key::new("item", end_pk, ""),
            exclusive_start: false,
            reverse: false,
            filter: None,
            projection: None,
            record_limit: None,
        }
    }

    #[test]
    fn test_filter_comparisons() {
        let s = schema();
        let r = record(Some(5));

        let eq = FilterExpr::Eq {
            field: "qty".to_string(),
            value: FieldValue::Int64(5),
        };
        assert!(eval_filter(&eq, &s, &r).unwrap());

        let lt = FilterExpr::Lt {
            field: "qty".to_string(),
            value: FieldValue::Int64(5),
        };
        assert!(!eval_filter(&lt, &s, &r).unwrap());

        let gte = FilterExpr::Gte {
            field: "qty".to_string(),
            value: FieldValue::Int64(5),
        };
        assert!(eval_filter(&gte, &s, &r).unwrap());
    }

    #[test]
    fn test_filter_boolean_composition() {
        let s = schema();
        let r = record(Some(5));

        let expr = FilterExpr::And(vec![
            FilterExpr::Gt {
                field: "qty".to_string(),
                value: FieldValue::Int64(1),
            },
            FilterExpr::Not(Box::new(FilterExpr::Eq {
                field: "id".to_string(),
                value: FieldValue::String("y".to_string()),
            })),
        ]);
        assert!(eval_filter(&expr, &s, &r).unwrap());

        let expr = FilterExpr::Or(vec![
            FilterExpr::Eq {
                field: "qty".to_string(),
                value: FieldValue::Int64(7),
            },
            FilterExpr::Eq {
                field: "id".to_string(),
                value: FieldValue::String("x".to_string()),
            },
        ]);
        assert!(eval_filter(&expr, &s, &r).unwrap());
    }

    #[test]
    fn test_filter_unset_field_is_false() {
        let s = schema();
        let r = record(None);
        let eq = FilterExpr::Eq {
            field: "qty".to_string(),
            value: FieldValue::Int64(5),
        };
        assert!(!eval_filter(&eq, &s, &r).unwrap());
    }

    #[test]
    fn test_filter_type_mismatch_is_error() {
        let s = schema();
        let r = record(Some(5));
        let eq = FilterExpr::Eq {
            field: "qty".to_string(),
            value: FieldValue::String("5".to_string()),
        };
        assert!(matches!(
            eval_filter(&eq, &s, &r),
            Err(Status::BadParameter(_))
        ));
    }

    #[test]
    fn test_page_budget_rows() {
        let mut budget = PageBudget::new(1 << 20, 2, None);
        assert!(budget.charge(&record(Some(1))));
        assert!(!budget.charge(&record(Some(2))), "row budget exhausted");
    }

    #[test]
    fn test_page_budget_bytes() {
        let mut budget = PageBudget::new(2, 100, None);
        assert!(!budget.charge(&record(Some(1))), "byte budget exhausted");
    }

    #[test]
    fn test_page_budget_request_limit_caps_rows() {
        let mut budget = PageBudget::new(1 << 20, 100, Some(1));
        assert!(!budget.charge(&record(Some(1))));
    }

    #[test]
    fn test_scan_bounds_pin_schema() {
        let req = query("", "");
        let (floor, ceiling) = scan_bounds(&req);
        assert_eq!(floor.schema_name, "item");
        assert!(ceiling.schema_name.as_str() > "item");

        let bounded = query("a", "m");
        let (floor, ceiling) = scan_bounds(&bounded);
        assert_eq!(floor.partition_key, "a");
        assert_eq!(ceiling.partition_key, "m");
    }

    #[test]
    fn test_scan_bounds_reverse_swaps_ends() {
        let mut req = query("m", "a");
        req.reverse = true;
        let (floor, ceiling) = scan_bounds(&req);
        assert_eq!(floor.partition_key, "a");
        assert_eq!(ceiling.partition_key, "m");
    }
}
