// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Schemas, typed field values, and schema-qualified keys.
//!
//! Every stored record conforms to a named, versioned schema. Keys are
//! triples `(schema_name, partition_key, range_key)`; partition ownership is
//! decided by the partition key, and range scans are ordered by the
//! lexicographic triple (which the derived `Ord` provides).

use serde::{Deserialize, Serialize};

/// A schema-qualified key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub schema_name: String,
    pub partition_key: String,
    pub range_key: String,
}

impl Key {
    pub fn new(
        schema_name: impl Into<String>,
        partition_key: impl Into<String>,
        range_key: impl Into<String>,
    ) -> Self {
        Self {
            schema_name: schema_name.into(),
            partition_key: partition_key.into(),
            range_key: range_key.into(),
        }
    }

    /// Returns true if the partition key is absent.
    ///
    /// Only query boundaries may have an empty partition key, where it means
    /// the start or end of the schema's key set.
    #[inline]
    pub fn has_partition_key(&self) -> bool {
        !self.partition_key.is_empty()
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.schema_name, self.partition_key, self.range_key
        )
    }
}

/// Field types supported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Int64,
    Bool,
    Bytes,
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldValue {
    String(String),
    Int64(i64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Returns the type of this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::String(_) => FieldType::String,
            FieldValue::Int64(_) => FieldType::Int64,
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::Bytes(_) => FieldType::Bytes,
        }
    }
}

/// A single field definition within a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
}

/// A named, versioned schema.
///
/// `partition_key_fields` and `range_key_fields` index into `fields` and name
/// the components the key triple is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub version: u32,
    pub fields: Vec<SchemaField>,
    pub partition_key_fields: Vec<usize>,
    pub range_key_fields: Vec<usize>,
}

impl Schema {
    /// Finds the index of the field matching both name and type.
    pub fn field_index(&self, name: &str, field_type: FieldType) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name && f.field_type == field_type)
    }

    /// Finds the index of the field with the given name, any type.
    pub fn field_index_by_name(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// A full record image: one optional value slot per schema field.
///
/// `None` in a slot means the field is unset. Partial updates always
/// reconcile into a full image before the record is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub schema_name: String,
    pub schema_version: u32,
    pub fields: Vec<Option<FieldValue>>,
}

impl Record {
    pub fn new(schema: &Schema, fields: Vec<Option<FieldValue>>) -> Self {
        Self {
            schema_name: schema.name.clone(),
            schema_version: schema.version,
            fields,
        }
    }

    /// Approximate payload size in bytes, used for scan page budgeting.
    pub fn payload_size(&self) -> usize {
        self.fields
            .iter()
            .flatten()
            .map(|v| match v {
                FieldValue::String(s) => s.len(),
                FieldValue::Int64(_) => 8,
                FieldValue::Bool(_) => 1,
                FieldValue::Bytes(b) => b.len(),
            })
            .sum()
    }

    /// Returns a copy with every field not named in `projection` dropped.
    ///
    /// Unknown projection names are ignored; the caller validates them.
    pub fn project(&self, schema: &Schema, projection: &[String]) -> Record {
        let keep: Vec<usize> = projection
            .iter()
            .filter_map(|name| schema.field_index_by_name(name))
            .collect();
        Record {
            schema_name: self.schema_name.clone(),
            schema_version: self.schema_version,
            fields: self
                .fields
                .iter()
                .enumerate()
                .map(|(i, v)| if keep.contains(&i) { v.clone() } else { None })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schema() -> Schema {
        Schema {
            name: "account".to_string(),
            version: 1,
            fields: vec![
                SchemaField {
                    name: "owner".to_string(),
                    field_type: FieldType::String,
                },
                SchemaField {
                    name: "id".to_string(),
                    field_type: FieldType::String,
                },
                SchemaField {
                    name: "balance".to_string(),
                    field_type: FieldType::Int64,
                },
            ],
            partition_key_fields: vec![0],
            range_key_fields: vec![1],
        }
    }

    #[test]
    fn test_key_ordering_is_lexicographic() {
        let a = Key::new("s", "a", "1");
        let b = Key::new("s", "a", "2");
        let c = Key::new("s", "b", "0");
        let d = Key::new("t", "a", "0");
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_field_index_matches_name_and_type() {
        let schema = test_schema();
        assert_eq!(schema.field_index("balance", FieldType::Int64), Some(2));
        assert_eq!(schema.field_index("balance", FieldType::String), None);
        assert_eq!(schema.field_index("missing", FieldType::String), None);
    }

    #[test]
    fn test_projection_drops_fields() {
        let schema = test_schema();
        let record = Record::new(
            &schema,
            vec![
                Some(FieldValue::String("alice".to_string())),
                Some(FieldValue::String("acc1".to_string())),
                Some(FieldValue::Int64(100)),
            ],
        );

        let projected = record.project(&schema, &["balance".to_string()]);
        assert_eq!(projected.fields[0], None);
        assert_eq!(projected.fields[1], None);
        assert_eq!(projected.fields[2], Some(FieldValue::Int64(100)));
    }

    #[test]
    fn test_payload_size() {
        let schema = test_schema();
        let record = Record::new(
            &schema,
            vec![
                Some(FieldValue::String("alice".to_string())),
                None,
                Some(FieldValue::Int64(1)),
            ],
        );
        assert_eq!(record.payload_size(), 5 + 8);
    }
}
