// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire types for the Datastore REST v1 surface.
//!
//! Only the value kinds the pipeline stores are modeled: strings, integers
//! (which the JSON API encodes as decimal strings), booleans, timestamps and
//! nulls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::DatastoreError;

fn is_false(b: &bool) -> bool {
    !*b
}

/// One element of an entity key path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathElement {
    /// Entity kind, e.g. `Entry`.
    pub kind: String,
    /// Key name; the pipeline only uses named keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Numeric id, present on auto-allocated keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// An entity key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Key path; a single element for root entities.
    pub path: Vec<PathElement>,
}

impl Key {
    /// Root-level key `kind/name`.
    pub fn named(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: vec![PathElement {
                kind: kind.into(),
                name: Some(name.into()),
                id: None,
            }],
        }
    }

    /// The name (or id, for auto-allocated keys) of the leaf path element.
    pub fn leaf_name(&self) -> Option<&str> {
        let last = self.path.last()?;
        last.name.as_deref().or(last.id.as_deref())
    }
}

/// A typed property value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Value {
    /// String payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    /// Integer payload; the JSON API encodes int64 as a decimal string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integer_value: Option<String>,
    /// Boolean payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boolean_value: Option<bool>,
    /// RFC 3339 timestamp payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_value: Option<DateTime<Utc>>,
    /// Null marker (`"NULL_VALUE"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub null_value: Option<String>,
    /// When set, the property is excluded from built-in indexes.
    #[serde(skip_serializing_if = "is_false")]
    pub exclude_from_indexes: bool,
}

impl Value {
    /// String value.
    pub fn string(s: impl Into<String>) -> Self {
        Self {
            string_value: Some(s.into()),
            ..Self::default()
        }
    }

    /// Integer value.
    pub fn integer(i: i64) -> Self {
        Self {
            integer_value: Some(i.to_string()),
            ..Self::default()
        }
    }

    /// Boolean value.
    pub fn boolean(b: bool) -> Self {
        Self {
            boolean_value: Some(b),
            ..Self::default()
        }
    }

    /// Timestamp value.
    pub fn timestamp(t: DateTime<Utc>) -> Self {
        Self {
            timestamp_value: Some(t),
            ..Self::default()
        }
    }

    /// Explicit null.
    pub fn null() -> Self {
        Self {
            null_value: Some("NULL_VALUE".to_string()),
            ..Self::default()
        }
    }

    /// Exclude this property from indexing (large payloads such as
    /// transcripts).
    #[must_use]
    pub fn unindexed(mut self) -> Self {
        self.exclude_from_indexes = true;
        self
    }
}

/// A stored entity: key plus named properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity key.
    pub key: Key,
    /// Property map, ordered for deterministic serialization.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl Entity {
    /// Entity with no properties yet.
    pub fn new(key: Key) -> Self {
        Self {
            key,
            properties: BTreeMap::new(),
        }
    }

    /// Insert or replace a property.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(name.into(), value);
    }

    /// String property, erroring when absent or differently typed.
    pub fn get_string(&self, name: &str) -> Result<String, DatastoreError> {
        self.properties
            .get(name)
            .and_then(|v| v.string_value.clone())
            .ok_or_else(|| DatastoreError::Property(name.to_string()))
    }

    /// String property, empty string when absent.
    pub fn get_string_or_default(&self, name: &str) -> String {
        self.properties
            .get(name)
            .and_then(|v| v.string_value.clone())
            .unwrap_or_default()
    }

    /// Integer property.
    pub fn get_i64(&self, name: &str) -> Result<i64, DatastoreError> {
        self.properties
            .get(name)
            .and_then(|v| v.integer_value.as_deref())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| DatastoreError::Property(name.to_string()))
    }

    /// Boolean property.
    pub fn get_bool(&self, name: &str) -> Result<bool, DatastoreError> {
        self.properties
            .get(name)
            .and_then(|v| v.boolean_value)
            .ok_or_else(|| DatastoreError::Property(name.to_string()))
    }

    /// Timestamp property, `None` when absent or null.
    pub fn get_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        self.properties.get(name).and_then(|v| v.timestamp_value)
    }
}

/// Sort direction for query ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Property comparison operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Op {
    /// Exact match.
    Equal,
    /// Strictly less than.
    LessThan,
}

#[derive(Serialize)]
struct KindExpression {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PropertyReference {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PropertyFilter {
    property: PropertyReference,
    op: Op,
    value: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompositeFilter {
    op: &'static str,
    filters: Vec<Filter>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum Filter {
    #[serde(rename = "propertyFilter")]
    Property(PropertyFilter),
    #[serde(rename = "compositeFilter")]
    Composite(CompositeFilter),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PropertyOrder {
    property: PropertyReference,
    direction: Direction,
}

/// A structured query over one entity kind.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    kind: Vec<KindExpression>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Filter>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    order: Vec<PropertyOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_cursor: Option<String>,
}

impl Query {
    /// Query all entities of `kind`.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: vec![KindExpression { name: kind.into() }],
            filter: None,
            order: Vec::new(),
            limit: None,
            start_cursor: None,
        }
    }

    /// AND-combine a property comparison into the filter.
    #[must_use]
    pub fn filter(mut self, property: impl Into<String>, op: Op, value: Value) -> Self {
        let next = Filter::Property(PropertyFilter {
            property: PropertyReference {
                name: property.into(),
            },
            op,
            value,
        });
        self.filter = Some(match self.filter.take() {
            None => next,
            Some(Filter::Composite(mut c)) => {
                c.filters.push(next);
                Filter::Composite(c)
            }
            Some(existing) => Filter::Composite(CompositeFilter {
                op: "AND",
                filters: vec![existing, next],
            }),
        });
        self
    }

    /// Append an ordering clause.
    #[must_use]
    pub fn order_by(mut self, property: impl Into<String>, direction: Direction) -> Self {
        self.order.push(PropertyOrder {
            property: PropertyReference {
                name: property.into(),
            },
            direction,
        });
        self
    }

    /// Cap the number of results.
    #[must_use]
    pub fn limit(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Resume after a previously returned cursor.
    #[must_use]
    pub fn start_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.start_cursor = Some(cursor.into());
        self
    }
}
