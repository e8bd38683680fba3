//! Record store gateway.
//!
//! The store holds [`SaleRecord`] documents keyed by id. It supports point
//! lookups, filtered and ordered listing, insert-only creation and targeted
//! field updates. Field paths use `.` to address nested fields; the gateway
//! splits them and never splices them into query text.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use crate::record::{fields, SaleRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use postgres::PostgresStore;

/// Record store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No record matched: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Malformed record {id}: {message}")]
    Malformed { id: String, message: String },

    #[error("Invalid field {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// `NotFound` is the "nothing matched" signal, not a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Predicate operators understood by every store implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Gte,
    IsNull,
    IsNotNull,
}

/// Typed comparison value; the type decides how the stored field is read.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub enum QueryValue {
    Text(String),
    Integer(i64),
    Bool(bool),
    Time(DateTime<Utc>),
}

impl QueryValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            QueryValue::Text(_) => ValueKind::Text,
            QueryValue::Integer(_) => ValueKind::Integer,
            QueryValue::Bool(_) => ValueKind::Bool,
            QueryValue::Time(_) => ValueKind::Time,
        }
    }
}

/// How a field is interpreted for comparison and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Integer,
    Bool,
    Time,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub operator: Operator,
    pub value: Option<QueryValue>,
}

impl Predicate {
    pub fn eq(field: &str, value: QueryValue) -> Self {
        Self {
            field: field.to_string(),
            operator: Operator::Eq,
            value: Some(value),
        }
    }

    pub fn gte(field: &str, value: QueryValue) -> Self {
        Self {
            field: field.to_string(),
            operator: Operator::Gte,
            value: Some(value),
        }
    }

    pub fn is_null(field: &str) -> Self {
        Self {
            field: field.to_string(),
            operator: Operator::IsNull,
            value: None,
        }
    }

    pub fn is_not_null(field: &str) -> Self {
        Self {
            field: field.to_string(),
            operator: Operator::IsNotNull,
            value: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub kind: ValueKind,
    pub direction: Direction,
}

/// Filter, ordering and limit for [`RecordStore::list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    pub predicates: Vec<Predicate>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u32>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn order_by(mut self, field: &str, kind: ValueKind, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            kind,
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A single field assignment for [`RecordStore::update_fields`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub field: String,
    pub value: serde_json::Value,
}

impl FieldUpdate {
    pub fn new(field: &str, value: serde_json::Value) -> Self {
        Self {
            field: field.to_string(),
            value,
        }
    }
}

/// Fields that never change once a record exists.
const IMMUTABLE_FIELDS: &[&str] = &[fields::ID, fields::SALE_TIME, fields::CREATED_AT];

/// Split a dotted field name into path segments.
pub(crate) fn field_path(field: &str) -> Result<Vec<String>, StoreError> {
    let path: Vec<String> = field.split('.').map(str::to_string).collect();
    if path.iter().any(|segment| segment.is_empty()) {
        return Err(StoreError::InvalidField {
            field: field.to_string(),
            message: "empty path segment".to_string(),
        });
    }
    Ok(path)
}

/// Reject empty or immutable-field updates before they reach the store.
pub(crate) fn check_updates(updates: &[FieldUpdate]) -> Result<(), StoreError> {
    if updates.is_empty() {
        return Err(StoreError::InvalidField {
            field: String::new(),
            message: "no fields to update".to_string(),
        });
    }
    for update in updates {
        if IMMUTABLE_FIELDS.contains(&update.field.as_str()) {
            return Err(StoreError::InvalidField {
                field: update.field.clone(),
                message: "field is immutable".to_string(),
            });
        }
        field_path(&update.field)?;
    }
    Ok(())
}

/// Typed facade over the document store holding sale records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch one record by id, or `NotFound`.
    async fn get(&self, id: &str) -> Result<SaleRecord, StoreError>;

    /// List matching records. An empty result is `NotFound`.
    async fn list(&self, condition: &Condition) -> Result<Vec<SaleRecord>, StoreError>;

    /// Insert a new record; `Conflict` if the id already exists.
    async fn create(&self, record: &SaleRecord) -> Result<(), StoreError>;

    /// Update fields of exactly one record; `NotFound` if none matched.
    async fn update_fields(&self, id: &str, updates: &[FieldUpdate]) -> Result<(), StoreError>;

    /// Round-trip to the backing store, used by readiness checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Whether a record with this id exists.
pub async fn contains(store: &dyn RecordStore, id: &str) -> Result<bool, StoreError> {
    match store.get(id).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
