//! In-memory [`RecordStore`] evaluating conditions over JSON documents.

use super::{
    check_updates, field_path, Condition, Direction, FieldUpdate, Operator, QueryValue,
    RecordStore, StoreError, ValueKind,
};
use crate::record::SaleRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, Value>>,
    create_calls: Mutex<Vec<String>>,
    update_calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with records, bypassing `create` bookkeeping.
    pub fn with_records(records: impl IntoIterator<Item = SaleRecord>) -> Self {
        let store = Self::new();
        {
            let mut docs = store.docs.lock().unwrap();
            for record in records {
                docs.insert(record.id.clone(), serde_json::to_value(&record).unwrap());
            }
        }
        store
    }

    /// Ids passed to `create`, in call order, including rejected ones.
    pub fn create_calls(&self) -> Vec<String> {
        self.create_calls.lock().unwrap().clone()
    }

    /// `(id, fields)` for each `update_fields` call.
    pub fn update_calls(&self) -> Vec<(String, Vec<String>)> {
        self.update_calls.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn record(&self, id: &str) -> Option<SaleRecord> {
        self.docs
            .lock()
            .unwrap()
            .get(id)
            .map(|doc| serde_json::from_value(doc.clone()).unwrap())
    }
}

fn lookup<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(doc, |value, segment| value.get(segment))
        .filter(|value| !value.is_null())
}

fn read_as(value: &Value, kind: ValueKind) -> Option<QueryValue> {
    match kind {
        ValueKind::Text => value.as_str().map(|s| QueryValue::Text(s.to_string())),
        ValueKind::Integer => value.as_i64().map(QueryValue::Integer),
        ValueKind::Bool => value.as_bool().map(QueryValue::Bool),
        ValueKind::Time => value
            .as_str()
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .map(QueryValue::Time),
    }
}

fn matches(doc: &Value, condition: &Condition) -> Result<bool, StoreError> {
    for predicate in &condition.predicates {
        let path = field_path(&predicate.field)?;
        let field = lookup(doc, &path);
        let keep = match (predicate.operator, &predicate.value) {
            (Operator::IsNull, _) => field.is_none(),
            (Operator::IsNotNull, _) => field.is_some(),
            (Operator::Eq, Some(expected)) => {
                field.and_then(|v| read_as(v, expected.kind())).as_ref() == Some(expected)
            }
            (Operator::Gte, Some(expected)) => field
                .and_then(|v| read_as(v, expected.kind()))
                .map(|actual| actual >= *expected)
                .unwrap_or(false),
            (_, None) => {
                return Err(StoreError::InvalidField {
                    field: predicate.field.clone(),
                    message: "comparison without a value".to_string(),
                })
            }
        };
        if !keep {
            return Ok(false);
        }
    }
    Ok(true)
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<SaleRecord, StoreError> {
        let doc = self
            .docs
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        serde_json::from_value(doc).map_err(|e| StoreError::Malformed {
            id: id.to_string(),
            message: e.to_string(),
        })
    }

    async fn list(&self, condition: &Condition) -> Result<Vec<SaleRecord>, StoreError> {
        let docs = self.docs.lock().unwrap();
        let mut selected = Vec::new();
        for doc in docs.values() {
            if matches(doc, condition)? {
                selected.push(doc.clone());
            }
        }

        if let Some(order_by) = &condition.order_by {
            let path = field_path(&order_by.field)?;
            let key = |doc: &Value| lookup(doc, &path).and_then(|v| read_as(v, order_by.kind));
            selected.sort_by(|a, b| {
                let ordering = key(a).partial_cmp(&key(b)).unwrap_or(Ordering::Equal);
                match order_by.direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = condition.limit {
            selected.truncate(limit as usize);
        }

        if selected.is_empty() {
            return Err(StoreError::NotFound("no record matched condition".to_string()));
        }

        selected
            .into_iter()
            .map(|doc| {
                serde_json::from_value(doc).map_err(|e| StoreError::Malformed {
                    id: String::new(),
                    message: e.to_string(),
                })
            })
            .collect()
    }

    async fn create(&self, record: &SaleRecord) -> Result<(), StoreError> {
        self.create_calls.lock().unwrap().push(record.id.clone());

        let mut docs = self.docs.lock().unwrap();
        if docs.contains_key(&record.id) {
            return Err(StoreError::Conflict(record.id.clone()));
        }
        let doc = serde_json::to_value(record).map_err(|e| StoreError::Malformed {
            id: record.id.clone(),
            message: e.to_string(),
        })?;
        docs.insert(record.id.clone(), doc);
        Ok(())
    }

    async fn update_fields(&self, id: &str, updates: &[FieldUpdate]) -> Result<(), StoreError> {
        check_updates(updates)?;
        self.update_calls.lock().unwrap().push((
            id.to_string(),
            updates.iter().map(|u| u.field.clone()).collect(),
        ));

        let mut docs = self.docs.lock().unwrap();
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        for update in updates {
            let path = field_path(&update.field)?;
            let (last, parents) = path.split_last().ok_or_else(|| StoreError::InvalidField {
                field: update.field.clone(),
                message: "empty path".to_string(),
            })?;
            let mut target = &mut *doc;
            for segment in parents {
                target = target
                    .get_mut(segment)
                    .ok_or_else(|| StoreError::InvalidField {
                        field: update.field.clone(),
                        message: "missing parent".to_string(),
                    })?;
            }
            match target.as_object_mut() {
                Some(object) => {
                    object.insert(last.clone(), update.value.clone());
                }
                None => {
                    return Err(StoreError::InvalidField {
                        field: update.field.clone(),
                        message: "parent is not an object".to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fields;
    use crate::record::test_support::sale_at;
    use crate::store::Predicate;

    #[tokio::test]
    async fn test_list_empty_is_not_found() {
        let store = MemoryStore::new();
        let result = store.list(&Condition::new()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_orders_and_limits() {
        let store = MemoryStore::with_records([
            sale_at("b", 200),
            sale_at("a", 300),
            sale_at("c", 100),
        ]);

        let condition = Condition::new()
            .order_by(fields::SALE_TIME, ValueKind::Time, Direction::Desc)
            .limit(2);
        let ids: Vec<String> = store
            .list(&condition)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_nested_field_predicate() {
        let store = MemoryStore::with_records([sale_at("x", 1), sale_at("y", 2)]);
        let condition = Condition::new().filter(Predicate::eq(
            fields::NFT_NAME,
            QueryValue::Text("Bad Bromato #y".to_string()),
        ));
        let found = store.list(&condition).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "y");
    }

    #[tokio::test]
    async fn test_create_is_insert_only() {
        let store = MemoryStore::new();
        store.create(&sale_at("x", 1)).await.unwrap();
        let again = store.create(&sale_at("x", 1)).await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));
        assert_eq!(store.create_calls(), vec!["x", "x"]);
    }

    #[tokio::test]
    async fn test_update_fields_requires_match() {
        let store = MemoryStore::with_records([sale_at("x", 1)]);
        let update = [FieldUpdate::new(fields::MEDIA_ID, serde_json::json!("m"))];

        store.update_fields("x", &update).await.unwrap();
        assert_eq!(store.record("x").unwrap().media_id, "m");

        let missing = store.update_fields("nope", &update).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }
}
