use super::{
    check_updates, field_path, Condition, Direction, FieldUpdate, Operator, QueryValue,
    RecordStore, StoreError, ValueKind,
};
use crate::config::DatabaseConfig;
use crate::record::SaleRecord;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Stored document row
#[derive(Debug, FromRow)]
struct SaleRow {
    id: String,
    doc: serde_json::Value,
}

impl SaleRow {
    fn into_record(self) -> Result<SaleRecord, StoreError> {
        serde_json::from_value(self.doc).map_err(|e| StoreError::Malformed {
            id: self.id,
            message: e.to_string(),
        })
    }
}

/// Sale records as JSONB documents in PostgreSQL
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

/// Push `(doc #>> $path)` with the cast matching `kind`.
fn push_field(
    builder: &mut QueryBuilder<'_, Postgres>,
    field: &str,
    kind: Option<ValueKind>,
) -> Result<(), StoreError> {
    let path = field_path(field)?;
    builder.push("(doc #>> ");
    builder.push_bind(path);
    builder.push(")");
    builder.push(match kind {
        Some(ValueKind::Integer) => "::bigint",
        Some(ValueKind::Bool) => "::boolean",
        Some(ValueKind::Time) => "::timestamptz",
        Some(ValueKind::Text) | None => "",
    });
    Ok(())
}

fn push_value(builder: &mut QueryBuilder<'_, Postgres>, value: &QueryValue) {
    match value {
        QueryValue::Text(v) => builder.push_bind(v.clone()),
        QueryValue::Integer(v) => builder.push_bind(*v),
        QueryValue::Bool(v) => builder.push_bind(*v),
        QueryValue::Time(v) => builder.push_bind(*v),
    };
}

/// Build the SELECT for a list condition.
fn select_query(condition: &Condition) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    let mut builder = QueryBuilder::new("SELECT id, doc FROM sales WHERE TRUE");

    for predicate in &condition.predicates {
        builder.push(" AND ");
        match (predicate.operator, &predicate.value) {
            (Operator::IsNull, _) => {
                push_field(&mut builder, &predicate.field, None)?;
                builder.push(" IS NULL");
            }
            (Operator::IsNotNull, _) => {
                push_field(&mut builder, &predicate.field, None)?;
                builder.push(" IS NOT NULL");
            }
            (Operator::Eq, Some(value)) => {
                push_field(&mut builder, &predicate.field, Some(value.kind()))?;
                builder.push(" = ");
                push_value(&mut builder, value);
            }
            (Operator::Gte, Some(value)) => {
                push_field(&mut builder, &predicate.field, Some(value.kind()))?;
                builder.push(" >= ");
                push_value(&mut builder, value);
            }
            (_, None) => {
                return Err(StoreError::InvalidField {
                    field: predicate.field.clone(),
                    message: "comparison without a value".to_string(),
                })
            }
        }
    }

    if let Some(order_by) = &condition.order_by {
        builder.push(" ORDER BY ");
        push_field(&mut builder, &order_by.field, Some(order_by.kind))?;
        builder.push(match order_by.direction {
            Direction::Asc => " ASC",
            Direction::Desc => " DESC",
        });
    }

    if let Some(limit) = condition.limit {
        builder.push(" LIMIT ");
        builder.push_bind(i64::from(limit));
    }

    Ok(builder)
}

/// Build the UPDATE nesting one `jsonb_set` per field.
fn update_query(
    id: &str,
    updates: &[FieldUpdate],
) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    check_updates(updates)?;

    let mut builder = QueryBuilder::new("UPDATE sales SET doc = ");
    for _ in updates {
        builder.push("jsonb_set(");
    }
    builder.push("doc");
    for update in updates {
        builder.push(", ");
        builder.push_bind(field_path(&update.field)?);
        builder.push(", ");
        builder.push_bind(update.value.clone());
        builder.push(", true)");
    }
    builder.push(", updated_at = NOW() WHERE id = ");
    builder.push_bind(id.to_string());

    Ok(builder)
}

#[async_trait]
impl RecordStore for PostgresStore {
    async fn get(&self, id: &str) -> Result<SaleRecord, StoreError> {
        let row = sqlx::query_as::<_, SaleRow>("SELECT id, doc FROM sales WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .into_record()
    }

    #[instrument(skip(self, condition), fields(predicates = condition.predicates.len()))]
    async fn list(&self, condition: &Condition) -> Result<Vec<SaleRecord>, StoreError> {
        let mut builder = select_query(condition)?;
        let rows = builder
            .build_query_as::<SaleRow>()
            .fetch_all(&self.pool)
            .await?;

        if rows.is_empty() {
            return Err(StoreError::NotFound("no record matched condition".to_string()));
        }

        rows.into_iter().map(SaleRow::into_record).collect()
    }

    async fn create(&self, record: &SaleRecord) -> Result<(), StoreError> {
        let doc = serde_json::to_value(record).map_err(|e| StoreError::Malformed {
            id: record.id.clone(),
            message: e.to_string(),
        })?;

        let result = sqlx::query("INSERT INTO sales (id, doc) VALUES ($1, $2)")
            .bind(&record.id)
            .bind(&doc)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {
                debug!(sale_id = %record.id, "Sale record created");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Conflict(record.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_fields(&self, id: &str, updates: &[FieldUpdate]) -> Result<(), StoreError> {
        let mut builder = update_query(id, updates)?;
        let result = builder.build().execute(&self.pool).await?;

        match result.rows_affected() {
            1 => Ok(()),
            0 => Err(StoreError::NotFound(id.to_string())),
            n => Err(StoreError::Malformed {
                id: id.to_string(),
                message: format!("update matched {n} records"),
            }),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
