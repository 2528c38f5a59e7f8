//! # annal-adapter-pg
//!
//! Postgres persistence for Annal audit tables.
//!
//! - [`ddl`]: `CREATE TABLE` statements for every audit table of a registry
//! - [`writer`]: parameterised INSERTs for staged audit rows, executed on the
//!   caller's transaction so revisions commit or roll back with the primary
//!   writes
//! - [`history`]: revision history of one entity, joining every audit level
//!   on record id
//! - [`introspect`]: build an [`annal_core::EntitySchema`] from
//!   `information_schema`

use annal_audit::AuditRegistry;
use annal_core::{ColumnType, RecordIdStrategy, Value};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::{Arguments, PgPool};
use tracing::info;

pub mod ddl;
pub mod history;
pub mod introspect;
pub mod writer;

pub use ddl::{create_audit_tables, render_create_table, render_schema};
pub use history::{HistoryRow, fetch_history, render_history_query};
pub use introspect::{
    CatalogColumn, CatalogForeignKey, PgIntrospector, SchemaIntrospector, schema_from_catalog,
};
pub use writer::{insert_rows, next_sequence_value, render_insert};

fn args_add<T>(args: &mut PgArguments, v: T) -> anyhow::Result<()>
where
    T: Send + Sync + 'static,
    for<'q> T: sqlx::Encode<'q, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    args.add(v).map_err(|e| anyhow::anyhow!(e))
}

pub(crate) fn quote_ident(ident: &str) -> anyhow::Result<String> {
    if ident.is_empty() {
        return Err(anyhow::anyhow!("empty identifier"));
    }
    // Only generator-produced identifiers are expected.
    if !ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(anyhow::anyhow!("invalid identifier '{}'", ident));
    }
    Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
}

pub(crate) fn qualified_table(db_schema: Option<&str>, table: &str) -> anyhow::Result<String> {
    match db_schema {
        Some(schema) => Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?)),
        None => quote_ident(table),
    }
}

/// Explicit cast for parameters bound as text.
pub(crate) fn cast_for(column_type: &ColumnType) -> Option<&'static str> {
    match column_type {
        ColumnType::Numeric => Some("numeric"),
        _ => None,
    }
}

/// Bind `value` as a parameter for a column of `column_type`.
pub(crate) fn bind_value(
    args: &mut PgArguments,
    column: &str,
    column_type: &ColumnType,
    value: &Value,
) -> anyhow::Result<()> {
    let mismatch = || {
        anyhow::anyhow!(
            "value {} does not fit column '{}' of type {}",
            value,
            column,
            column_type
        )
    };

    if value.is_null() {
        // Bind a NULL of an appropriate type.
        return match column_type {
            ColumnType::Integer | ColumnType::BigInt => args_add(args, Option::<i64>::None),
            ColumnType::Float => args_add(args, Option::<f64>::None),
            ColumnType::Boolean => args_add(args, Option::<bool>::None),
            ColumnType::Date => args_add(args, Option::<chrono::NaiveDate>::None),
            ColumnType::Time => args_add(args, Option::<chrono::NaiveTime>::None),
            ColumnType::Timestamp => args_add(args, Option::<chrono::NaiveDateTime>::None),
            ColumnType::TimestampTz => {
                args_add(args, Option::<chrono::DateTime<chrono::Utc>>::None)
            }
            ColumnType::Uuid => args_add(args, Option::<uuid::Uuid>::None),
            ColumnType::Json => {
                args_add(args, Option::<sqlx::types::Json<serde_json::Value>>::None)
            }
            ColumnType::Bytes => args_add(args, Option::<Vec<u8>>::None),
            ColumnType::Numeric | ColumnType::Text | ColumnType::VarChar(_) => {
                args_add(args, Option::<String>::None)
            }
        };
    }

    match column_type {
        ColumnType::Integer | ColumnType::BigInt => {
            args_add(args, value.as_i64().ok_or_else(mismatch)?)
        }
        ColumnType::Float => args_add(args, value.as_f64().ok_or_else(mismatch)?),
        // Bound as text and cast in SQL.
        ColumnType::Numeric => match value {
            Value::Int(n) => args_add(args, n.to_string()),
            Value::Float(f) => args_add(args, f.to_string()),
            Value::Text(s) => args_add(args, s.clone()),
            _ => Err(mismatch()),
        },
        ColumnType::Boolean => args_add(args, value.as_bool().ok_or_else(mismatch)?),
        ColumnType::Date => match value {
            Value::Date(d) => args_add(args, *d),
            _ => Err(mismatch()),
        },
        ColumnType::Time => match value {
            Value::Time(t) => args_add(args, *t),
            _ => Err(mismatch()),
        },
        ColumnType::Timestamp => match value {
            Value::Timestamp(ts) => args_add(args, ts.naive_utc()),
            _ => Err(mismatch()),
        },
        ColumnType::TimestampTz => match value {
            Value::Timestamp(ts) => args_add(args, *ts),
            _ => Err(mismatch()),
        },
        ColumnType::Uuid => match value {
            Value::Uuid(u) => args_add(args, *u),
            Value::Text(s) => args_add(args, uuid::Uuid::parse_str(s)?),
            _ => Err(mismatch()),
        },
        ColumnType::Json => match value {
            Value::Json(v) => args_add(args, sqlx::types::Json(v.clone())),
            other => args_add(args, sqlx::types::Json(serde_json::to_value(other)?)),
        },
        ColumnType::Bytes => match value {
            Value::Bytes(b) => args_add(args, b.clone()),
            _ => Err(mismatch()),
        },
        ColumnType::Text | ColumnType::VarChar(_) => match value {
            Value::Text(s) => args_add(args, s.clone()),
            other => args_add(args, other.to_string()),
        },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PgAuditStoreOptions {
    pub max_connections: u32,
}

impl Default for PgAuditStoreOptions {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// Connection pool bound to the audit tables of one registry.
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub async fn new(database_url: &str, options: PgAuditStoreOptions) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create every audit table of `registry` in one transaction.
    pub async fn install(&self, registry: &AuditRegistry) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        create_audit_tables(&mut tx, registry).await?;
        tx.commit().await?;
        info!(tables = registry.tables().len(), "Audit tables installed");
        Ok(())
    }

    /// Advance the registry's sequence past every record id already stored.
    ///
    /// Does nothing under the `uuid` strategy.
    pub async fn resume_record_ids(&self, registry: &AuditRegistry) -> anyhow::Result<()> {
        if registry.record_ids().strategy() != RecordIdStrategy::Sequence {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await?;
        let next = next_sequence_value(&mut conn, registry).await?;
        registry.record_ids().advance_to(next);
        info!(next, "Record id sequence resumed");
        Ok(())
    }

    /// Revision history of the entity of `entity_type` whose source primary
    /// key equals `key`, oldest first.
    pub async fn history(
        &self,
        registry: &AuditRegistry,
        entity_type: &str,
        key: &[Value],
    ) -> anyhow::Result<Vec<HistoryRow>> {
        let mut conn = self.pool.acquire().await?;
        fetch_history(&mut conn, registry, entity_type, key).await
    }
}
