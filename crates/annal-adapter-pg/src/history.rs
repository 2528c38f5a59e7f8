//! Revision history queries.
//!
//! One logical revision spans one row per audit level. Levels are joined on
//! record id, never on timestamp.

use annal_audit::{AuditColumn, AuditRegistry, AuditTable, RecordId, ValueMap};
use annal_core::{ColumnType, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{PgConnection, Row};

use crate::{bind_value, qualified_table, quote_ident};

/// One revision of an entity, assembled from every audit level.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub record_id: RecordId,
    pub timestamp: f64,
    pub is_delete: bool,
    /// Business values per audit table, root to leaf.
    pub levels: Vec<(String, ValueMap)>,
}

impl HistoryRow {
    /// Value of `column` on the first level that has it.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.levels.iter().find_map(|(_, values)| values.get(column))
    }
}

fn levels<'a>(registry: &'a AuditRegistry, entity_type: &str) -> anyhow::Result<Vec<&'a AuditTable>> {
    let schema = registry
        .audit_schema(entity_type)
        .ok_or_else(|| anyhow::anyhow!("entity type '{}' is not audited", entity_type))?;
    schema
        .levels
        .iter()
        .map(|id| {
            registry
                .table(*id)
                .ok_or_else(|| anyhow::anyhow!("unknown audit table for '{}'", entity_type))
        })
        .collect()
}

fn record_id_of(table: &AuditTable) -> anyhow::Result<&AuditColumn> {
    table
        .record_id_column()
        .ok_or_else(|| anyhow::anyhow!("audit table '{}' has no record id", table.name))
}

fn alias(level: usize, column: &str) -> String {
    format!("l{}_{}", level, column)
}

fn select_expr(level: usize, column: &AuditColumn) -> anyhow::Result<String> {
    let expr = format!("l{}.{}", level, quote_ident(&column.name)?);
    let expr = match column.column_type {
        ColumnType::Numeric => format!("{}::double precision", expr),
        _ => expr,
    };
    Ok(format!("{} AS {}", expr, quote_ident(&alias(level, &column.name))?))
}

/// Render the history query of `entity_type`, filtered by the source
/// primary key and ordered by timestamp.
pub fn render_history_query(registry: &AuditRegistry, entity_type: &str) -> anyhow::Result<String> {
    let tables = levels(registry, entity_type)?;
    let root = tables
        .first()
        .ok_or_else(|| anyhow::anyhow!("entity type '{}' has no audit levels", entity_type))?;
    let config = registry.config();
    let rec_id = quote_ident(&config.record_id_column())?;

    let mut select = Vec::new();
    for (level, table) in tables.iter().enumerate() {
        for column in table.business_columns() {
            select.push(select_expr(level, column)?);
        }
    }
    select.push(format!("l0.{} AS \"rec_id\"", rec_id));
    select.push(format!(
        "l0.{} AS \"ts\"",
        quote_ident(&config.timestamp_column())?
    ));
    select.push(format!(
        "l0.{} AS \"is_delete\"",
        quote_ident(&config.is_delete_column())?
    ));

    let mut from = format!(
        "{} AS l0",
        qualified_table(root.db_schema.as_deref(), &root.name)?
    );
    for (level, table) in tables.iter().enumerate().skip(1) {
        from.push_str(&format!(
            "\nJOIN {} AS l{} ON l{}.{} = l0.{}",
            qualified_table(table.db_schema.as_deref(), &table.name)?,
            level,
            level,
            rec_id,
            rec_id
        ));
    }

    let mut filters = Vec::new();
    for (idx, column) in root
        .business_columns()
        .iter()
        .filter(|c| c.is_source_key())
        .enumerate()
    {
        filters.push(format!("l0.{} = ${}", quote_ident(&column.name)?, idx + 1));
    }
    if filters.is_empty() {
        anyhow::bail!("audit table '{}' carries no source key", root.name);
    }

    Ok(format!(
        "SELECT {}\nFROM {}\nWHERE {}\nORDER BY l0.{} ASC",
        select.join(", "),
        from,
        filters.join(" AND "),
        quote_ident(&config.timestamp_column())?
    ))
}

fn decode_value(row: &PgRow, name: &str, column_type: &ColumnType) -> anyhow::Result<Value> {
    let value = match column_type {
        ColumnType::Integer => row.try_get::<Option<i32>, _>(name)?.map(|v| Value::Int(v.into())),
        ColumnType::BigInt => row.try_get::<Option<i64>, _>(name)?.map(Value::Int),
        ColumnType::Float | ColumnType::Numeric => {
            row.try_get::<Option<f64>, _>(name)?.map(Value::Float)
        }
        ColumnType::Boolean => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
        ColumnType::Text | ColumnType::VarChar(_) => {
            row.try_get::<Option<String>, _>(name)?.map(Value::Text)
        }
        ColumnType::Date => row
            .try_get::<Option<chrono::NaiveDate>, _>(name)?
            .map(Value::Date),
        ColumnType::Time => row
            .try_get::<Option<chrono::NaiveTime>, _>(name)?
            .map(Value::Time),
        ColumnType::Timestamp => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(name)?
            .map(|ts| Value::Timestamp(ts.and_utc())),
        ColumnType::TimestampTz => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name)?
            .map(Value::Timestamp),
        ColumnType::Uuid => row.try_get::<Option<uuid::Uuid>, _>(name)?.map(Value::Uuid),
        ColumnType::Json => row
            .try_get::<Option<sqlx::types::Json<serde_json::Value>>, _>(name)?
            .map(|j| Value::Json(j.0)),
        ColumnType::Bytes => row.try_get::<Option<Vec<u8>>, _>(name)?.map(Value::Bytes),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Fetch the revision history of the entity whose source primary key is
/// `key`, oldest first.
pub async fn fetch_history(
    conn: &mut PgConnection,
    registry: &AuditRegistry,
    entity_type: &str,
    key: &[Value],
) -> anyhow::Result<Vec<HistoryRow>> {
    let sql = render_history_query(registry, entity_type)?;
    let tables = levels(registry, entity_type)?;
    let root = tables
        .first()
        .ok_or_else(|| anyhow::anyhow!("entity type '{}' has no audit levels", entity_type))?;

    let key_columns: Vec<&AuditColumn> = root
        .business_columns()
        .iter()
        .filter(|c| c.is_source_key())
        .collect();
    if key_columns.len() != key.len() {
        anyhow::bail!(
            "'{}' has a {}-column key, got {} values",
            entity_type,
            key_columns.len(),
            key.len()
        );
    }

    let mut args = PgArguments::default();
    for (column, value) in key_columns.iter().zip(key) {
        bind_value(&mut args, &column.name, &column.column_type, value)?;
    }

    let rows = sqlx::query_with(&sql, args).fetch_all(&mut *conn).await?;
    let record_id_type = record_id_of(root)?.column_type.clone();

    let mut history = Vec::with_capacity(rows.len());
    for row in rows {
        let record_id = match record_id_type {
            ColumnType::Uuid => RecordId::Uuid(row.try_get("rec_id")?),
            _ => RecordId::Sequence(row.try_get("rec_id")?),
        };

        let mut levels = Vec::with_capacity(tables.len());
        for (level, table) in tables.iter().enumerate() {
            let mut values = ValueMap::new();
            for column in table.business_columns() {
                let value = decode_value(&row, &alias(level, &column.name), &column.column_type)?;
                values.insert(column.name.clone(), value);
            }
            levels.push((table.name.clone(), values));
        }

        history.push(HistoryRow {
            record_id,
            timestamp: row.try_get("ts")?,
            is_delete: row.try_get("is_delete")?,
            levels,
        });
    }
    Ok(history)
}
