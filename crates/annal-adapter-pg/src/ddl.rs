//! `CREATE TABLE` rendering for audit tables.
//!
//! Physical column order is business columns in declaration order, then
//! record id, timestamp and is-delete. Tools reading the audit tables with
//! raw SQL rely on it.

use annal_audit::{AuditRegistry, AuditTable};
use sqlx::PgConnection;
use tracing::debug;

use crate::{qualified_table, quote_ident};

fn column_list(columns: &[String]) -> anyhow::Result<String> {
    Ok(columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<anyhow::Result<Vec<_>>>()?
        .join(", "))
}

/// Render the `CREATE TABLE` statement for one audit table.
///
/// `registry` resolves the parent table of a joined level.
pub fn render_create_table(registry: &AuditRegistry, table: &AuditTable) -> anyhow::Result<String> {
    let mut lines = Vec::new();

    for column in table.columns() {
        let mut line = format!(
            "    {} {}",
            quote_ident(&column.name)?,
            column.column_type.sql_name()
        );
        if !column.nullable {
            line.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            line.push_str(" DEFAULT ");
            line.push_str(default);
        }
        lines.push(line);
    }

    let record_id = table
        .record_id_column()
        .ok_or_else(|| anyhow::anyhow!("audit table '{}' has no record id", table.name))?;
    lines.push(format!("    PRIMARY KEY ({})", quote_ident(&record_id.name)?));

    for key in &table.referenced_keys {
        lines.push(format!("    UNIQUE ({})", column_list(key)?));
    }

    if let Some(key) = &table.parent_key {
        let parent = registry
            .table_by_name(&key.ref_table)
            .ok_or_else(|| anyhow::anyhow!("unknown parent audit table '{}'", key.ref_table))?;
        lines.push(format!(
            "    FOREIGN KEY ({}) REFERENCES {} ({})",
            column_list(&key.columns)?,
            qualified_table(parent.db_schema.as_deref(), &parent.name)?,
            column_list(&key.ref_columns)?
        ));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        qualified_table(table.db_schema.as_deref(), &table.name)?,
        lines.join(",\n")
    ))
}

/// Render every audit table of `registry`, parents first.
pub fn render_schema(registry: &AuditRegistry) -> anyhow::Result<Vec<String>> {
    registry
        .tables()
        .iter()
        .map(|t| render_create_table(registry, t))
        .collect()
}

/// Create every audit table of `registry` on `conn`.
///
/// Pass a transaction to make the installation atomic.
pub async fn create_audit_tables(
    conn: &mut PgConnection,
    registry: &AuditRegistry,
) -> anyhow::Result<()> {
    for (table, sql) in registry.tables().iter().zip(render_schema(registry)?) {
        debug!(table = %table.name, "Creating audit table");
        sqlx::query(&sql).execute(&mut *conn).await?;
    }
    Ok(())
}
