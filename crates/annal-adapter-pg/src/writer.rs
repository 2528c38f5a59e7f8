//! INSERT rendering and execution for staged audit rows.

use annal_audit::{AuditColumnKind, AuditRegistry, AuditRow, AuditTable, RecordId};
use annal_core::ColumnType;
use sqlx::postgres::PgArguments;
use sqlx::PgConnection;
use tracing::debug;

use crate::{args_add, bind_value, cast_for, qualified_table, quote_ident};

/// Render the parameterised INSERT for `table`.
///
/// Parameters follow the physical column order.
pub fn render_insert(table: &AuditTable) -> anyhow::Result<String> {
    let mut columns = Vec::new();
    let mut placeholders = Vec::new();

    for (idx, column) in table.columns().enumerate() {
        columns.push(quote_ident(&column.name)?);
        let placeholder = match cast_for(&column.column_type) {
            Some(cast) => format!("${}::{}", idx + 1, cast),
            None => format!("${}", idx + 1),
        };
        placeholders.push(placeholder);
    }

    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified_table(table.db_schema.as_deref(), &table.name)?,
        columns.join(", "),
        placeholders.join(", ")
    ))
}

fn row_arguments(table: &AuditTable, row: &AuditRow) -> anyhow::Result<PgArguments> {
    let mut args = PgArguments::default();

    for column in table.columns() {
        match &column.kind {
            AuditColumnKind::Business { .. } => {
                let value = row.get(&column.name).ok_or_else(|| {
                    anyhow::anyhow!(
                        "audit row for '{}' has no value for column '{}'",
                        table.name,
                        column.name
                    )
                })?;
                bind_value(&mut args, &column.name, &column.column_type, value)?;
            }
            AuditColumnKind::RecordId => match row.record_id {
                RecordId::Uuid(id) => args_add(&mut args, id)?,
                RecordId::Sequence(n) => args_add(&mut args, n)?,
            },
            AuditColumnKind::Timestamp => args_add(&mut args, row.timestamp)?,
            AuditColumnKind::IsDelete => args_add(&mut args, row.is_delete)?,
        }
    }

    Ok(args)
}

/// Insert staged audit rows on `conn`, in the order given.
///
/// Rows must arrive root to leaf, as the Revision Writer stages them, so
/// that each level's parent row exists. Pass the transaction carrying the
/// primary writes so the revisions commit or roll back with them.
pub async fn insert_rows(
    conn: &mut PgConnection,
    registry: &AuditRegistry,
    rows: &[AuditRow],
) -> anyhow::Result<u64> {
    let mut inserted = 0;
    for row in rows {
        let table = registry
            .table_by_name(&row.table)
            .ok_or_else(|| anyhow::anyhow!("unknown audit table '{}'", row.table))?;

        let sql = render_insert(table)?;
        let args = row_arguments(table, row)?;
        let result = sqlx::query_with(&sql, args).execute(&mut *conn).await?;

        debug!(
            table = %row.table,
            record_id = %row.record_id,
            is_delete = row.is_delete,
            "Inserted audit row"
        );
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

/// First unused record id across the root audit tables.
///
/// Pass it to `registry.record_ids().advance_to(..)` when resuming against
/// an existing database.
pub async fn next_sequence_value(
    conn: &mut PgConnection,
    registry: &AuditRegistry,
) -> anyhow::Result<i64> {
    let mut next = 1;
    for table in registry.tables().iter().filter(|t| t.parent.is_none()) {
        let record_id = table
            .record_id_column()
            .ok_or_else(|| anyhow::anyhow!("audit table '{}' has no record id", table.name))?;
        if record_id.column_type != ColumnType::BigInt {
            anyhow::bail!("audit table '{}' does not use sequence record ids", table.name);
        }
        let sql = format!(
            "SELECT COALESCE(MAX({}), 0) FROM {}",
            quote_ident(&record_id.name)?,
            qualified_table(table.db_schema.as_deref(), &table.name)?
        );
        let max = sqlx::query_scalar::<_, i64>(&sql).fetch_one(&mut *conn).await?;
        next = next.max(max + 1);
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use annal_core::{AuditConfig, Column, EntitySchema};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_insert() {
        let mut s = EntitySchema::new("Manager", "managers");
        s.add_column(Column::new("id", ColumnType::Integer).primary_key())
            .unwrap();
        s.add_column(Column::new("budget", ColumnType::Numeric))
            .unwrap();
        let mut registry = AuditRegistry::new(AuditConfig::default()).unwrap();
        let id = registry.make_auditable(s.seal().unwrap()).unwrap().table;

        let sql = render_insert(registry.table(id).unwrap()).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"managers_audit\" (\"id\", \"budget\", \"audit_rec_id\", \
             \"audit_timestamp\", \"audit_isdelete\") VALUES ($1, $2::numeric, $3, $4, $5)"
        );
    }
}
