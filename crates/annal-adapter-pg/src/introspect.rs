//! Entity schemas read from the Postgres catalog.

use annal_core::{Column, ColumnType, EntitySchema, SchemaError};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

/// A column as reported by `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

/// One column mapping of a foreign-key constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogForeignKey {
    pub column: String,
    pub foreign_table: String,
    pub foreign_column: String,
}

/// Source of entity schemas for live tables.
#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    /// Describe `db_schema.table` as an unsealed root entity schema.
    ///
    /// Callers add relationships or a discriminator and then seal it.
    async fn introspect_table(
        &self,
        entity_type: &str,
        db_schema: &str,
        table: &str,
    ) -> anyhow::Result<EntitySchema>;
}

/// Build an entity schema from catalog rows.
pub fn schema_from_catalog(
    entity_type: &str,
    db_schema: &str,
    table: &str,
    columns: Vec<CatalogColumn>,
    primary_key: &[String],
    foreign_keys: &[CatalogForeignKey],
) -> Result<EntitySchema, SchemaError> {
    let mut schema = EntitySchema::new(entity_type, table).in_db_schema(db_schema);

    for c in columns {
        let mut column = Column::new(&c.name, ColumnType::from_sql_name(&c.data_type));
        if primary_key.contains(&c.name) {
            column = column.primary_key();
        } else if !c.nullable {
            column = column.not_null();
        }
        if let Some(default) = c.default {
            column = column.default_expr(default);
        }
        for fk in foreign_keys.iter().filter(|fk| fk.column == c.name) {
            column = column.references(&fk.foreign_table, &fk.foreign_column);
        }
        schema.add_column(column)?;
    }

    Ok(schema)
}

/// Introspects tables through a Postgres pool.
pub struct PgIntrospector {
    pool: PgPool,
}

impl PgIntrospector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaIntrospector for PgIntrospector {
    async fn introspect_table(
        &self,
        entity_type: &str,
        db_schema: &str,
        table: &str,
    ) -> anyhow::Result<EntitySchema> {
        // Columns
        let col_rows = sqlx::query(
            r#"
            select column_name, data_type, character_maximum_length::int4 as character_maximum_length,
                   is_nullable, column_default
            from information_schema.columns
            where table_schema = $1 and table_name = $2
            order by ordinal_position
            "#,
        )
        .bind(db_schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if col_rows.is_empty() {
            anyhow::bail!("table {}.{} not found", db_schema, table);
        }

        let mut columns = Vec::new();
        for c in col_rows {
            let data_type: String = c.get("data_type");
            let max_len: Option<i32> = c.get("character_maximum_length");
            let is_nullable: String = c.get("is_nullable");

            columns.push(CatalogColumn {
                name: c.get("column_name"),
                data_type: match max_len {
                    Some(len) if data_type == "character varying" => format!("varchar({})", len),
                    _ => data_type,
                },
                nullable: is_nullable == "YES",
                default: c.get("column_default"),
            });
        }

        // Primary key columns
        let pk_rows = sqlx::query(
            r#"
            select kcu.column_name
            from information_schema.table_constraints tc
            join information_schema.key_column_usage kcu
              on tc.constraint_name = kcu.constraint_name
             and tc.table_schema = kcu.table_schema
            where tc.constraint_type = 'PRIMARY KEY'
              and tc.table_schema = $1
              and tc.table_name = $2
            order by kcu.ordinal_position
            "#,
        )
        .bind(db_schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let primary_key: Vec<String> = pk_rows
            .into_iter()
            .map(|r| r.get::<String, _>("column_name"))
            .collect();

        // Foreign keys, grouped by constraint for stable ordering
        let fk_rows = sqlx::query(
            r#"
            select
              tc.constraint_name,
              kcu.column_name as column_name,
              ccu.table_name as foreign_table_name,
              ccu.column_name as foreign_column_name
            from information_schema.table_constraints tc
            join information_schema.key_column_usage kcu
              on tc.constraint_name = kcu.constraint_name
             and tc.table_schema = kcu.table_schema
            join information_schema.constraint_column_usage ccu
              on ccu.constraint_name = tc.constraint_name
             and ccu.table_schema = tc.table_schema
            where tc.constraint_type = 'FOREIGN KEY'
              and tc.table_schema = $1
              and tc.table_name = $2
            order by tc.constraint_name, kcu.ordinal_position
            "#,
        )
        .bind(db_schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let mut fk_map: BTreeMap<String, Vec<CatalogForeignKey>> = BTreeMap::new();
        for fk in fk_rows {
            let constraint_name: String = fk.get("constraint_name");
            fk_map.entry(constraint_name).or_default().push(CatalogForeignKey {
                column: fk.get("column_name"),
                foreign_table: fk.get("foreign_table_name"),
                foreign_column: fk.get("foreign_column_name"),
            });
        }
        let foreign_keys: Vec<CatalogForeignKey> = fk_map.into_values().flatten().collect();

        Ok(schema_from_catalog(
            entity_type,
            db_schema,
            table,
            columns,
            &primary_key,
            &foreign_keys,
        )?)
    }
}
