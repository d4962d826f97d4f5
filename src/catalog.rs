//! Source table discovery.
//!
//! One metadata query over `information_schema` yields every column of
//! every table in the configured schemas, with primary key membership
//! resolved through `key_column_usage`/`table_constraints`. Rows are
//! grouped into [`TableDescriptor`]s; configured exclusions are applied
//! afterwards by [`TableFilter`].

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use regex::Regex;
use sqlx::PgPool;
use tracing::info;

use crate::config::PostgresConfiguration;

/// A table eligible for migration.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    /// All columns, in ordinal order.
    pub columns: Vec<Column>,
    /// Primary key columns, in key declaration order. May be empty; such
    /// tables are skipped at admission.
    pub primary_keys: Vec<PrimaryKeyColumn>,
}

impl TableDescriptor {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub udt_name: String,
    pub ordinal: i32,
    pub numeric_precision: Option<i32>,
    pub numeric_scale: Option<i32>,
    pub datetime_precision: Option<i32>,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKeyColumn {
    pub name: String,
    pub udt_name: String,
}

/// Errors raised during table discovery. Any failure here is fatal to the
/// run.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to fetch column metadata: {0}")]
    Query(#[source] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct CatalogRow {
    table_schema: String,
    table_name: String,
    column_name: String,
    udt_name: String,
    ordinal_position: i32,
    numeric_precision: Option<i32>,
    numeric_scale: Option<i32>,
    datetime_precision: Option<i32>,
    pk_ordinal: Option<i32>,
}

/// List all tables in the given schemas with their columns and primary
/// keys.
pub async fn list_tables(
    pool: &PgPool,
    schemas: &[String],
) -> Result<Vec<TableDescriptor>, CatalogError> {
    let query = indoc::indoc! {r#"
        SELECT
            c.table_schema,
            c.table_name,
            c.column_name,
            c.udt_name,
            c.ordinal_position::int4 AS ordinal_position,
            c.numeric_precision::int4 AS numeric_precision,
            c.numeric_scale::int4 AS numeric_scale,
            c.datetime_precision::int4 AS datetime_precision,
            kcu.ordinal_position::int4 AS pk_ordinal
        FROM information_schema.columns c
        LEFT JOIN information_schema.key_column_usage kcu
            ON c.table_schema = kcu.table_schema
            AND c.table_name = kcu.table_name
            AND c.column_name = kcu.column_name
            AND kcu.constraint_name IN (
                SELECT constraint_name
                FROM information_schema.table_constraints
                WHERE table_schema = c.table_schema
                  AND table_name = c.table_name
                  AND constraint_type = 'PRIMARY KEY'
            )
        WHERE c.table_schema = ANY($1)
        ORDER BY c.table_schema, c.table_name, c.ordinal_position
    "#};

    let rows: Vec<CatalogRow> = sqlx::query_as(query)
        .bind(schemas.to_vec())
        .fetch_all(pool)
        .await
        .map_err(CatalogError::Query)?;

    Ok(group_rows(rows))
}

fn group_rows(rows: Vec<CatalogRow>) -> Vec<TableDescriptor> {
    // (pk column, ordinal within the key) collected per table
    let mut pk_columns: IndexMap<(String, String), Vec<(PrimaryKeyColumn, i32)>> = IndexMap::new();
    let mut tables: IndexMap<(String, String), TableDescriptor> = IndexMap::new();

    for row in rows {
        let key = (row.table_schema.clone(), row.table_name.clone());
        let table = tables.entry(key.clone()).or_insert_with(|| TableDescriptor {
            schema: row.table_schema.clone(),
            name: row.table_name.clone(),
            columns: Vec::new(),
            primary_keys: Vec::new(),
        });

        table.columns.push(Column {
            name: row.column_name.clone(),
            udt_name: row.udt_name.clone(),
            ordinal: row.ordinal_position,
            numeric_precision: row.numeric_precision,
            numeric_scale: row.numeric_scale,
            datetime_precision: row.datetime_precision,
            is_primary_key: row.pk_ordinal.is_some(),
        });

        if let Some(pk_ordinal) = row.pk_ordinal {
            pk_columns.entry(key).or_default().push((
                PrimaryKeyColumn {
                    name: row.column_name,
                    udt_name: row.udt_name,
                },
                pk_ordinal,
            ));
        }
    }

    for (key, mut pks) in pk_columns {
        // Key declaration order, not table column order
        pks.sort_by_key(|(_, ordinal)| *ordinal);
        if let Some(table) = tables.get_mut(&key) {
            table.primary_keys = pks.into_iter().map(|(pk, _)| pk).collect();
        }
    }

    tables.into_values().collect()
}

/// Configured table exclusions, applied after [`list_tables`].
#[derive(Debug, Default)]
pub struct TableFilter {
    excluded_schemas: HashSet<String>,
    exact: HashMap<String, HashSet<String>>,
    patterns: HashMap<String, Vec<Regex>>,
}

impl TableFilter {
    /// Build the filter from the source configuration. Regexes were
    /// validated at config load; a failure here is still surfaced.
    pub fn from_config(config: &PostgresConfiguration) -> Result<Self, regex::Error> {
        let excluded_schemas = config.excluded_schemas.iter().cloned().collect();

        let mut exact: HashMap<String, HashSet<String>> = HashMap::new();
        for entry in &config.exclude_tables_list {
            exact
                .entry(entry.schema.clone())
                .or_default()
                .extend(entry.tables.iter().cloned());
        }

        let mut patterns: HashMap<String, Vec<Regex>> = HashMap::new();
        for entry in &config.exclude_table_regex_list {
            let compiled = entry
                .regex
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<Vec<_>, _>>()?;
            patterns.entry(entry.schema.clone()).or_default().extend(compiled);
        }

        Ok(Self {
            excluded_schemas,
            exact,
            patterns,
        })
    }

    pub fn allows(&self, schema: &str, table: &str) -> bool {
        if self.excluded_schemas.contains(schema) {
            return false;
        }
        if self
            .exact
            .get(schema)
            .is_some_and(|tables| tables.contains(table))
        {
            return false;
        }
        if self
            .patterns
            .get(schema)
            .is_some_and(|patterns| patterns.iter().any(|p| p.is_match(table)))
        {
            return false;
        }
        true
    }

    /// Drop excluded tables, logging each exclusion.
    pub fn apply(&self, tables: Vec<TableDescriptor>) -> Vec<TableDescriptor> {
        tables
            .into_iter()
            .filter(|table| {
                let allowed = self.allows(&table.schema, &table.name);
                if !allowed {
                    info!(
                        schema = %table.schema,
                        table = %table.name,
                        "table_excluded_by_filter"
                    );
                }
                allowed
            })
            .collect()
    }
}
