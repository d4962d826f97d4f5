//! Keyset-paginated reads from the source database.
//!
//! Paging never uses `OFFSET`: the first key page is fetched with an
//! inclusive `>=` comparison so the very first row is not skipped, and
//! every subsequent page uses an exclusive `>` against the last key seen.
//! Composite keys compare as tuples, `(a, b) > ($1, $2)`, which is the
//! only sargable form that paginates correctly.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::{Column, PrimaryKeyColumn, TableDescriptor},
    value::{self, KeyTuple, Record, Value},
};

/// An inclusive key interval `lo ≤ key ≤ hi` handed from Stage A to
/// Stage B.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyRange {
    Single { lo: Value, hi: Value },
    Composite { lo: KeyTuple, hi: KeyTuple },
}

/// Errors surfaced by source reads.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("failed to decode column {column}: {source}")]
    Decode {
        column: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SourceError::Cancelled)
    }
}

/// Read operations the pipeline needs from a source database.
///
/// The pipeline is built against this trait (and [`crate::sink::SinkWriter`])
/// so the stages can be exercised with fakes.
#[async_trait]
pub trait SourceReader: Send + Sync + 'static {
    /// The table's minimum key, or `None` for an empty table.
    async fn first_key_single(
        &self,
        table: &TableDescriptor,
        pk: &PrimaryKeyColumn,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, SourceError>;

    /// The table's minimum key tuple under tuple ordering, or `None` for an
    /// empty table.
    async fn first_key_composite(
        &self,
        table: &TableDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Option<KeyTuple>, SourceError>;

    /// Up to `limit` key values `>= cursor` (`> cursor` when not
    /// `inclusive`), ascending.
    async fn fetch_key_page_single(
        &self,
        table: &TableDescriptor,
        pk: &PrimaryKeyColumn,
        cursor: &Value,
        inclusive: bool,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, SourceError>;

    /// Up to `limit` key tuples past `cursor` under tuple comparison,
    /// ascending by the full tuple.
    async fn fetch_key_page_composite(
        &self,
        table: &TableDescriptor,
        cursor: &KeyTuple,
        inclusive: bool,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<KeyTuple>, SourceError>;

    /// All rows in the closed interval `lo ≤ key ≤ hi`, all columns in
    /// declared order.
    async fn fetch_records_range(
        &self,
        table: &TableDescriptor,
        range: &KeyRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, SourceError>;
}

/// [`SourceReader`] over a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PostgresSourceReader {
    pool: PgPool,
}

impl PostgresSourceReader {
    pub fn new(pool: &PgPool) -> Self {
        Self { pool: pool.clone() }
    }
}

macro_rules! cancellable {
    ($cancel:expr, $fut:expr) => {
        tokio::select! {
            biased;
            _ = $cancel.cancelled() => return Err(SourceError::Cancelled),
            res = $fut => res.map_err(SourceError::Query)?,
        }
    };
}

#[async_trait]
impl SourceReader for PostgresSourceReader {
    async fn first_key_single(
        &self,
        table: &TableDescriptor,
        pk: &PrimaryKeyColumn,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, SourceError> {
        let sql = first_key_single_sql(table, pk);
        let row = cancellable!(cancel, sqlx::query(&sql).fetch_optional(&self.pool));
        row.map(|row| decode_key(&row, pk)).transpose()
    }

    async fn first_key_composite(
        &self,
        table: &TableDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Option<KeyTuple>, SourceError> {
        let sql = first_key_composite_sql(table);
        let row = cancellable!(cancel, sqlx::query(&sql).fetch_optional(&self.pool));
        row.map(|row| decode_key_tuple(&row, &table.primary_keys))
            .transpose()
    }

    async fn fetch_key_page_single(
        &self,
        table: &TableDescriptor,
        pk: &PrimaryKeyColumn,
        cursor: &Value,
        inclusive: bool,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, SourceError> {
        let sql = key_page_single_sql(table, pk, inclusive);
        let query = value::bind_key(sqlx::query(&sql), cursor).bind(limit as i64);
        let rows = cancellable!(cancel, query.fetch_all(&self.pool));
        rows.iter().map(|row| decode_key(row, pk)).collect()
    }

    async fn fetch_key_page_composite(
        &self,
        table: &TableDescriptor,
        cursor: &KeyTuple,
        inclusive: bool,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<KeyTuple>, SourceError> {
        let sql = key_page_composite_sql(table, inclusive);
        let query = bind_tuple(sqlx::query(&sql), cursor, &table.primary_keys);
        let query = query.bind(limit as i64);
        let rows = cancellable!(cancel, query.fetch_all(&self.pool));
        rows.iter()
            .map(|row| decode_key_tuple(row, &table.primary_keys))
            .collect()
    }

    async fn fetch_records_range(
        &self,
        table: &TableDescriptor,
        range: &KeyRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, SourceError> {
        let rows = match range {
            KeyRange::Single { lo, hi } => {
                let pk = &table.primary_keys[0];
                let sql = records_range_single_sql(table, pk);
                let query = value::bind_key(value::bind_key(sqlx::query(&sql), lo), hi);
                cancellable!(cancel, query.fetch_all(&self.pool))
            }
            KeyRange::Composite { lo, hi } => {
                let sql = records_range_composite_sql(table);
                let mut query = sqlx::query(&sql);
                for bound in [lo, hi] {
                    query = bind_tuple(query, bound, &table.primary_keys);
                }
                cancellable!(cancel, query.fetch_all(&self.pool))
            }
        };

        rows.iter()
            .map(|row| decode_record(row, &table.columns))
            .collect()
    }
}

/// Bind a key tuple's values in primary key order. Missing entries bind
/// as NULL, which cannot match any key and keeps the query well-formed.
fn bind_tuple<'q>(
    mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    tuple: &KeyTuple,
    pks: &[PrimaryKeyColumn],
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    for pk in pks {
        query = match tuple.get(&pk.name) {
            Some(v) => value::bind_key(query, v),
            None => value::bind_key(query, &Value::Null),
        };
    }
    query
}

fn decode_key(row: &PgRow, pk: &PrimaryKeyColumn) -> Result<Value, SourceError> {
    value::decode_column(row, 0, &pk.udt_name).map_err(|source| SourceError::Decode {
        column: pk.name.clone(),
        source,
    })
}

fn decode_key_tuple(row: &PgRow, pks: &[PrimaryKeyColumn]) -> Result<KeyTuple, SourceError> {
    let mut tuple = KeyTuple::with_capacity(pks.len());
    for (idx, pk) in pks.iter().enumerate() {
        let v = value::decode_column(row, idx, &pk.udt_name).map_err(|source| {
            SourceError::Decode {
                column: pk.name.clone(),
                source,
            }
        })?;
        tuple.insert(pk.name.clone(), v);
    }
    Ok(tuple)
}

fn decode_record(row: &PgRow, columns: &[Column]) -> Result<Record, SourceError> {
    debug_assert_eq!(row.len(), columns.len());
    let mut record = Record::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        let v = value::decode_column(row, idx, &column.udt_name).map_err(|source| {
            SourceError::Decode {
                column: column.name.clone(),
                source,
            }
        })?;
        record.insert(column.name.clone(), v);
    }
    Ok(record)
}

fn quote(ident: &str) -> String {
    pg_escape::quote_identifier(ident).into_owned()
}

fn qualified(table: &TableDescriptor) -> String {
    format!("{}.{}", quote(&table.schema), quote(&table.name))
}

/// `$n` placeholder with a cast to the key column's type, so text-bound
/// values convert server-side and the PK index stays usable.
fn key_param(idx: usize, udt_name: &str) -> String {
    let is_plain = !udt_name.is_empty()
        && udt_name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if is_plain {
        format!("${idx}::{udt_name}")
    } else {
        format!("${idx}::{}", quote(udt_name))
    }
}

fn pk_list(table: &TableDescriptor) -> String {
    table
        .primary_keys
        .iter()
        .map(|pk| quote(&pk.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn pk_param_tuple(table: &TableDescriptor, start: usize) -> String {
    table
        .primary_keys
        .iter()
        .enumerate()
        .map(|(i, pk)| key_param(start + i, &pk.udt_name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Select list with `::text` casts for columns outside the decoded type
/// set.
fn select_list(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|column| {
            let quoted = quote(&column.name);
            if value::needs_text_cast(&column.udt_name) {
                format!("{quoted}::text AS {quoted}")
            } else {
                quoted
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn first_key_single_sql(table: &TableDescriptor, pk: &PrimaryKeyColumn) -> String {
    let pk = quote(&pk.name);
    format!(
        "SELECT {pk} FROM {} ORDER BY {pk} ASC LIMIT 1",
        qualified(table)
    )
}

fn first_key_composite_sql(table: &TableDescriptor) -> String {
    let pks = pk_list(table);
    let order = table
        .primary_keys
        .iter()
        .map(|pk| format!("{} ASC", quote(&pk.name)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {pks} FROM {} ORDER BY {order} LIMIT 1",
        qualified(table)
    )
}

fn key_page_single_sql(table: &TableDescriptor, pk: &PrimaryKeyColumn, inclusive: bool) -> String {
    let compare = if inclusive { ">=" } else { ">" };
    let pk_quoted = quote(&pk.name);
    format!(
        "SELECT {pk_quoted} FROM {} WHERE {pk_quoted} {compare} {} ORDER BY {pk_quoted} LIMIT $2",
        qualified(table),
        key_param(1, &pk.udt_name),
    )
}

fn key_page_composite_sql(table: &TableDescriptor, inclusive: bool) -> String {
    let compare = if inclusive { ">=" } else { ">" };
    let pks = pk_list(table);
    let params = pk_param_tuple(table, 1);
    let limit_idx = table.primary_keys.len() + 1;
    format!(
        "SELECT {pks} FROM {} WHERE ({pks}) {compare} ({params}) ORDER BY {pks} LIMIT ${limit_idx}",
        qualified(table),
    )
}

fn records_range_single_sql(table: &TableDescriptor, pk: &PrimaryKeyColumn) -> String {
    let pk_quoted = quote(&pk.name);
    format!(
        "SELECT {} FROM {} WHERE {pk_quoted} >= {} AND {pk_quoted} <= {} ORDER BY {pk_quoted}",
        select_list(&table.columns),
        qualified(table),
        key_param(1, &pk.udt_name),
        key_param(2, &pk.udt_name),
    )
}

fn records_range_composite_sql(table: &TableDescriptor) -> String {
    let pks = pk_list(table);
    let lo_params = pk_param_tuple(table, 1);
    let hi_params = pk_param_tuple(table, table.primary_keys.len() + 1);
    format!(
        "SELECT {} FROM {} WHERE ({pks}) >= ({lo_params}) AND ({pks}) <= ({hi_params}) ORDER BY {pks}",
        select_list(&table.columns),
        qualified(table),
    )
}
