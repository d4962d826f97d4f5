//! In-memory fakes of the source and sink for pipeline scenarios.
#![allow(dead_code)]

use std::{
    cmp::Ordering,
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
    },
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use dorisync::{
    catalog::{Column, PrimaryKeyColumn, TableDescriptor},
    sink::{SinkError, SinkWriter},
    source::{KeyRange, SourceError, SourceReader},
    value::{KeyTuple, Record, Value},
};

pub fn column(name: &str, udt: &str, ordinal: i32, is_pk: bool) -> Column {
    Column {
        name: name.to_string(),
        udt_name: udt.to_string(),
        ordinal,
        numeric_precision: None,
        numeric_scale: None,
        datetime_precision: None,
        is_primary_key: is_pk,
    }
}

/// `(id int8 primary key, val text)`
pub fn int_table(schema: &str, name: &str) -> TableDescriptor {
    TableDescriptor {
        schema: schema.to_string(),
        name: name.to_string(),
        columns: vec![column("id", "int8", 1, true), column("val", "text", 2, false)],
        primary_keys: vec![PrimaryKeyColumn {
            name: "id".to_string(),
            udt_name: "int8".to_string(),
        }],
    }
}

/// `(tenant int4, id uuid, payload text)` with primary key `(tenant, id)`.
pub fn composite_table(schema: &str, name: &str) -> TableDescriptor {
    TableDescriptor {
        schema: schema.to_string(),
        name: name.to_string(),
        columns: vec![
            column("tenant", "int4", 1, true),
            column("id", "uuid", 2, true),
            column("payload", "text", 3, false),
        ],
        primary_keys: vec![
            PrimaryKeyColumn {
                name: "tenant".to_string(),
                udt_name: "int4".to_string(),
            },
            PrimaryKeyColumn {
                name: "id".to_string(),
                udt_name: "uuid".to_string(),
            },
        ],
    }
}

/// A table descriptor with no primary key columns.
pub fn pkless_table(schema: &str, name: &str) -> TableDescriptor {
    TableDescriptor {
        schema: schema.to_string(),
        name: name.to_string(),
        columns: vec![column("line", "text", 1, false)],
        primary_keys: vec![],
    }
}

/// Rows `(id, val)` for an [`int_table`], ids taken from the iterator.
pub fn int_rows(ids: impl IntoIterator<Item = i64>) -> Vec<Record> {
    ids.into_iter()
        .map(|id| {
            let mut record = Record::new();
            record.insert("id".to_string(), Value::Int(id));
            record.insert("val".to_string(), Value::Text(format!("row-{id}")));
            record
        })
        .collect()
}

pub fn composite_row(tenant: i64, id: uuid::Uuid, payload: &str) -> Record {
    let mut record = Record::new();
    record.insert("tenant".to_string(), Value::Int(tenant));
    record.insert("id".to_string(), Value::Uuid(id));
    record.insert("payload".to_string(), Value::Text(payload.to_string()));
    record
}

fn cmp_value(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Uuid(x), Value::Uuid(y)) => x.cmp(y),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        _ => panic!("fake source cannot compare {a:?} with {b:?}"),
    }
}

fn cmp_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match cmp_value(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn key_of(record: &Record, pks: &[PrimaryKeyColumn]) -> Vec<Value> {
    pks.iter()
        .map(|pk| record.get(&pk.name).cloned().expect("pk column present"))
        .collect()
}

fn tuple_to_key(tuple: &KeyTuple, pks: &[PrimaryKeyColumn]) -> Vec<Value> {
    pks.iter()
        .map(|pk| tuple.get(&pk.name).cloned().expect("pk column present"))
        .collect()
}

fn key_to_tuple(key: &[Value], pks: &[PrimaryKeyColumn]) -> KeyTuple {
    let mut tuple = KeyTuple::new();
    for (pk, value) in pks.iter().zip(key.iter()) {
        tuple.insert(pk.name.clone(), value.clone());
    }
    tuple
}

/// A key-page call observed by the fake, for cursor-semantics assertions.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPageCall {
    pub cursor: Vec<Value>,
    pub inclusive: bool,
    pub returned: usize,
}

/// In-memory [`SourceReader`] over pre-sorted rows.
#[derive(Default)]
pub struct FakeSource {
    tables: HashMap<(String, String), Vec<Record>>,
    /// Range whose `lo` equals this value fails with a query error.
    fail_range_lo: Option<Value>,
    pub key_page_calls: Mutex<Vec<KeyPageCall>>,
    pub range_calls: Mutex<Vec<KeyRange>>,
    pub calls_after_cancel: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: &TableDescriptor, mut rows: Vec<Record>) -> Self {
        let pks = table.primary_keys.clone();
        if !pks.is_empty() {
            rows.sort_by(|a, b| cmp_keys(&key_of(a, &pks), &key_of(b, &pks)));
        }
        self.tables
            .insert((table.schema.clone(), table.name.clone()), rows);
        self
    }

    /// Make `fetch_records_range` fail for the range starting at `lo`.
    pub fn failing_range_at(mut self, lo: Value) -> Self {
        self.fail_range_lo = Some(lo);
        self
    }

    fn rows(&self, table: &TableDescriptor) -> &[Record] {
        self.tables
            .get(&(table.schema.clone(), table.name.clone()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn guard(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
        if cancel.is_cancelled() {
            self.calls_after_cancel
                .fetch_add(1, AtomicOrdering::Relaxed);
            return Err(SourceError::Cancelled);
        }
        Ok(())
    }

    fn page(
        &self,
        table: &TableDescriptor,
        cursor: &[Value],
        inclusive: bool,
        limit: usize,
    ) -> Vec<Vec<Value>> {
        let pks = &table.primary_keys;
        let keys: Vec<Vec<Value>> = self
            .rows(table)
            .iter()
            .map(|row| key_of(row, pks))
            .filter(|key| {
                let ord = cmp_keys(key, cursor);
                ord == Ordering::Greater || (inclusive && ord == Ordering::Equal)
            })
            .take(limit)
            .collect();

        self.key_page_calls.lock().unwrap().push(KeyPageCall {
            cursor: cursor.to_vec(),
            inclusive,
            returned: keys.len(),
        });
        keys
    }
}

#[async_trait]
impl SourceReader for FakeSource {
    async fn first_key_single(
        &self,
        table: &TableDescriptor,
        _pk: &PrimaryKeyColumn,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, SourceError> {
        self.guard(cancel)?;
        Ok(self
            .rows(table)
            .first()
            .map(|row| key_of(row, &table.primary_keys)[0].clone()))
    }

    async fn first_key_composite(
        &self,
        table: &TableDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Option<KeyTuple>, SourceError> {
        self.guard(cancel)?;
        Ok(self.rows(table).first().map(|row| {
            key_to_tuple(&key_of(row, &table.primary_keys), &table.primary_keys)
        }))
    }

    async fn fetch_key_page_single(
        &self,
        table: &TableDescriptor,
        _pk: &PrimaryKeyColumn,
        cursor: &Value,
        inclusive: bool,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, SourceError> {
        self.guard(cancel)?;
        Ok(self
            .page(table, std::slice::from_ref(cursor), inclusive, limit)
            .into_iter()
            .map(|mut key| key.remove(0))
            .collect())
    }

    async fn fetch_key_page_composite(
        &self,
        table: &TableDescriptor,
        cursor: &KeyTuple,
        inclusive: bool,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<KeyTuple>, SourceError> {
        self.guard(cancel)?;
        let cursor = tuple_to_key(cursor, &table.primary_keys);
        Ok(self
            .page(table, &cursor, inclusive, limit)
            .into_iter()
            .map(|key| key_to_tuple(&key, &table.primary_keys))
            .collect())
    }

    async fn fetch_records_range(
        &self,
        table: &TableDescriptor,
        range: &KeyRange,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>, SourceError> {
        self.guard(cancel)?;
        self.range_calls.lock().unwrap().push(range.clone());

        let pks = &table.primary_keys;
        let (lo, hi) = match range {
            KeyRange::Single { lo, hi } => (vec![lo.clone()], vec![hi.clone()]),
            KeyRange::Composite { lo, hi } => {
                (tuple_to_key(lo, pks), tuple_to_key(hi, pks))
            }
        };

        if self.fail_range_lo.as_ref() == Some(&lo[0]) {
            return Err(SourceError::Query(sqlx::Error::RowNotFound));
        }

        Ok(self
            .rows(table)
            .iter()
            .filter(|row| {
                let key = key_of(row, pks);
                cmp_keys(&key, &lo) != Ordering::Less && cmp_keys(&key, &hi) != Ordering::Greater
            })
            .cloned()
            .collect())
    }
}

/// One upload attempt observed by the fake sink.
#[derive(Debug, Clone)]
pub struct Upload {
    pub table: String,
    pub label: String,
    pub records: usize,
    pub ok: bool,
}

/// In-memory [`SinkWriter`] recording every upload attempt.
#[derive(Default)]
pub struct FakeSink {
    pub uploads: Mutex<Vec<Upload>>,
    fail_plan: Mutex<VecDeque<bool>>,
    cancel_after_first_success: Mutex<Option<CancellationToken>>,
    pub started_after_cancel: AtomicUsize,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-call failure plan; calls beyond the plan succeed.
    pub fn failing(self, plan: impl IntoIterator<Item = bool>) -> Self {
        *self.fail_plan.lock().unwrap() = plan.into_iter().collect();
        self
    }

    /// Fire the token right after the first successful upload.
    pub fn cancelling_after_first_success(self, token: CancellationToken) -> Self {
        *self.cancel_after_first_success.lock().unwrap() = Some(token);
        self
    }

    pub fn successful_batches(&self) -> Vec<usize> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.ok)
            .map(|u| u.records)
            .collect()
    }

    pub fn labels(&self) -> Vec<String> {
        self.uploads
            .lock()
            .unwrap()
            .iter()
            .map(|u| u.label.clone())
            .collect()
    }

    pub fn uploaded_records(&self) -> usize {
        self.successful_batches().iter().sum()
    }
}

#[async_trait]
impl SinkWriter for FakeSink {
    async fn upload(
        &self,
        table: &str,
        payload: String,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SinkError> {
        if cancel.is_cancelled() {
            self.started_after_cancel
                .fetch_add(1, AtomicOrdering::Relaxed);
            return Err(SinkError::Cancelled);
        }

        // The payload must always be a parseable JSON array.
        let records: Vec<serde_json::Value> =
            serde_json::from_str(&payload).expect("payload is a JSON array");

        let fail = self.fail_plan.lock().unwrap().pop_front().unwrap_or(false);
        self.uploads.lock().unwrap().push(Upload {
            table: table.to_string(),
            label: label.to_string(),
            records: records.len(),
            ok: !fail,
        });

        if fail {
            return Err(SinkError::Status {
                label: label.to_string(),
                status: "500 Internal Server Error".to_string(),
                body: "[INTERNAL_ERROR]".to_string(),
            });
        }

        if let Some(token) = self.cancel_after_first_success.lock().unwrap().take() {
            token.cancel();
        }
        Ok(())
    }
}
