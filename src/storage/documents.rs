//! Document collections keyed by natural keys.
//!
//! Each collection is a table of JSON documents. Lookups match top-level
//! fields with `json_extract`, and the natural-key fields carry a unique
//! expression index (see `schema`). Only a single writer per database is
//! supported: read-modify-write of a document is not guarded against
//! concurrent writers.

use anyhow::{bail, Context, Result};
use rusqlite::{types::Value as SqlValue, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::record::DocId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    TestCaseInfo,
    DutInfo,
    HostInfo,
    CiInfo,
    TestExecutionResults,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::TestCaseInfo,
        Collection::DutInfo,
        Collection::HostInfo,
        Collection::CiInfo,
        Collection::TestExecutionResults,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Collection::TestCaseInfo => "test_case_info",
            Collection::DutInfo => "dut_info",
            Collection::HostInfo => "host_info",
            Collection::CiInfo => "ci_info",
            Collection::TestExecutionResults => "test_execution_results",
        }
    }

    /// Top-level document fields forming the unique natural key.
    pub fn natural_key(&self) -> &'static [&'static str] {
        match self {
            Collection::TestCaseInfo => &["test_case_id", "test_suite_name"],
            Collection::DutInfo => &["vendor_id", "product_id", "serial_number"],
            Collection::HostInfo => &["mac_address"],
            Collection::CiInfo => &["ci_job_name", "ci_job_build_id"],
            Collection::TestExecutionResults => &["run_set_id"],
        }
    }

    /// Build the natural-key query for `document`.
    pub fn key_query(&self, document: &Value) -> Map<String, Value> {
        self.natural_key()
            .iter()
            .map(|field| {
                (
                    field.to_string(),
                    document.get(*field).cloned().unwrap_or(Value::Null),
                )
            })
            .collect()
    }
}

/// Look up the first document matching every field of `query`.
pub fn find_document(
    conn: &Connection,
    collection: Collection,
    query: &Map<String, Value>,
) -> Result<Option<(DocId, Value)>> {
    let (clause, params) = where_clause(query)?;
    let sql = format!(
        "SELECT id, document FROM {} WHERE {clause} ORDER BY id LIMIT 1",
        collection.table()
    );
    let row: Option<(DocId, String)> = conn
        .query_row(&sql, rusqlite::params_from_iter(params), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .optional()?;

    match row {
        Some((id, text)) => {
            let doc = serde_json::from_str(&text).with_context(|| {
                format!("corrupt document {id} in {}", collection.table())
            })?;
            Ok(Some((id, doc)))
        }
        None => Ok(None),
    }
}

/// Upsert by natural key: return the id of the document matching `query`,
/// merging `document`'s top-level fields into it when `update_existing` is
/// set, or insert `document` and return the new id.
pub fn find_or_update_document(
    conn: &Connection,
    collection: Collection,
    query: &Map<String, Value>,
    document: &Value,
    update_existing: bool,
) -> Result<DocId> {
    if let Some((id, mut existing)) = find_document(conn, collection, query)? {
        if update_existing {
            merge_top_level(&mut existing, document);
            replace_document(conn, collection, id, &existing)?;
        }
        return Ok(id);
    }

    conn.execute(
        &format!("INSERT INTO {} (document) VALUES (?1)", collection.table()),
        [serde_json::to_string(document)?],
    )
    .with_context(|| format!("failed to insert into {}", collection.table()))?;
    Ok(conn.last_insert_rowid())
}

/// Overwrite the document stored under `id`.
pub fn replace_document(
    conn: &Connection,
    collection: Collection,
    id: DocId,
    document: &Value,
) -> Result<()> {
    let changed = conn.execute(
        &format!(
            "UPDATE {} SET document = ?1, updated_at = datetime('now') WHERE id = ?2",
            collection.table()
        ),
        rusqlite::params![serde_json::to_string(document)?, id],
    )?;
    if changed == 0 {
        bail!("no document {id} in {}", collection.table());
    }
    Ok(())
}

/// Load a document by id.
pub fn get_document(conn: &Connection, collection: Collection, id: DocId) -> Result<Option<Value>> {
    let text: Option<String> = conn
        .query_row(
            &format!("SELECT document FROM {} WHERE id = ?1", collection.table()),
            [id],
            |row| row.get(0),
        )
        .optional()?;
    text.map(|t| serde_json::from_str(&t).map_err(anyhow::Error::from))
        .transpose()
}

fn where_clause(query: &Map<String, Value>) -> Result<(String, Vec<SqlValue>)> {
    if query.is_empty() {
        bail!("empty document query");
    }
    let mut clauses = Vec::with_capacity(query.len());
    let mut params = Vec::with_capacity(query.len());
    for (i, (field, value)) in query.iter().enumerate() {
        if !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("invalid query field `{field}`");
        }
        clauses.push(format!("json_extract(document, '$.{field}') IS ?{}", i + 1));
        params.push(sql_scalar(field, value)?);
    }
    Ok((clauses.join(" AND "), params))
}

/// Map a JSON scalar to the SQL value `json_extract` yields for it.
fn sql_scalar(field: &str, value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            bail!("query field `{field}` must be a scalar")
        }
    })
}

fn merge_top_level(target: &mut Value, update: &Value) {
    match (target.as_object_mut(), update.as_object()) {
        (Some(target), Some(update)) => {
            for (k, v) in update {
                target.insert(k.clone(), v.clone());
            }
        }
        _ => *target = update.clone(),
    }
}
