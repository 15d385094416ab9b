//! Database schema and migrations.

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::debug;

use super::Collection;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    for collection in Collection::ALL {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY,
                document TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
            table = collection.table()
        ))?;
        create_unique_index(conn, collection)?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

/// Create the natural-key unique index for `collection`. An index that
/// already exists is not an error; anything else is.
fn create_unique_index(conn: &Connection, collection: Collection) -> Result<()> {
    let columns: Vec<String> = collection
        .natural_key()
        .iter()
        .map(|field| format!("json_extract(document, '$.{field}')"))
        .collect();
    let sql = format!(
        "CREATE UNIQUE INDEX idx_{table}_natural_key ON {table} ({columns})",
        table = collection.table(),
        columns = columns.join(", ")
    );

    match conn.execute_batch(&sql) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already exists") => {
            debug!(collection = collection.table(), "unique index already exists");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| {
            format!("failed to create unique index on {}", collection.table())
        }),
    }
}
