//! Numbered schema migrations for the SQLite store.
//!
//! SQL files are embedded with `include_str!` and applied in order, each in
//! its own transaction together with its `schema_version` row. The row keeps
//! a SHA-256 of the applied SQL so an edited migration is caught on open
//! instead of silently diverging from the deployed schema.

use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

use crate::store::StoreError;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: include_str!("migrations/001_baseline.sql"),
    },
    Migration {
        version: 2,
        name: "opportunity_index",
        sql: include_str!("migrations/002_opportunity_index.sql"),
    },
];

fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// Applied versions with the checksum recorded at apply time.
fn applied_versions(conn: &Connection) -> Result<BTreeMap<u32, String>, StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            checksum TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    let mut stmt = conn.prepare("SELECT version, checksum FROM schema_version ORDER BY version")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)))?;
    let mut applied = BTreeMap::new();
    for row in rows {
        let (version, sum) = row?;
        applied.insert(version, sum);
    }
    Ok(applied)
}

/// Bring the schema up to date. Returns how many migrations ran.
pub fn run_migrations(conn: &Connection) -> Result<usize, StoreError> {
    let applied = applied_versions(conn)?;
    let latest_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    if let Some((&newest, _)) = applied.iter().next_back() {
        if newest > latest_known {
            return Err(StoreError::Migration(format!(
                "store schema v{} is newer than this build (v{})",
                newest, latest_known
            )));
        }
    }

    let mut ran = 0;
    for migration in MIGRATIONS {
        let expected = checksum(migration.sql);
        if let Some(recorded) = applied.get(&migration.version) {
            if *recorded != expected {
                return Err(StoreError::Migration(format!(
                    "migration v{} ({}) changed after it was applied",
                    migration.version, migration.name
                )));
            }
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql).map_err(|e| {
            StoreError::Migration(format!("v{} ({}): {}", migration.version, migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_version (version, name, checksum) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, expected],
        )?;
        tx.commit()?;
        log::info!("Store: applied migration v{} ({})", migration.version, migration.name);
        ran += 1;
    }
    Ok(ran)
}
