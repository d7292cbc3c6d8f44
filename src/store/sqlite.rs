//! SQLite-backed `PersistentStore`.
//!
//! Records are stored as JSON documents in a `body` column, with the handful
//! of fields that queries filter on (state, confidence, cluster) lifted into
//! their own columns. The database lives at `~/.intent-discovery/intent.db`
//! unless opened at an explicit path.

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;

use crate::entity::Entity;
use crate::types::{ClusterIntelligence, Episode, Hypothesis, RuntimeBinding, Template};

use super::{
    check_binding, check_binding_transition, check_cluster_intel, check_entity,
    check_entity_cluster_change, check_episode_immutable, check_hypotheses, check_template,
    check_template_immutable, PersistentStore, StoreError,
};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at `~/.intent-discovery/intent.db`.
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open_at(Self::db_path()?)
    }

    /// Open a store at an explicit path, creating parent directories and
    /// applying pending migrations.
    pub fn open_at(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        crate::migrations::run_migrations(&conn)?;

        log::debug!("Store: opened {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database. Useful for testing.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        crate::migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn db_path() -> Result<PathBuf, StoreError> {
        let home = dirs::home_dir().ok_or(StoreError::HomeDirNotFound)?;
        Ok(home.join(".intent-discovery").join("intent.db"))
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    fn with_transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(val) => {
                conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Path of the open database file, if it is file-backed.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .lock()
            .path()
            .filter(|p| !p.is_empty())
            .map(|p| Path::new(p).to_path_buf())
    }
}

fn query_bodies<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let mut items = Vec::new();
    for body in rows {
        items.push(serde_json::from_str(&body?)?);
    }
    Ok(items)
}

fn query_body<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<T>, StoreError> {
    let body: Option<String> = conn.query_row(sql, params, |row| row.get(0)).optional()?;
    match body {
        Some(body) => Ok(Some(serde_json::from_str(&body)?)),
        None => Ok(None),
    }
}

impl PersistentStore for SqliteStore {
    fn get_entity(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        let conn = self.conn.lock();
        query_body(&conn, "SELECT body FROM entities WHERE id = ?1", [id])
    }

    fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        check_entity(entity)?;
        let body = serde_json::to_string(entity)?;
        self.with_transaction(|conn| {
            let existing: Option<Entity> =
                query_body(conn, "SELECT body FROM entities WHERE id = ?1", [&entity.id])?;
            check_entity_cluster_change(existing.as_ref(), entity)?;
            conn.execute(
                "INSERT INTO entities (id, name, cluster_id, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    cluster_id = excluded.cluster_id,
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                params![
                    entity.id,
                    entity.name,
                    entity.cluster_id,
                    body,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    fn list_entities(&self) -> Result<Vec<Entity>, StoreError> {
        let conn = self.conn.lock();
        query_bodies(&conn, "SELECT body FROM entities ORDER BY id", [])
    }

    fn entities_in_cluster(&self, cluster_id: &str) -> Result<Vec<Entity>, StoreError> {
        let conn = self.conn.lock();
        query_bodies(
            &conn,
            "SELECT body FROM entities WHERE cluster_id = ?1 ORDER BY id",
            [cluster_id],
        )
    }

    fn get_binding(&self, entity_id: &str) -> Result<Option<RuntimeBinding>, StoreError> {
        let conn = self.conn.lock();
        query_body(
            &conn,
            "SELECT body FROM runtime_bindings WHERE entity_id = ?1",
            [entity_id],
        )
    }

    fn upsert_binding(&self, binding: &RuntimeBinding) -> Result<(), StoreError> {
        check_binding(binding)?;
        let body = serde_json::to_string(binding)?;
        let conn = self.conn.lock();
        let existing: Option<RuntimeBinding> = query_body(
            &conn,
            "SELECT body FROM runtime_bindings WHERE entity_id = ?1",
            [&binding.entity_id],
        )?;
        check_binding_transition(existing.as_ref(), binding)?;
        conn.execute(
            "INSERT INTO runtime_bindings
                (entity_id, state, usage_count, success_count, confidence_adjustment, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(entity_id) DO UPDATE SET
                state = excluded.state,
                usage_count = excluded.usage_count,
                success_count = excluded.success_count,
                confidence_adjustment = excluded.confidence_adjustment,
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![
                binding.entity_id,
                binding.state.as_str(),
                binding.usage_count as i64,
                binding.success_count as i64,
                binding.confidence_adjustment,
                body,
                binding.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn list_bindings(&self) -> Result<Vec<RuntimeBinding>, StoreError> {
        let conn = self.conn.lock();
        query_bodies(&conn, "SELECT body FROM runtime_bindings ORDER BY entity_id", [])
    }

    fn hypotheses_for_entity(&self, entity_id: &str) -> Result<Vec<Hypothesis>, StoreError> {
        let conn = self.conn.lock();
        query_bodies(
            &conn,
            "SELECT body FROM hypotheses WHERE entity_id = ?1 ORDER BY rowid",
            [entity_id],
        )
    }

    fn replace_hypotheses(&self, entity_id: &str, hypotheses: &[Hypothesis]) -> Result<(), StoreError> {
        check_hypotheses(entity_id, hypotheses)?;
        let bodies = hypotheses
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.with_transaction(|conn| {
            conn.execute("DELETE FROM hypotheses WHERE entity_id = ?1", [entity_id])?;
            let mut stmt = conn.prepare(
                "INSERT INTO hypotheses (id, entity_id, category, confidence, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (h, body) in hypotheses.iter().zip(bodies.iter()) {
                stmt.execute(params![h.id, h.entity_id, h.category, h.confidence, body])?;
            }
            Ok(())
        })
    }

    fn list_hypotheses(&self) -> Result<Vec<Hypothesis>, StoreError> {
        let conn = self.conn.lock();
        query_bodies(
            &conn,
            "SELECT body FROM hypotheses ORDER BY confidence DESC, id",
            [],
        )
    }

    fn append_episode(&self, episode: &Episode) -> Result<bool, StoreError> {
        let body = serde_json::to_string(episode)?;
        self.with_transaction(|conn| {
            let existing: Option<Episode> =
                query_body(conn, "SELECT body FROM episodes WHERE id = ?1", [&episode.id])?;
            let inserted = check_episode_immutable(existing.as_ref(), episode)?;
            if inserted {
                conn.execute(
                    "INSERT INTO episodes (id, entity_id, observed_at, body) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        episode.id,
                        episode.entity_id,
                        episode.timestamp.to_rfc3339(),
                        body
                    ],
                )?;
            }
            Ok(inserted)
        })
    }

    fn episodes_for_entity(&self, entity_id: &str) -> Result<Vec<Episode>, StoreError> {
        let conn = self.conn.lock();
        query_bodies(
            &conn,
            "SELECT body FROM episodes WHERE entity_id = ?1 ORDER BY observed_at, id",
            [entity_id],
        )
    }

    fn get_cluster_intel(&self, cluster_id: &str) -> Result<Option<ClusterIntelligence>, StoreError> {
        let conn = self.conn.lock();
        query_body(
            &conn,
            "SELECT body FROM cluster_intelligence WHERE cluster_id = ?1",
            [cluster_id],
        )
    }

    fn upsert_cluster_intel(&self, intel: &ClusterIntelligence) -> Result<(), StoreError> {
        check_cluster_intel(intel)?;
        let body = serde_json::to_string(intel)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cluster_intelligence (cluster_id, body, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(cluster_id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![intel.cluster_id, body, intel.updated_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn get_template(&self, id: &str) -> Result<Option<Template>, StoreError> {
        let conn = self.conn.lock();
        query_body(&conn, "SELECT body FROM templates WHERE id = ?1", [id])
    }

    fn latest_template(&self, cluster_id: &str) -> Result<Option<Template>, StoreError> {
        let conn = self.conn.lock();
        query_body(
            &conn,
            "SELECT body FROM templates WHERE cluster_id = ?1 ORDER BY version DESC LIMIT 1",
            [cluster_id],
        )
    }

    fn publish_template(&self, template: &Template) -> Result<(), StoreError> {
        check_template(template)?;
        let body = serde_json::to_string(template)?;
        self.with_transaction(|conn| {
            let existing: Option<Template> =
                query_body(conn, "SELECT body FROM templates WHERE id = ?1", [&template.id])?;
            check_template_immutable(existing.as_ref(), template)?;
            if existing.is_none() {
                conn.execute(
                    "INSERT INTO templates (id, cluster_id, version, body) VALUES (?1, ?2, ?3, ?4)",
                    params![template.id, template.cluster_id, template.version, body],
                )?;
            }
            Ok(())
        })
    }
}
