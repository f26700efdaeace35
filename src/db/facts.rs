//! Row operations for the active-truth fact table, its append-only version
//! history, and the conflict pool.
//!
//! Mutating helpers are free functions over `&rusqlite::Connection` so the
//! same code runs against a pooled connection or inside a `Transaction`
//! (which derefs to `Connection`), so propose/retract/resolve compose into a
//! single transaction without duplicating SQL.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{now_rfc3339, MemoryDB};
use crate::error::TimeLayerError;
use crate::facts::triple::extract_fact_triple;

#[derive(Debug, Clone, Serialize)]
pub struct UserFactRow {
    pub fact_key: String,
    pub fact: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserFactHistoryRow {
    pub id: i64,
    pub fact_key: String,
    pub fact: String,
    pub status: String,
    pub version: i64,
    pub source_type: String,
    pub source_key: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserFactConflict {
    pub id: i64,
    pub fact_key: String,
    pub existing_fact: String,
    pub proposed_fact: String,
    pub proposed_source_type: String,
    pub proposed_source_key: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

pub fn get_active_user_fact_by_key(
    conn: &Connection,
    fact_key: &str,
) -> Result<Option<String>, TimeLayerError> {
    if fact_key.is_empty() {
        return Ok(None);
    }
    Ok(conn
        .query_row(
            "SELECT fact FROM user_facts WHERE fact_key=?1 AND is_active=1 LIMIT 1",
            params![fact_key],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn has_active_user_fact(conn: &Connection, fact_key: &str) -> Result<bool, TimeLayerError> {
    Ok(get_active_user_fact_by_key(conn, fact_key)?.is_some())
}

/// Find an active fact occupying the same (subject, relation) slot. Enables
/// conflict detection even when a different fact_key was derived. The slot
/// key is non-empty only for conservative single-valued relations.
pub fn get_active_user_fact_by_slot(
    conn: &Connection,
    slot_key: &str,
) -> Result<Option<(String, String)>, TimeLayerError> {
    if slot_key.is_empty() {
        return Ok(None);
    }
    let mut stmt = conn.prepare("SELECT fact_key, fact FROM user_facts WHERE is_active=1")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
    for row in rows {
        let (key, fact) = row?;
        if extract_fact_triple(&fact).slot_key().as_deref() == Some(slot_key) {
            return Ok(Some((key, fact)));
        }
    }
    Ok(None)
}

/// Upsert keyed by fact_key; the caller guarantees the key is normalized.
pub fn upsert_user_fact(
    conn: &Connection,
    fact: &str,
    fact_key: &str,
    active: bool,
) -> Result<(), TimeLayerError> {
    if fact_key.is_empty() {
        return Ok(());
    }
    let ts = now_rfc3339();
    conn.execute(
        "INSERT INTO user_facts(fact, fact_key, is_active, created_at, updated_at) \
         VALUES(?1,?2,?3,?4,?4) \
         ON CONFLICT(fact_key) DO UPDATE SET \
           fact=excluded.fact, is_active=excluded.is_active, updated_at=excluded.updated_at",
        params![fact, fact_key, active as i64, ts],
    )?;
    Ok(())
}

fn next_user_fact_version(conn: &Connection, fact_key: &str) -> Result<i64, TimeLayerError> {
    let max: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM user_facts_history WHERE fact_key=?1",
        params![fact_key],
        |r| r.get(0),
    )?;
    Ok(max + 1)
}

/// Append a version row. Version is strictly increasing per fact_key.
pub fn append_user_fact_history(
    conn: &Connection,
    fact_key: &str,
    fact: &str,
    status: &str,
    source_type: &str,
    source_key: &str,
) -> Result<(), TimeLayerError> {
    if fact_key.is_empty() || fact.is_empty() {
        return Ok(());
    }
    let status = if status.is_empty() { "active" } else { status };
    let source_type = if source_type.is_empty() { "unknown" } else { source_type };
    let source_key = if source_key.is_empty() { "-" } else { source_key };
    let version = next_user_fact_version(conn, fact_key)?;
    conn.execute(
        "INSERT INTO user_facts_history(fact_key, fact, status, version, source_type, source_key, created_at) \
         VALUES(?1,?2,?3,?4,?5,?6,?7)",
        params![fact_key, fact, status, version, source_type, source_key, now_rfc3339()],
    )?;
    Ok(())
}

/// Record a conflict. Deduplicates on `(fact_key, proposed_fact)` among
/// unresolved rows; re-proposals return the existing id.
pub fn create_user_fact_conflict(
    conn: &Connection,
    fact_key: &str,
    existing_fact: &str,
    proposed_fact: &str,
    source_type: &str,
    source_key: &str,
) -> Result<i64, TimeLayerError> {
    if fact_key.is_empty() || existing_fact.is_empty() || proposed_fact.is_empty() {
        return Ok(0);
    }

    let existing_id: Option<i64> = conn
        .query_row(
            "SELECT id FROM user_fact_conflicts \
             WHERE status='conflict' AND fact_key=?1 AND proposed_fact=?2 \
             ORDER BY id DESC LIMIT 1",
            params![fact_key, proposed_fact],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing_id {
        return Ok(id);
    }

    let ts = now_rfc3339();
    conn.execute(
        "INSERT INTO user_fact_conflicts(fact_key, existing_fact, proposed_fact, \
           proposed_source_type, proposed_source_key, status, created_at, updated_at) \
         VALUES(?1,?2,?3,?4,?5,'conflict',?6,?6)",
        params![fact_key, existing_fact, proposed_fact, source_type, source_key, ts],
    )?;
    Ok(conn.last_insert_rowid())
}

fn conflict_from_row(r: &rusqlite::Row) -> rusqlite::Result<UserFactConflict> {
    Ok(UserFactConflict {
        id: r.get(0)?,
        fact_key: r.get(1)?,
        existing_fact: r.get(2)?,
        proposed_fact: r.get(3)?,
        proposed_source_type: r.get(4)?,
        proposed_source_key: r.get(5)?,
        status: r.get(6)?,
        created_at: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

pub fn get_fact_conflict_by_id(
    conn: &Connection,
    id: i64,
) -> Result<Option<UserFactConflict>, TimeLayerError> {
    if id <= 0 {
        return Ok(None);
    }
    Ok(conn
        .query_row(
            "SELECT id, fact_key, existing_fact, proposed_fact, proposed_source_type, \
                    proposed_source_key, status, created_at, updated_at \
             FROM user_fact_conflicts WHERE id=?1 LIMIT 1",
            params![id],
            conflict_from_row,
        )
        .optional()?)
}

pub fn set_conflict_status(
    conn: &Connection,
    id: i64,
    status: &str,
) -> Result<(), TimeLayerError> {
    conn.execute(
        "UPDATE user_fact_conflicts SET status=?1, updated_at=?2 WHERE id=?3",
        params![status, now_rfc3339(), id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Read paths (handlers, prompt assembly, guards)
// ---------------------------------------------------------------------------

impl MemoryDB {
    pub fn list_active_fact_texts(&self, limit: usize) -> Result<Vec<String>, TimeLayerError> {
        let limit = if limit == 0 { 50 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT fact FROM user_facts WHERE is_active=1 ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_active_facts(&self, limit: usize) -> Result<Vec<UserFactRow>, TimeLayerError> {
        let limit = if limit == 0 { 50 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT fact_key, fact, is_active, created_at, updated_at \
             FROM user_facts WHERE is_active=1 ORDER BY updated_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| {
                Ok(UserFactRow {
                    fact_key: r.get(0)?,
                    fact: r.get(1)?,
                    is_active: r.get::<_, i64>(2)? != 0,
                    created_at: r.get(3)?,
                    updated_at: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_fact_history(
        &self,
        limit: usize,
    ) -> Result<Vec<UserFactHistoryRow>, TimeLayerError> {
        let limit = if limit == 0 { 200 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, fact_key, fact, status, version, source_type, source_key, created_at \
             FROM user_facts_history ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| {
                Ok(UserFactHistoryRow {
                    id: r.get(0)?,
                    fact_key: r.get(1)?,
                    fact: r.get(2)?,
                    status: r.get(3)?,
                    version: r.get(4)?,
                    source_type: r.get(5)?,
                    source_key: r.get(6)?,
                    created_at: r.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_fact_conflicts(&self) -> usize {
        self.conn()
            .ok()
            .and_then(|c| {
                c.query_row(
                    "SELECT COUNT(1) FROM user_fact_conflicts WHERE status='conflict'",
                    [],
                    |r| r.get::<_, i64>(0),
                )
                .ok()
            })
            .unwrap_or(0) as usize
    }

    pub fn list_fact_conflicts(
        &self,
        limit: usize,
    ) -> Result<Vec<UserFactConflict>, TimeLayerError> {
        let limit = if limit == 0 { 50 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, fact_key, existing_fact, proposed_fact, proposed_source_type, \
                    proposed_source_key, status, created_at, updated_at \
             FROM user_fact_conflicts WHERE status='conflict' \
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], conflict_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
