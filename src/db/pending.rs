//! Pending candidate fact rows and their best-effort embeddings (used only
//! for UI clustering).

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{now_rfc3339, MemoryDB};
use crate::error::TimeLayerError;

#[derive(Debug, Clone, Serialize)]
pub struct PendingFact {
    pub id: i64,
    pub fact: String,
    pub fact_key: String,
    pub confidence: f64,
    pub source_type: String,
    pub source_key: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

fn pending_from_row(r: &rusqlite::Row) -> rusqlite::Result<PendingFact> {
    Ok(PendingFact {
        id: r.get(0)?,
        fact: r.get(1)?,
        fact_key: r.get(2)?,
        confidence: r.get(3)?,
        source_type: r.get(4)?,
        source_key: r.get(5)?,
        status: r.get(6)?,
        created_at: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

const PENDING_COLS: &str =
    "id, fact, fact_key, confidence, source_type, source_key, status, created_at, updated_at";

/// Read-then-write upsert keyed by `(fact_key, status='pending', source_type,
/// source_key)`: an existing row keeps the max confidence and refreshes text
/// and timestamp. Kept as a manual upsert so older databases without the
/// matching UNIQUE index keep working.
pub fn upsert_pending_fact(
    conn: &Connection,
    fact: &str,
    fact_key: &str,
    confidence: f64,
    source_type: &str,
    source_key: &str,
) -> Result<(), TimeLayerError> {
    let now = now_rfc3339();

    let existing: Option<(i64, f64)> = conn
        .query_row(
            "SELECT id, confidence FROM pending_facts \
             WHERE fact_key=?1 AND status='pending' AND source_type=?2 AND source_key=?3 \
             ORDER BY updated_at DESC LIMIT 1",
            params![fact_key, source_type, source_key],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    if let Some((id, old_conf)) = existing {
        conn.execute(
            "UPDATE pending_facts SET fact=?1, confidence=?2, updated_at=?3 WHERE id=?4",
            params![fact, old_conf.max(confidence), now, id],
        )?;
        return Ok(());
    }

    conn.execute(
        "INSERT INTO pending_facts(fact, fact_key, confidence, source_type, source_key, status, created_at, updated_at) \
         VALUES(?1,?2,?3,?4,?5,'pending',?6,?6)",
        params![fact, fact_key, confidence, source_type, source_key, now],
    )?;
    Ok(())
}

pub fn get_pending_fact_by_id(
    conn: &Connection,
    id: i64,
) -> Result<Option<PendingFact>, TimeLayerError> {
    Ok(conn
        .query_row(
            &format!("SELECT {PENDING_COLS} FROM pending_facts WHERE id=?1 LIMIT 1"),
            params![id],
            pending_from_row,
        )
        .optional()?)
}

pub fn set_pending_fact_status(
    conn: &Connection,
    id: i64,
    status: &str,
) -> Result<(), TimeLayerError> {
    conn.execute(
        "UPDATE pending_facts SET status=?1, updated_at=?2 WHERE id=?3",
        params![status, now_rfc3339(), id],
    )?;
    Ok(())
}

impl MemoryDB {
    pub fn count_pending_facts(&self) -> usize {
        self.conn()
            .ok()
            .and_then(|c| {
                c.query_row(
                    "SELECT COUNT(1) FROM pending_facts WHERE status='pending'",
                    [],
                    |r| r.get::<_, i64>(0),
                )
                .ok()
            })
            .unwrap_or(0) as usize
    }

    pub fn list_pending_facts(&self, limit: usize) -> Result<Vec<PendingFact>, TimeLayerError> {
        let limit = if limit == 0 { 50 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PENDING_COLS} FROM pending_facts WHERE status='pending' \
             ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], pending_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Cached clustering vector for a pending fact, if previously computed.
    pub fn pending_fact_embedding(
        &self,
        pending_fact_id: i64,
    ) -> Result<Option<(Vec<f32>, f64)>, TimeLayerError> {
        let conn = self.conn()?;
        let row: Option<(Vec<u8>, f64, i64)> = conn
            .query_row(
                "SELECT vec, l2, dim FROM pending_fact_embeddings WHERE pending_fact_id=?1 LIMIT 1",
                params![pending_fact_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        Ok(row.and_then(|(blob, l2, dim)| {
            if dim <= 0 || blob.is_empty() || l2 == 0.0 {
                return None;
            }
            Some((crate::ai::bytes_to_embedding(&blob), l2))
        }))
    }

    pub fn upsert_pending_fact_embedding(
        &self,
        pending_fact_id: i64,
        vec: &[f32],
        l2: f64,
    ) -> Result<(), TimeLayerError> {
        if pending_fact_id <= 0 || vec.is_empty() || l2 == 0.0 {
            return Ok(());
        }
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM pending_fact_embeddings WHERE pending_fact_id=?1",
            params![pending_fact_id],
        )?;
        conn.execute(
            "INSERT INTO pending_fact_embeddings(pending_fact_id, dim, vec, l2, created_at) \
             VALUES(?1,?2,?3,?4,?5)",
            params![
                pending_fact_id,
                vec.len() as i64,
                crate::ai::embedding_to_bytes(vec),
                l2,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }
}
