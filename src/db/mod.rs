//! SQLite-backed durable store: summaries, embeddings (1:1 with summaries,
//! plus append-only drift history), user facts with versioned history and a
//! conflict pool, and pending candidate facts.

mod facts;
mod pending;

pub use facts::*;
pub use pending::*;

use chrono::{Local, SecondsFormat};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::error::TimeLayerError;

/// Set busy_timeout and per-connection pragmas on every connection handed out
/// by the pool. Keeps write contention bounded when the pool is >1.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u64,
}

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_millis(self.busy_timeout_ms))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// RFC3339 timestamp in the local timezone, second precision.
pub fn now_rfc3339() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Local calendar date as `YYYY-MM-DD`.
pub fn today_str() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS summaries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  type TEXT NOT NULL,
  period_key TEXT NOT NULL,
  start_date TEXT NOT NULL,
  end_date TEXT NOT NULL,
  json TEXT NOT NULL,
  index_text TEXT NOT NULL,
  source_path TEXT,
  created_at TEXT NOT NULL,
  UNIQUE(type, period_key)
);

CREATE INDEX IF NOT EXISTS idx_summaries_type_period
  ON summaries(type, period_key);

CREATE TABLE IF NOT EXISTS embeddings (
  summary_id INTEGER PRIMARY KEY,
  dim INTEGER NOT NULL,
  vec BLOB NOT NULL,
  l2 REAL NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY(summary_id) REFERENCES summaries(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS summary_embeddings_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  summary_id INTEGER NOT NULL,
  vec BLOB NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY(summary_id) REFERENCES summaries(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_seh_summary_id_created
  ON summary_embeddings_history(summary_id, created_at);

CREATE TABLE IF NOT EXISTS user_facts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  fact TEXT NOT NULL,
  fact_key TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(fact_key)
);

CREATE INDEX IF NOT EXISTS idx_user_facts_active
  ON user_facts(is_active, updated_at);

CREATE TABLE IF NOT EXISTS pending_facts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  fact TEXT NOT NULL,
  fact_key TEXT NOT NULL,
  confidence REAL NOT NULL DEFAULT 0.0,
  source_type TEXT NOT NULL,
  source_key TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'pending',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE(fact_key, status, source_type, source_key)
);

CREATE INDEX IF NOT EXISTS idx_pending_facts_status_created
  ON pending_facts(status, created_at);

CREATE TABLE IF NOT EXISTS pending_fact_embeddings (
  pending_fact_id INTEGER PRIMARY KEY,
  dim INTEGER NOT NULL,
  vec BLOB NOT NULL,
  l2 REAL NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY(pending_fact_id) REFERENCES pending_facts(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS user_facts_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  fact_key TEXT NOT NULL,
  fact TEXT NOT NULL,
  status TEXT NOT NULL,
  version INTEGER NOT NULL,
  source_type TEXT NOT NULL,
  source_key TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ufh_key_version
  ON user_facts_history(fact_key, version);

CREATE INDEX IF NOT EXISTS idx_ufh_status_created
  ON user_facts_history(status, created_at);

CREATE TABLE IF NOT EXISTS user_fact_conflicts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  fact_key TEXT NOT NULL,
  existing_fact TEXT NOT NULL,
  proposed_fact TEXT NOT NULL,
  proposed_source_type TEXT NOT NULL,
  proposed_source_key TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'conflict',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ufc_status_created
  ON user_fact_conflicts(status, created_at);
"#;

/// Single-writer SQLite store behind a small connection pool.
pub struct MemoryDB {
    pool: Pool<SqliteConnectionManager>,
}

impl MemoryDB {
    /// Open (or create) a database at the given path. `:memory:` uses a
    /// shared-cache in-memory database unique to this instance (tests).
    pub fn open(path: &str, max_conns: u32, busy_timeout_ms: u64) -> Result<Self, TimeLayerError> {
        let manager = if path == ":memory:" {
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool_size = if path == ":memory:" { max_conns.max(2) } else { max_conns.max(1) };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(PragmaCustomizer { busy_timeout_ms }))
            .build(manager)
            .map_err(|e| TimeLayerError::Internal(format!("pool: {e}")))?;

        let conn = pool
            .get()
            .map_err(|e| TimeLayerError::Internal(format!("pool: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;
        drop(conn);

        Ok(Self { pool })
    }

    /// Test/default convenience: pool of 2, 5s busy timeout.
    pub fn open_default(path: &str) -> Result<Self, TimeLayerError> {
        Self::open(path, 2, 5000)
    }

    pub(crate) fn conn(&self) -> Result<PooledConn, TimeLayerError> {
        self.pool
            .get()
            .map_err(|e| TimeLayerError::Internal(format!("pool: {e}")))
    }

    /// Run `f` inside a transaction; commit on Ok, roll back on Err.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> Result<T, TimeLayerError>,
    ) -> Result<T, TimeLayerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Bounded linear-backoff retry for short critical writes that may hit
    /// transient busy/locked errors.
    pub fn with_retry<T>(
        &self,
        attempts: u32,
        base_delay: std::time::Duration,
        mut f: impl FnMut() -> Result<T, TimeLayerError>,
    ) -> Result<T, TimeLayerError> {
        let attempts = attempts.max(1);
        let mut last = None;
        for i in 0..attempts {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_busy() && i + 1 < attempts => {
                    std::thread::sleep(base_delay * (i + 1));
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| TimeLayerError::Internal("retry exhausted".into())))
    }

    // -----------------------------------------------------------------
    // summaries
    // -----------------------------------------------------------------

    pub fn summary_exists(&self, typ: &str, key: &str) -> Result<bool, TimeLayerError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM summaries WHERE type=?1 AND period_key=?2 LIMIT 1",
                params![typ, key],
                |_| Ok(()),
            )
            .map(|_| true);
        match found {
            Ok(v) => Ok(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn summary_id(&self, typ: &str, key: &str) -> Result<Option<i64>, TimeLayerError> {
        let conn = self.conn()?;
        match conn.query_row(
            "SELECT id FROM summaries WHERE type=?1 AND period_key=?2",
            params![typ, key],
            |r| r.get(0),
        ) {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert or update a summary keyed by `(type, period_key)`. On conflict
    /// only the mutable fields change; the row id is stable and returned.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_summary(
        &self,
        typ: &str,
        key: &str,
        start_date: &str,
        end_date: &str,
        json: &str,
        index_text: &str,
        source_path: &str,
    ) -> Result<i64, TimeLayerError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO summaries(type, period_key, start_date, end_date, json, index_text, source_path, created_at) \
             VALUES(?1,?2,?3,?4,?5,?6,?7,?8) \
             ON CONFLICT(type, period_key) DO UPDATE SET \
               json=excluded.json, index_text=excluded.index_text, source_path=excluded.source_path",
            params![typ, key, start_date, end_date, json, index_text, source_path, now_rfc3339()],
        )?;
        let id = conn.query_row(
            "SELECT id FROM summaries WHERE type=?1 AND period_key=?2",
            params![typ, key],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    /// Force-regeneration cleanup: drop the summary row (its embedding and
    /// drift history cascade).
    pub fn delete_summary(&self, typ: &str, key: &str) -> Result<(), TimeLayerError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM summaries WHERE type=?1 AND period_key=?2",
            params![typ, key],
        )?;
        Ok(())
    }

    pub fn mark_summary_source(&self, id: i64, source_path: &str) -> Result<(), TimeLayerError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE summaries SET source_path=?1 WHERE id=?2",
            params![source_path, id],
        )?;
        Ok(())
    }

    pub fn summary_json(&self, typ: &str, key: &str) -> Result<Option<String>, TimeLayerError> {
        let conn = self.conn()?;
        match conn.query_row(
            "SELECT json FROM summaries WHERE type=?1 AND period_key=?2",
            params![typ, key],
            |r| r.get(0),
        ) {
            Ok(js) => Ok(Some(js)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rows for embedding backfill: (id, type, period_key, json).
    pub fn summaries_for_reindex(
        &self,
        target: Option<&str>,
    ) -> Result<Vec<(i64, String, String, String)>, TimeLayerError> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        let mut push = |row: &rusqlite::Row| -> rusqlite::Result<()> {
            out.push((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?));
            Ok(())
        };
        match target {
            Some(t) => {
                let mut stmt = conn.prepare(
                    "SELECT id, type, period_key, json FROM summaries WHERE type=?1 ORDER BY period_key",
                )?;
                let mut rows = stmt.query(params![t])?;
                while let Some(row) = rows.next()? {
                    push(row)?;
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, type, period_key, json FROM summaries ORDER BY type, period_key",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    push(row)?;
                }
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // embeddings (1:1 with summaries) + drift history
    // -----------------------------------------------------------------

    pub fn has_embedding(&self, summary_id: i64) -> Result<bool, TimeLayerError> {
        let conn = self.conn()?;
        match conn.query_row(
            "SELECT 1 FROM embeddings WHERE summary_id=?1 LIMIT 1",
            params![summary_id],
            |_| Ok(()),
        ) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace any prior embedding row for this summary (1:1).
    pub fn upsert_embedding(
        &self,
        summary_id: i64,
        vec: &[f32],
        l2: f64,
    ) -> Result<(), TimeLayerError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM embeddings WHERE summary_id=?1",
            params![summary_id],
        )?;
        conn.execute(
            "INSERT INTO embeddings(summary_id, dim, vec, l2, created_at) VALUES(?1,?2,?3,?4,?5)",
            params![
                summary_id,
                vec.len() as i64,
                crate::ai::embedding_to_bytes(vec),
                l2,
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn delete_embedding(&self, summary_id: i64) -> Result<(), TimeLayerError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM embeddings WHERE summary_id=?1",
            params![summary_id],
        )?;
        Ok(())
    }

    /// Append-only drift history; never deleted except by summary cascade.
    pub fn append_embedding_history(
        &self,
        summary_id: i64,
        vec: &[f32],
    ) -> Result<(), TimeLayerError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO summary_embeddings_history(summary_id, vec, created_at) VALUES(?1,?2,?3)",
            params![summary_id, crate::ai::embedding_to_bytes(vec), now_rfc3339()],
        )?;
        Ok(())
    }

    pub fn last_embedding_history(
        &self,
        summary_id: i64,
    ) -> Result<Option<Vec<f32>>, TimeLayerError> {
        let conn = self.conn()?;
        match conn.query_row(
            "SELECT vec FROM summary_embeddings_history WHERE summary_id=?1 \
             ORDER BY id DESC LIMIT 1",
            params![summary_id],
            |r| r.get::<_, Vec<u8>>(0),
        ) {
            Ok(blob) => Ok(Some(crate::ai::bytes_to_embedding(&blob))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Full scan rows for retrieval:
    /// (type, period_key, json, index_text, vec blob, l2, dim).
    #[allow(clippy::type_complexity)]
    pub fn embedding_scan_rows(
        &self,
    ) -> Result<Vec<(String, String, String, String, Vec<u8>, f64, usize)>, TimeLayerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.type, s.period_key, s.json, s.index_text, e.vec, e.l2, e.dim \
             FROM embeddings e JOIN summaries s ON s.id = e.summary_id",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Vec<u8>>(4)?,
                    r.get::<_, f64>(5)?,
                    r.get::<_, i64>(6)? as usize,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Idempotent migrations for databases created by earlier versions: probe
/// each column, add it when missing, backfill empty fields best-effort.
fn migrate(conn: &rusqlite::Connection) -> Result<(), TimeLayerError> {
    let missing =
        |probe: &str| -> bool { conn.prepare(probe).is_err() };

    if missing("SELECT source_type FROM pending_facts LIMIT 0") {
        conn.execute(
            "ALTER TABLE pending_facts ADD COLUMN source_type TEXT NOT NULL DEFAULT 'legacy'",
            [],
        )?;
    }
    if missing("SELECT source_key FROM pending_facts LIMIT 0") {
        conn.execute(
            "ALTER TABLE pending_facts ADD COLUMN source_key TEXT NOT NULL DEFAULT 'legacy'",
            [],
        )?;
    }
    if missing("SELECT status FROM pending_facts LIMIT 0") {
        conn.execute(
            "ALTER TABLE pending_facts ADD COLUMN status TEXT NOT NULL DEFAULT 'pending'",
            [],
        )?;
    }
    if missing("SELECT confidence FROM pending_facts LIMIT 0") {
        conn.execute(
            "ALTER TABLE pending_facts ADD COLUMN confidence REAL NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if missing("SELECT source_path FROM summaries LIMIT 0") {
        conn.execute("ALTER TABLE summaries ADD COLUMN source_path TEXT", [])?;
    }
    let now = now_rfc3339();
    for col in ["created_at", "updated_at"] {
        if missing(&format!("SELECT {col} FROM pending_facts LIMIT 0")) {
            conn.execute(
                &format!("ALTER TABLE pending_facts ADD COLUMN {col} TEXT NOT NULL DEFAULT ''"),
                [],
            )?;
            conn.execute(
                &format!("UPDATE pending_facts SET {col}=?1 WHERE {col}=''"),
                params![now],
            )?;
        }
    }

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pending_facts_source ON pending_facts(source_type, source_key)",
        [],
    )?;
    Ok(())
}
