//! timelayer — local-first layered conversation memory.
//! Append-only dialog timeline → time-bucketed summaries → curated facts,
//! assembled into a retrieval-aware prompt per chat turn.

pub mod ai;
pub mod api;
pub mod chat;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod facts;
pub mod logstream;
pub mod pending;
pub mod prompts;
pub mod search;
pub mod summary;
pub mod util;

use std::sync::Arc;

pub type SharedDB = Arc<db::MemoryDB>;

/// Run a blocking DB operation on tokio's blocking thread pool.
///
/// All synchronous MemoryDB calls in async context MUST go through this to
/// avoid starving tokio worker threads.
pub async fn db_call<F, T>(db: &SharedDB, f: F) -> Result<T, error::TimeLayerError>
where
    F: FnOnce(&db::MemoryDB) -> T + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| error::TimeLayerError::Internal(e.to_string()))
}

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDB,
    pub ai: ai::AiClient,
    pub cfg: Arc<config::Config>,
    pub embed_cache: search::QueryEmbedCache,
    pub log: Arc<logstream::LogWriter>,
    pub stream_sem: Arc<tokio::sync::Semaphore>,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(cfg: config::Config) -> Result<Self, error::TimeLayerError> {
        let db: SharedDB = Arc::new(db::MemoryDB::open(
            &cfg.db_path.to_string_lossy(),
            cfg.sqlite_max_open_conns,
            cfg.sqlite_busy_timeout_ms,
        )?);
        let ai = ai::AiClient::new(&cfg);
        let log = Arc::new(logstream::LogWriter::new(cfg.clone(), db.clone(), ai.clone()));
        let stream_sem = Arc::new(tokio::sync::Semaphore::new(cfg.http_max_concurrent_streams.max(1)));
        Ok(Self {
            db,
            ai,
            embed_cache: search::QueryEmbedCache::new(128),
            log,
            stream_sem,
            started_at: std::time::Instant::now(),
            cfg: Arc::new(cfg),
        })
    }

    /// In-memory state for tests: throwaway dirs, in-memory SQLite.
    pub fn for_tests(mut cfg: config::Config, base: &std::path::Path) -> Result<Self, error::TimeLayerError> {
        cfg.base_dir = base.to_path_buf();
        cfg.log_dir = base.join("logs");
        cfg.archive_dir = base.join("logs").join("archive");
        cfg.prompt_dir = base.join("prompts");
        cfg.db_path = base.join("memory.sqlite");
        cfg.ensure_dirs()
            .map_err(|e| error::TimeLayerError::Internal(e.to_string()))?;

        let db: SharedDB = Arc::new(db::MemoryDB::open_default(":memory:")?);
        let ai = ai::AiClient::new(&cfg);
        let log = Arc::new(logstream::LogWriter::new(cfg.clone(), db.clone(), ai.clone()));
        Ok(Self {
            db,
            ai,
            embed_cache: search::QueryEmbedCache::new(16),
            log,
            stream_sem: Arc::new(tokio::sync::Semaphore::new(2)),
            started_at: std::time::Instant::now(),
            cfg: Arc::new(cfg),
        })
    }
}
