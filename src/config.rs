//! Process-wide configuration. Loaded once at startup from `TIMELAYER_*`
//! environment variables with production defaults; nothing mutates it after.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RerankMode {
    Conservative,
    Ambiguous,
    Smart,
    Always,
}

impl RerankMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "conservative" => Some(Self::Conservative),
            "ambiguous" => Some(Self::Ambiguous),
            "smart" => Some(Self::Smart),
            "always" => Some(Self::Always),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Ambiguous => "ambiguous",
            Self::Smart => "smart",
            Self::Always => "always",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub base_dir: PathBuf,
    pub log_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub prompt_dir: PathBuf,
    pub db_path: PathBuf,
    pub keep_raw_days: u32,
    /// Upper bound for a single LLM source chunk (raw JSONL or slimmed JSON array).
    pub max_source_chunk_bytes: u64,
    pub http_timeout: Duration,

    pub search_top_k: usize,
    pub search_min_score: f64,
    // Rerank intent gate: only affects whether the cross-encoder runs,
    // never recall itself.
    pub search_min_strong: f64,
    pub search_min_gap: f64,

    pub chat_url: String,
    pub embed_url: String,
    pub chat_model: String,

    pub enable_rerank: bool,
    pub force_rerank: bool,
    pub rerank_mode: RerankMode,
    pub rerank_url: String,
    pub rerank_top_n: usize,
    pub rerank_timeout: Duration,
    pub rerank_min_batch: usize,

    pub http_addr: String,
    pub http_auth_token: Option<String>,
    pub http_allow_insecure_remote: bool,
    pub http_rate_limit_rpm: u32,
    pub http_max_concurrent_streams: usize,
    pub http_max_input_bytes: usize,

    pub sqlite_busy_timeout_ms: u64,
    pub sqlite_max_open_conns: u32,

    /// Tail lines of today's raw log injected as short-term context.
    pub recent_max_lines: usize,
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|v| v.trim().parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|v| v.trim().parse().ok())
}

fn env_f64_clamped(key: &str) -> Option<f64> {
    env_str(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|f| f.clamp(0.0, 1.0))
}

impl Config {
    pub fn from_env() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        let base_dir = env_str("TIMELAYER_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(home).join("timelayer"));

        let log_dir = base_dir.join("logs");
        let archive_dir = log_dir.join("archive");
        let prompt_dir = base_dir.join("prompts");
        let db_path = base_dir.join("memory").join("memory.sqlite");

        let mut cfg = Self {
            base_dir,
            log_dir,
            archive_dir,
            prompt_dir,
            db_path,
            keep_raw_days: 45,
            max_source_chunk_bytes: 25 * 1024 * 1024,
            http_timeout: Duration::from_secs(600),

            search_top_k: 5,
            search_min_score: 0.75,
            search_min_strong: 0.90,
            search_min_gap: 0.05,

            chat_url: "http://localhost:8080/v1/chat/completions".into(),
            embed_url: "http://localhost:8080/embedding".into(),
            chat_model: "Qwen3-8B-Q5_K_M.gguf".into(),

            enable_rerank: true,
            force_rerank: false,
            rerank_mode: RerankMode::Smart,
            rerank_url: "http://127.0.0.1:8090/v1/rerank_text".into(),
            rerank_top_n: 20,
            rerank_timeout: Duration::from_secs(15),
            rerank_min_batch: 2,

            http_addr: "127.0.0.1:3210".into(),
            http_auth_token: None,
            http_allow_insecure_remote: false,
            http_rate_limit_rpm: 120,
            http_max_concurrent_streams: 4,
            http_max_input_bytes: 64 * 1024,

            sqlite_busy_timeout_ms: 5000,
            sqlite_max_open_conns: 1,

            recent_max_lines: 20,
        };

        if let Some(v) = env_str("TIMELAYER_CHAT_URL") {
            cfg.chat_url = v;
        }
        if let Some(v) = env_str("TIMELAYER_EMBED_URL") {
            cfg.embed_url = v;
        }
        if let Some(v) = env_str("TIMELAYER_CHAT_MODEL") {
            cfg.chat_model = v;
        }
        if let Some(v) = env_str("TIMELAYER_HTTP_ADDR") {
            cfg.http_addr = v;
        }
        cfg.http_auth_token = env_str("TIMELAYER_HTTP_AUTH_TOKEN");
        if let Some(v) = env_bool("TIMELAYER_HTTP_ALLOW_INSECURE_REMOTE") {
            cfg.http_allow_insecure_remote = v;
        }
        if let Some(v) = env_u32("TIMELAYER_HTTP_RATE_LIMIT_RPM") {
            cfg.http_rate_limit_rpm = v;
        }
        if let Some(v) = env_usize("TIMELAYER_HTTP_MAX_CONCURRENT_STREAMS") {
            if v > 0 {
                cfg.http_max_concurrent_streams = v;
            }
        }
        if let Some(v) = env_usize("TIMELAYER_HTTP_MAX_INPUT_BYTES") {
            if v > 0 {
                cfg.http_max_input_bytes = v;
            }
        }
        if let Some(v) = env_usize("TIMELAYER_RECENT_MAX_LINES") {
            if v > 0 {
                cfg.recent_max_lines = v;
            }
        }

        if let Some(v) = env_bool("TIMELAYER_ENABLE_RERANK") {
            cfg.enable_rerank = v;
        }
        if let Some(v) = env_bool("TIMELAYER_RERANK_FORCE") {
            cfg.force_rerank = v;
        }
        if let Some(m) = env_str("TIMELAYER_RERANK_MODE").and_then(|v| RerankMode::parse(&v)) {
            cfg.rerank_mode = m;
        }
        if let Some(v) = env_str("TIMELAYER_RERANK_URL") {
            cfg.rerank_url = v;
        }
        if let Some(v) = env_usize("TIMELAYER_RERANK_TOPN") {
            if v > 0 {
                cfg.rerank_top_n = v;
            }
        }
        if let Some(ms) = env_usize("TIMELAYER_RERANK_TIMEOUT_MS") {
            if ms > 0 {
                cfg.rerank_timeout = Duration::from_millis(ms as u64);
            }
        }
        if let Some(v) = env_usize("TIMELAYER_RERANK_MIN_BATCH") {
            if v > 0 {
                cfg.rerank_min_batch = v;
            }
        }

        if let Some(f) = env_f64_clamped("TIMELAYER_SEARCH_MIN_STRONG") {
            cfg.search_min_strong = f;
        }
        if let Some(f) = env_f64_clamped("TIMELAYER_SEARCH_MIN_GAP") {
            cfg.search_min_gap = f;
        }

        if let Some(v) = env_usize("TIMELAYER_SQLITE_BUSY_TIMEOUT_MS") {
            cfg.sqlite_busy_timeout_ms = v as u64;
        }
        if let Some(v) = env_u32("TIMELAYER_SQLITE_MAX_OPEN_CONNS") {
            if v > 0 {
                cfg.sqlite_max_open_conns = v;
            }
        }
        if let Some(v) = env_u32("TIMELAYER_KEEP_RAW_DAYS") {
            cfg.keep_raw_days = v;
        }
        if let Some(v) = env_usize("TIMELAYER_MAX_CHUNK_BYTES") {
            if v > 0 {
                cfg.max_source_chunk_bytes = v as u64;
            }
        }

        cfg
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.log_dir)?;
        std::fs::create_dir_all(&self.archive_dir)?;
        std::fs::create_dir_all(&self.prompt_dir)?;
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
