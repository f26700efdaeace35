//! Append-only per-day dialog log. One JSON object per line, atomic line
//! writes under a mutex, day-rollover detection on write, and a rollup
//! trigger that runs outside the lock so summary generation never blocks
//! concurrent writes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{Datelike, Local};
use parking_lot::Mutex;
use tracing::warn;

use crate::ai::AiClient;
use crate::config::Config;
use crate::error::TimeLayerError;
use crate::summary::{self, RawLine};
use crate::util::{iso_week_key, parse_date, sanitize_text};
use crate::SharedDB;

struct Inner {
    file: Option<File>,
    current_day: String,
    /// Guard so a rollover fires its rollup at most once.
    last_rotated_day: String,
}

pub struct LogWriter {
    cfg: Config,
    db: SharedDB,
    ai: AiClient,
    inner: Mutex<Inner>,
}

impl LogWriter {
    pub fn new(cfg: Config, db: SharedDB, ai: AiClient) -> Self {
        Self {
            cfg,
            db,
            ai,
            inner: Mutex::new(Inner {
                file: None,
                current_day: String::new(),
                last_rotated_day: String::new(),
            }),
        }
    }

    pub fn log_path_for(&self, date: &str) -> PathBuf {
        self.cfg.log_dir.join(format!("{date}.jsonl"))
    }

    /// Append one dialog line to today's log. Detects day rollover and, at
    /// most once per rollover, kicks off the rollup in a background task
    /// after releasing the mutex, so writers never wait on summarization.
    pub fn write_record(&self, rec: &RawLine) -> Result<(), TimeLayerError> {
        let clean = RawLine {
            role: rec.role.trim().to_string(),
            content: sanitize_text(&rec.content),
            kind: rec.kind.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(String::from),
        };
        let mut line = serde_json::to_string(&clean)
            .map_err(|e| TimeLayerError::Internal(format!("log marshal failed: {e}")))?;
        line.push('\n');

        let today = crate::db::today_str();
        let mut rotate_day: Option<String> = None;

        {
            let mut inner = self.inner.lock();
            if !inner.current_day.is_empty() && inner.current_day != today {
                let yesterday = std::mem::take(&mut inner.current_day);
                inner.file = None;
                if inner.last_rotated_day != yesterday {
                    inner.last_rotated_day = yesterday.clone();
                    rotate_day = Some(yesterday);
                }
            }
            if inner.file.is_none() {
                std::fs::create_dir_all(&self.cfg.log_dir)
                    .map_err(|e| TimeLayerError::Internal(format!("log dir: {e}")))?;
                let f = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.log_path_for(&today))
                    .map_err(|e| TimeLayerError::Internal(format!("open log: {e}")))?;
                inner.file = Some(f);
                inner.current_day = today.clone();
            }
        }

        if let Some(yesterday) = rotate_day {
            self.spawn_rollup(yesterday, today.clone());
        }

        let mut inner = self.inner.lock();
        let f = inner
            .file
            .as_mut()
            .ok_or_else(|| TimeLayerError::Internal("log file not open".into()))?;
        f.write_all(line.as_bytes())
            .map_err(|e| TimeLayerError::Internal(format!("log write: {e}")))?;
        Ok(())
    }

    fn spawn_rollup(&self, yesterday: String, today: String) {
        let (db, ai, cfg) = (self.db.clone(), self.ai.clone(), self.cfg.clone());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    rollup_and_archive(&db, &ai, &cfg, &yesterday, &today).await;
                });
            }
            Err(_) => warn!(yesterday, "no runtime for rollup; skipping"),
        }
    }
}

/// Day boundary work: derive yesterday's daily summary, then weekly/monthly
/// when their boundaries were crossed, then rotate expired raw logs.
pub async fn rollup_and_archive(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    yesterday: &str,
    today: &str,
) {
    if let Err(e) = summary::ensure_daily(db, ai, cfg, yesterday, false).await {
        warn!(date = yesterday, error = %e, "ensure daily failed");
    }

    let (Some(y), Some(t)) = (parse_date(yesterday), parse_date(today)) else { return };

    if iso_week_key(y) != iso_week_key(t) {
        let week_key = iso_week_key(y);
        if let Err(e) = summary::ensure_weekly(db, ai, cfg, &week_key, false).await {
            warn!(week_key, error = %e, "ensure weekly failed");
        }
    }

    if (y.year(), y.month()) != (t.year(), t.month()) {
        let month_key = y.format("%Y-%m").to_string();
        if let Err(e) = summary::ensure_monthly(db, ai, cfg, &month_key, false).await {
            warn!(month_key, error = %e, "ensure monthly failed");
        }
    }

    if let Err(e) = archive_old_raw_logs(cfg) {
        warn!(error = %e, "raw log archive failed");
    }
}

/// Move raw `YYYY-MM-DD.jsonl` files older than `keep_raw_days` into the
/// archive directory. Summary JSON files are never rotated.
pub fn archive_old_raw_logs(cfg: &Config) -> std::io::Result<usize> {
    if cfg.keep_raw_days == 0 {
        return Ok(0);
    }
    std::fs::create_dir_all(&cfg.archive_dir)?;
    let cutoff = Local::now().date_naive() - chrono::Duration::days(cfg.keep_raw_days as i64);

    let mut moved = 0usize;
    for entry in std::fs::read_dir(&cfg.log_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(date_part) = name.strip_suffix(".jsonl") else { continue };
        let Some(date) = parse_date(date_part) else { continue };
        if date >= cutoff {
            continue;
        }
        let dest = cfg.archive_dir.join(name);
        if std::fs::rename(entry.path(), &dest).is_ok() {
            moved += 1;
        }
    }
    Ok(moved)
}
