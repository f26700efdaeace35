//! Time-bucketed summary pipeline: daily from raw dialog, weekly from daily
//! JSON, monthly from weekly JSON. Each level shares the same skeleton:
//! force-delete or idempotent early-return, gather + slim sources, chunk,
//! prompt (with a merge reduce when chunked), validate JSON, guard, persist
//! file + summary row + index text, then drift-checked embedding.

pub mod guard;

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::ai::{self, AiClient};
use crate::config::Config;
use crate::error::TimeLayerError;
use crate::prompts;
use crate::util::{iso_week_key, iso_week_start, month_range, parse_month_key, parse_week_key};
use crate::{db_call, SharedDB};
use guard::{check_embedding_drift, run_summary_guards, DriftLevel};

/// A single dialog line as persisted in the day's JSONL log.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RawLine {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

// ---------------------------------------------------------------------------
// Daily
// ---------------------------------------------------------------------------

pub async fn ensure_daily(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    date: &str,
    force: bool,
) -> Result<(), TimeLayerError> {
    let out_path = cfg.log_dir.join(format!("{date}.daily.json"));

    if force {
        let d = date.to_string();
        db_call(db, move |m| m.delete_summary("daily", &d)).await??;
        let _ = std::fs::remove_file(&out_path);
    } else {
        let d = date.to_string();
        let exists = db_call(db, move |m| m.summary_exists("daily", &d)).await??;
        if exists {
            // Already summarized. Still re-run pending ingestion so late
            // fact confirmations keep flowing into the pending pool.
            if let Ok(existing) = std::fs::read_to_string(&out_path) {
                if let Err(e) = crate::pending::ingest_from_daily_json(db, date, &existing).await {
                    warn!(date, error = %e, "pending facts ingest failed");
                }
            }
            return Ok(());
        }
    }

    let log_path = cfg.log_dir.join(format!("{date}.jsonl"));
    let raw = match std::fs::read_to_string(&log_path) {
        Ok(s) if !s.trim().is_empty() => s,
        _ => return Ok(()),
    };

    let chunks = split_jsonl_chunks(&raw, cfg.max_source_chunk_bytes);
    let template = prompts::read_prompt(&cfg.prompt_dir, "daily.txt")?;

    let daily_json = if chunks.len() == 1 {
        let prompt = template
            .replace("{{DATE}}", date)
            .replace("{{TRANSCRIPT}}", &chunks[0]);
        let out = ai::llm_chat(ai, cfg, &prompt).await?;
        require_json("daily", &out)?;
        out
    } else {
        let mut partials = Vec::with_capacity(chunks.len());
        for (i, c) in chunks.iter().enumerate() {
            let transcript = format!("【PART {}/{}】\n{}", i + 1, chunks.len(), c);
            let prompt = template
                .replace("{{DATE}}", date)
                .replace("{{TRANSCRIPT}}", &transcript);
            let out = ai::llm_chat(ai, cfg, &prompt).await?;
            require_json(&format!("daily chunk {}", i + 1), &out)?;
            partials.push(out);
        }
        let merge = prompts::merge_prompt("daily", &[("date", date)], &partials);
        let merged = ai::llm_chat(ai, cfg, &merge).await?;
        require_json("daily merged", &merged)?;
        merged
    };

    // Implicit user facts from the raw dialog keep their own channel so the
    // LLM's explicit extractions are never overwritten.
    let raw_lines = parse_raw_lines(&raw);
    let implicit = extract_user_facts_from_raw(&raw_lines);
    let final_json = build_daily_final(&daily_json, &implicit)?;

    log_guard_warnings(db, "daily", &final_json).await;

    std::fs::write(&out_path, &final_json)
        .map_err(|e| TimeLayerError::Internal(format!("write daily file failed: {e}")))?;

    let index_text = extract_index_text(&final_json);
    let summary_id = {
        let (d, js, it) = (date.to_string(), final_json.clone(), index_text.clone());
        let src = log_path.to_string_lossy().to_string();
        db_call(db, move |m| m.upsert_summary("daily", &d, &d, &d, &js, &it, &src)).await??
    };

    ensure_embedding_with_drift_guard(db, ai, cfg, summary_id, "daily", date, &index_text).await;

    if let Err(e) = crate::pending::ingest_from_daily_json(db, date, &final_json).await {
        warn!(date, error = %e, "pending facts ingest failed");
    }
    info!(date, "daily summary ensured");
    Ok(())
}

// ---------------------------------------------------------------------------
// Weekly
// ---------------------------------------------------------------------------

pub async fn ensure_weekly(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    week_key: &str,
    force: bool,
) -> Result<(), TimeLayerError> {
    let out_path = cfg.log_dir.join(format!("{week_key}.weekly.json"));

    if force {
        let k = week_key.to_string();
        db_call(db, move |m| m.delete_summary("weekly", &k)).await??;
        let _ = std::fs::remove_file(&out_path);
    } else {
        let k = week_key.to_string();
        if db_call(db, move |m| m.summary_exists("weekly", &k)).await?? {
            return Ok(());
        }
    }

    let (year, week) = parse_week_key(week_key)
        .ok_or_else(|| TimeLayerError::Validation(format!("bad week key: {week_key}")))?;
    let start = iso_week_start(year, week)
        .ok_or_else(|| TimeLayerError::Validation(format!("bad week key: {week_key}")))?;
    let end = start + chrono::Duration::days(6);
    let week_start = start.format("%Y-%m-%d").to_string();
    let week_end = end.format("%Y-%m-%d").to_string();

    let dailies = collect_daily_for_week(cfg, start);
    if dailies.is_empty() {
        return Ok(());
    }

    let slimmed = slim_sources(
        "weekly",
        &dailies,
        &["date", "topics", "patterns", "open_questions", "highlights", "lowlights"],
    )?;
    let arr = serde_json::to_string(&slimmed)
        .map_err(|e| TimeLayerError::Internal(format!("weekly marshal failed: {e}")))?;
    let chunks = split_json_array_chunks(&arr, cfg.max_source_chunk_bytes);

    let template = prompts::read_prompt(&cfg.prompt_dir, "weekly.txt")?;
    let fill = |chunk: &str| {
        template
            .replace("{{WEEK_START}}", &week_start)
            .replace("{{WEEK_END}}", &week_end)
            .replace("{{DAILY_JSON_ARRAY}}", chunk)
    };

    let weekly_json = if chunks.len() == 1 {
        let out = ai::llm_chat(ai, cfg, &fill(&chunks[0])).await?;
        require_json("weekly", &out)?;
        out
    } else {
        let mut partials = Vec::with_capacity(chunks.len());
        for (i, c) in chunks.iter().enumerate() {
            let part = format!("/* PART {}/{} */\n{}", i + 1, chunks.len(), c);
            let out = ai::llm_chat(ai, cfg, &fill(&part)).await?;
            require_json(&format!("weekly chunk {}", i + 1), &out)?;
            partials.push(out);
        }
        let merge = prompts::merge_prompt(
            "weekly",
            &[
                ("week_key", week_key),
                ("week_start", week_start.as_str()),
                ("week_end", week_end.as_str()),
            ],
            &partials,
        );
        let merged = ai::llm_chat(ai, cfg, &merge).await?;
        require_json("weekly merged", &merged)?;
        merged
    };

    log_guard_warnings(db, "weekly", &weekly_json).await;

    std::fs::write(&out_path, &weekly_json)
        .map_err(|e| TimeLayerError::Internal(format!("write weekly file failed: {e}")))?;

    let index_text = extract_index_text(&weekly_json);
    let summary_id = {
        let (k, s, e2) = (week_key.to_string(), week_start.clone(), week_end.clone());
        let (js, it) = (weekly_json.clone(), index_text.clone());
        let src = out_path.to_string_lossy().to_string();
        db_call(db, move |m| m.upsert_summary("weekly", &k, &s, &e2, &js, &it, &src)).await??
    };

    ensure_embedding_with_drift_guard(db, ai, cfg, summary_id, "weekly", week_key, &index_text)
        .await;
    info!(week_key, "weekly summary ensured");
    Ok(())
}

// ---------------------------------------------------------------------------
// Monthly
// ---------------------------------------------------------------------------

pub async fn ensure_monthly(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    month_key: &str,
    force: bool,
) -> Result<(), TimeLayerError> {
    let out_path = cfg.log_dir.join(format!("{month_key}.monthly.json"));

    if force {
        let k = month_key.to_string();
        db_call(db, move |m| m.delete_summary("monthly", &k)).await??;
        let _ = std::fs::remove_file(&out_path);
    } else {
        let k = month_key.to_string();
        if db_call(db, move |m| m.summary_exists("monthly", &k)).await?? {
            return Ok(());
        }
    }

    let month_first = parse_month_key(month_key)
        .ok_or_else(|| TimeLayerError::Validation(format!("bad month key: {month_key}")))?;
    let (start, end) = month_range(month_first);
    let month_start = start.format("%Y-%m-%d").to_string();
    let month_end = end.format("%Y-%m-%d").to_string();

    let weeklies = collect_weekly_for_month(cfg, start, end);
    if weeklies.is_empty() {
        return Ok(());
    }

    let slimmed = slim_sources(
        "monthly",
        &weeklies,
        &[
            "week_start",
            "week_end",
            "themes",
            "progress",
            "recurring_blockers",
            "notable_decisions",
            "next_week_focus",
        ],
    )?;
    let arr = serde_json::to_string(&slimmed)
        .map_err(|e| TimeLayerError::Internal(format!("monthly marshal failed: {e}")))?;
    let chunks = split_json_array_chunks(&arr, cfg.max_source_chunk_bytes);

    let template = prompts::read_prompt(&cfg.prompt_dir, "monthly.txt")?;
    let fill = |chunk: &str| {
        template
            .replace("{{MONTH}}", month_key)
            .replace("{{MONTH_START}}", &month_start)
            .replace("{{MONTH_END}}", &month_end)
            .replace("{{WEEKLY_JSON_ARRAY}}", chunk)
    };

    let monthly_json = if chunks.len() == 1 {
        let out = ai::llm_chat(ai, cfg, &fill(&chunks[0])).await?;
        require_json("monthly", &out)?;
        out
    } else {
        let mut partials = Vec::with_capacity(chunks.len());
        for (i, c) in chunks.iter().enumerate() {
            let part = format!("/* PART {}/{} */\n{}", i + 1, chunks.len(), c);
            let out = ai::llm_chat(ai, cfg, &fill(&part)).await?;
            require_json(&format!("monthly chunk {}", i + 1), &out)?;
            partials.push(out);
        }
        let merge = prompts::merge_prompt(
            "monthly",
            &[
                ("month", month_key),
                ("month_start", month_start.as_str()),
                ("month_end", month_end.as_str()),
            ],
            &partials,
        );
        let merged = ai::llm_chat(ai, cfg, &merge).await?;
        require_json("monthly merged", &merged)?;
        merged
    };

    log_guard_warnings(db, "monthly", &monthly_json).await;

    std::fs::write(&out_path, &monthly_json)
        .map_err(|e| TimeLayerError::Internal(format!("write monthly file failed: {e}")))?;

    let index_text = extract_index_text(&monthly_json);
    let summary_id = {
        let (k, s, e2) = (month_key.to_string(), month_start.clone(), month_end.clone());
        let (js, it) = (monthly_json.clone(), index_text.clone());
        let src = out_path.to_string_lossy().to_string();
        db_call(db, move |m| m.upsert_summary("monthly", &k, &s, &e2, &js, &it, &src)).await??
    };

    ensure_embedding_with_drift_guard(db, ai, cfg, summary_id, "monthly", month_key, &index_text)
        .await;
    info!(month_key, "monthly summary ensured");
    Ok(())
}

// ---------------------------------------------------------------------------
// Embedding backfill (reindex)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Serialize)]
pub struct ReindexReport {
    pub total: usize,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Rebuild missing embeddings for existing summaries. Never regenerates the
/// summaries themselves.
pub async fn reindex(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    target: &str,
) -> Result<ReindexReport, TimeLayerError> {
    let filter = match target {
        "daily" | "weekly" | "monthly" => Some(target.to_string()),
        "all" => None,
        other => {
            return Err(TimeLayerError::Validation(format!("unknown reindex type: {other}")))
        }
    };

    let rows = db_call(db, move |m| m.summaries_for_reindex(filter.as_deref())).await??;
    let mut report = ReindexReport { total: rows.len(), ..Default::default() };

    for (id, typ, key, js) in rows {
        let exists = db_call(db, move |m| m.has_embedding(id)).await??;
        if exists {
            report.skipped += 1;
            continue;
        }
        let index_text = extract_index_text(&js);
        if index_text.is_empty() {
            report.skipped += 1;
            continue;
        }
        match ai::embed_text(ai, cfg, &index_text).await {
            Ok((vec, l2)) if !vec.is_empty() && l2 > 0.0 => {
                match db_call(db, move |m| m.upsert_embedding(id, &vec, l2)).await? {
                    Ok(()) => report.created += 1,
                    Err(e) => {
                        warn!(%typ, %key, error = %e, "reindex embedding write failed");
                        report.failed += 1;
                    }
                }
            }
            Ok(_) => report.skipped += 1,
            Err(e) => {
                warn!(%typ, %key, error = %e, "reindex embed failed");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn require_json(what: &str, out: &str) -> Result<(), TimeLayerError> {
    let out = out.trim();
    if out.is_empty() {
        return Err(TimeLayerError::Upstream(format!("{what} llm output is empty")));
    }
    serde_json::from_str::<Value>(out).map_err(|_| {
        TimeLayerError::Upstream(format!(
            "{what} llm output is not valid JSON\nraw:\n{}",
            crate::util::truncate_chars(out, 800)
        ))
    })?;
    Ok(())
}

async fn log_guard_warnings(db: &SharedDB, typ: &'static str, json: &str) {
    let js = json.to_string();
    if let Ok(warnings) = db_call(db, move |m| run_summary_guards(m, typ, &js)).await {
        for w in warnings {
            warn!(summary = typ, guard = w.kind.as_str(), "{}", w.message);
        }
    }
}

/// Shared tail of every pipeline run: fetch the fresh embedding once, apply
/// the drift guard against the history, append history unconditionally, and
/// overwrite the 1:1 embedding only when not blocked. Best-effort throughout.
async fn ensure_embedding_with_drift_guard(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    summary_id: i64,
    typ: &str,
    key: &str,
    index_text: &str,
) {
    let (vec, l2) = match ai::embed_text(ai, cfg, index_text).await {
        Ok(v) => v,
        Err(e) => {
            // Retrieval still works in degraded mode without a new vector.
            warn!(summary = typ, key, error = %e, "embedding fetch failed");
            return;
        }
    };
    if vec.is_empty() || l2 == 0.0 {
        return;
    }

    let blocked = {
        let v = vec.clone();
        match db_call(db, move |m| check_embedding_drift(m, summary_id, &v)).await {
            Ok(Some(w)) => {
                warn!(
                    summary = typ,
                    key,
                    level = w.level.as_str(),
                    distance = format!("{:.3}", w.distance),
                    "embedding drift detected"
                );
                w.level == DriftLevel::Block
            }
            _ => false,
        }
    };

    {
        let v = vec.clone();
        if let Ok(Err(e)) = db_call(db, move |m| m.append_embedding_history(summary_id, &v)).await {
            warn!(summary = typ, key, error = %e, "embedding history append failed");
        }
    }

    if blocked {
        return;
    }
    if let Ok(Err(e)) = db_call(db, move |m| m.upsert_embedding(summary_id, &vec, l2)).await {
        warn!(summary = typ, key, error = %e, "embedding write failed");
    }
}

pub fn parse_raw_lines(raw: &str) -> Vec<RawLine> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str::<RawLine>(l).ok())
        .collect()
}

/// Split raw JSONL into chunks of at most `max_bytes`, never breaking a
/// line. A single oversized line becomes its own chunk.
pub fn split_jsonl_chunks(raw: &str, max_bytes: u64) -> Vec<String> {
    let max_bytes = max_bytes.max(1) as usize;
    let mut chunks = Vec::new();
    let mut buf = String::new();

    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        if !buf.is_empty() && buf.len() + line.len() + 1 > max_bytes {
            chunks.push(std::mem::take(&mut buf));
        }
        buf.push_str(line);
        buf.push('\n');
        if buf.len() > max_bytes {
            chunks.push(std::mem::take(&mut buf));
        }
    }
    if !buf.is_empty() {
        chunks.push(buf);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

/// Split a JSON array into sub-array chunks of at most `max_bytes`,
/// respecting object boundaries. An unparseable payload falls back to a
/// hard byte split; a single oversized item becomes its own chunk.
pub fn split_json_array_chunks(arr_json: &str, max_bytes: u64) -> Vec<String> {
    let max = max_bytes.max(1) as usize;
    if arr_json.len() <= max {
        return vec![arr_json.to_string()];
    }

    let Ok(items) = serde_json::from_str::<Vec<Value>>(arr_json) else {
        return arr_json
            .as_bytes()
            .chunks(max)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect();
    };
    if items.is_empty() {
        return vec![arr_json.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut cur: Vec<Value> = Vec::new();
    let mut cur_size = 2usize; // "[]"

    let flush = |cur: &mut Vec<Value>, cur_size: &mut usize, chunks: &mut Vec<String>| {
        if cur.is_empty() {
            return;
        }
        if let Ok(s) = serde_json::to_string(&cur) {
            chunks.push(s);
        }
        cur.clear();
        *cur_size = 2;
    };

    for it in items {
        let it_str = serde_json::to_string(&it).unwrap_or_default();
        let add = it_str.len() + if cur.is_empty() { 0 } else { 1 };
        if !cur.is_empty() && cur_size + add > max {
            flush(&mut cur, &mut cur_size, &mut chunks);
        }
        if it_str.len() > max {
            flush(&mut cur, &mut cur_size, &mut chunks);
            chunks.push(format!("[{it_str}]"));
            continue;
        }
        cur_size += it_str.len() + if cur.is_empty() { 0 } else { 1 };
        cur.push(it);
    }
    flush(&mut cur, &mut cur_size, &mut chunks);

    if chunks.is_empty() {
        vec![arr_json.to_string()]
    } else {
        chunks
    }
}

fn slim_sources(
    what: &str,
    sources: &[String],
    keep_fields: &[&str],
) -> Result<Vec<Value>, TimeLayerError> {
    let mut out = Vec::with_capacity(sources.len());
    for s in sources {
        let s = s.trim();
        if s.is_empty() {
            continue;
        }
        let obj: Value = serde_json::from_str(s).map_err(|_| {
            TimeLayerError::Validation(format!("{what} refused: source summary invalid JSON"))
        })?;
        let mut slim = serde_json::Map::new();
        for &k in keep_fields {
            if let Some(v) = obj.get(k) {
                slim.insert(k.to_string(), v.clone());
            }
        }
        out.push(Value::Object(slim));
    }
    Ok(out)
}

fn collect_daily_for_week(cfg: &Config, week_start: NaiveDate) -> Vec<String> {
    let mut out = Vec::new();
    for i in 0..7 {
        let d = week_start + chrono::Duration::days(i);
        let path = cfg.log_dir.join(format!("{}.daily.json", d.format("%Y-%m-%d")));
        if let Ok(s) = std::fs::read_to_string(&path) {
            out.push(s.trim().to_string());
        }
    }
    out
}

fn collect_weekly_for_month(cfg: &Config, start: NaiveDate, end: NaiveDate) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    let mut d = start;
    while d <= end {
        let key = iso_week_key(d);
        if seen.insert(key.clone()) {
            let path = cfg.log_dir.join(format!("{key}.weekly.json"));
            if let Ok(s) = std::fs::read_to_string(&path) {
                out.push(s.trim().to_string());
            }
        }
        d += chrono::Duration::days(1);
    }
    out
}

// ---------------------------------------------------------------------------
// Implicit user facts from raw dialog
// ---------------------------------------------------------------------------

fn normalize_dialog_text(s: &str) -> String {
    s.trim()
        .replace('，', ",")
        .replace(['。', '！', '？'], "")
}

/// High-signal first-person statement: starts with 我, not a question, not
/// a request.
pub fn looks_like_self_statement(text: &str) -> bool {
    let text = text.trim();
    if text.is_empty() || !text.starts_with('我') {
        return false;
    }
    if text.ends_with('吗') || text.ends_with('?') || text.ends_with('？') {
        return false;
    }
    if text.contains("帮我") || text.contains("请你") {
        return false;
    }
    true
}

fn extract_user_core(text: &str) -> String {
    let t = text.trim().strip_prefix('我').unwrap_or(text).trim_matches(['。', '！', '!', ' ']);
    t.chars().take(20).collect()
}

fn assistant_affirms_user(user_text: &str, assistant_text: &str) -> bool {
    if !assistant_text.contains('你') {
        return false;
    }
    let core = extract_user_core(user_text);
    !core.is_empty() && assistant_text.contains(&core)
}

/// Scan (user, assistant) pairs for self-statements the assistant affirmed.
pub fn extract_user_facts_from_raw(lines: &[RawLine]) -> Vec<String> {
    let mut facts = Vec::new();
    for pair in lines.windows(2) {
        let (user, assistant) = (&pair[0], &pair[1]);
        if user.role != "user" || assistant.role != "assistant" {
            continue;
        }
        let u = normalize_dialog_text(&user.content);
        let a = normalize_dialog_text(&assistant.content);
        if looks_like_self_statement(&u) && assistant_affirms_user(&u, &a) {
            facts.push(user.content.clone());
        }
    }
    facts
}

/// Merge raw-extracted implicit facts into the LLM's daily JSON under
/// `user_facts_implicit` (deduplicated) and pretty-print the result.
pub fn build_daily_final(llm_json: &str, implicit: &[String]) -> Result<String, TimeLayerError> {
    let llm_json = llm_json.trim();
    if llm_json.is_empty() {
        return Err(TimeLayerError::Upstream("daily llm output is empty".into()));
    }
    let mut obj: Value = serde_json::from_str(llm_json).map_err(|e| {
        TimeLayerError::Upstream(format!("daily llm output json unmarshal failed: {e}"))
    })?;

    if !implicit.is_empty() {
        let mut merged: Vec<String> = obj
            .get("user_facts_implicit")
            .map(|v| match v {
                Value::Array(a) => a
                    .iter()
                    .filter_map(|x| x.as_str().map(str::to_string))
                    .collect(),
                Value::String(s) if !s.trim().is_empty() => vec![s.clone()],
                _ => vec![],
            })
            .unwrap_or_default();
        merged.extend(implicit.iter().cloned());

        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<Value> = merged
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .map(Value::String)
            .collect();
        if let Some(map) = obj.as_object_mut() {
            map.insert("user_facts_implicit".into(), Value::Array(deduped));
        }
    }

    serde_json::to_string_pretty(&obj)
        .map_err(|e| TimeLayerError::Internal(format!("daily json marshal failed: {e}")))
}

// ---------------------------------------------------------------------------
// Index text
// ---------------------------------------------------------------------------

const INDEX_FIELDS: &[&str] = &[
    "tags",
    "themes",
    "topics",
    "projects",
    "decisions",
    "patterns",
    "highlights",
    "lowlights",
    "user_facts_explicit",
    "next_week_focus",
    "next_month_bets",
];

/// Project a summary JSON onto its memory-friendly fields: deduplicated
/// strings between 2 and 200 chars, newline-joined. Falls back to the raw
/// JSON so an embedding always has content.
pub fn extract_index_text(summary_json: &str) -> String {
    let Ok(m) = serde_json::from_str::<Value>(summary_json) else {
        return summary_json.trim().to_string();
    };

    let mut parts: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    fn collect(v: &Value, parts: &mut Vec<String>, seen: &mut std::collections::HashSet<String>) {
        match v {
            Value::String(s) => {
                let s = s.trim();
                let n = s.chars().count();
                if (2..=200).contains(&n) && seen.insert(s.to_string()) {
                    parts.push(s.to_string());
                }
            }
            Value::Array(a) => a.iter().for_each(|x| collect(x, parts, seen)),
            Value::Object(o) => o.values().for_each(|x| collect(x, parts, seen)),
            _ => {}
        }
    }

    for k in INDEX_FIELDS {
        if let Some(v) = m.get(*k) {
            collect(v, &mut parts, &mut seen);
        }
    }

    let text = parts.join("\n");
    let text = text.trim();
    if text.is_empty() {
        summary_json.to_string()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_chunks_respect_line_boundaries() {
        let raw = "{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n";
        let chunks = split_jsonl_chunks(raw, 10);
        assert_eq!(chunks.len(), 3);
        for c in &chunks {
            assert!(c.ends_with('\n'));
            assert!(serde_json::from_str::<Value>(c.trim()).is_ok());
        }
        // one chunk when everything fits
        assert_eq!(split_jsonl_chunks(raw, 1024).len(), 1);
    }

    #[test]
    fn jsonl_chunk_count_matches_budget() {
        // 3 lines of 8 bytes each (incl. newline); budget 16 -> 2 per chunk
        let raw = "{\"x\":1}\n{\"x\":2}\n{\"x\":3}\n";
        let chunks = split_jsonl_chunks(raw, 16);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn oversized_line_becomes_own_chunk() {
        let big = format!("{{\"k\":\"{}\"}}", "x".repeat(64));
        let raw = format!("{{\"a\":1}}\n{big}\n{{\"b\":2}}\n");
        let chunks = split_jsonl_chunks(&raw, 32);
        assert!(chunks.iter().any(|c| c.trim() == big));
    }

    #[test]
    fn json_array_chunks_never_split_mid_item() {
        let arr = serde_json::to_string(&vec![
            serde_json::json!({"date":"2026-01-05","topics":["a","b"]}),
            serde_json::json!({"date":"2026-01-06","topics":["c"]}),
            serde_json::json!({"date":"2026-01-07","topics":["d","e","f"]}),
        ])
        .unwrap();
        let chunks = split_json_array_chunks(&arr, 60);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            let items: Vec<Value> = serde_json::from_str(c).unwrap();
            assert!(!items.is_empty());
        }
    }

    #[test]
    fn index_text_dedupes_and_bounds_length() {
        let js = serde_json::json!({
            "topics": ["rust", "rust", "a"],
            "highlights": ["shipped the parser"],
            "ignored_field": ["should not appear"],
            "user_facts_explicit": ["我最喜欢的颜色是黄色"]
        })
        .to_string();
        let text = extract_index_text(&js);
        assert_eq!(text.matches("rust").count(), 1);
        assert!(!text.contains('a') || text.contains("parser")); // "a" too short
        assert!(!text.contains("should not appear"));
        assert!(text.contains("我最喜欢的颜色是黄色"));
    }

    #[test]
    fn implicit_extraction_needs_affirmation() {
        let lines = vec![
            RawLine { role: "user".into(), content: "我最喜欢的颜色是黄色".into(), kind: None },
            RawLine { role: "assistant".into(), content: "明白了，你最喜欢的颜色是黄色".into(), kind: None },
            RawLine { role: "user".into(), content: "我是程序员".into(), kind: None },
            RawLine { role: "assistant".into(), content: "好的".into(), kind: None },
        ];
        let facts = extract_user_facts_from_raw(&lines);
        assert_eq!(facts, vec!["我最喜欢的颜色是黄色".to_string()]);
    }

    #[test]
    fn daily_final_merges_and_dedupes_implicit() {
        let llm = r#"{"type":"daily","user_facts_implicit":["我是程序员"]}"#;
        let implicit = vec!["我是程序员".to_string(), "我住在上海".to_string()];
        let out = build_daily_final(llm, &implicit).unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        let arr = v["user_facts_implicit"].as_array().unwrap();
        assert_eq!(arr.len(), 2);
    }
}
