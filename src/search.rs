//! Vector retrieval: a linear cosine scan over the embeddings table joined
//! to summaries, followed by an intent-gated cross-encoder rerank. The gate
//! trades precision gain against latency and never affects recall.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::{self, AiClient};
use crate::config::{Config, RerankMode};
use crate::error::TimeLayerError;
use crate::{db_call, SharedDB};

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Final score: rerank score when the reranker ran, else the embedding
    /// cosine.
    pub score: f64,
    /// Embedding cosine, kept for gate diagnostics.
    pub emb_score: f64,
    #[serde(rename = "type")]
    pub summary_type: String,
    pub date: String,
    pub text: String,
}

/// Small LRU for query embeddings so repeated queries skip the embed call.
#[derive(Clone)]
pub struct QueryEmbedCache {
    inner: Arc<Mutex<LruCache<String, (Vec<f32>, f64)>>>,
}

impl QueryEmbedCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).unwrap());
        Self { inner: Arc::new(Mutex::new(LruCache::new(cap))) }
    }

    pub fn get(&self, key: &str) -> Option<(Vec<f32>, f64)> {
        self.inner.lock().get(key).cloned()
    }

    pub fn put(&self, key: String, value: (Vec<f32>, f64)) {
        self.inner.lock().put(key, value);
    }
}

async fn embed_query(
    ai: &AiClient,
    cfg: &Config,
    cache: &QueryEmbedCache,
    query: &str,
) -> Result<(Vec<f32>, f64), TimeLayerError> {
    if let Some(hit) = cache.get(query) {
        debug!(query_len = query.len(), "query embedding cache hit");
        return Ok(hit);
    }
    let out = ai::embed_text(ai, cfg, query).await?;
    cache.put(query.to_string(), out.clone());
    Ok(out)
}

/// Human-readable preview for non-fact summaries: the stored highlights, or
/// a type placeholder.
fn extract_human_text(js: &str) -> String {
    let Ok(m) = serde_json::from_str::<serde_json::Value>(js) else {
        return js.trim().to_string();
    };
    let mut lines: Vec<String> = Vec::new();
    if let Some(hs) = m.get("highlights").and_then(|v| v.as_array()) {
        for h in hs {
            if let Some(s) = h.as_str() {
                lines.push(format!("- {s}"));
            }
        }
    }
    if lines.is_empty() {
        if let Some(t) = m.get("type") {
            lines.push(format!("summary type: {}", t.as_str().unwrap_or("?")));
        }
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Rerank intent gate
// ---------------------------------------------------------------------------

pub fn should_rerank(hits: &[SearchHit], cfg: &Config) -> bool {
    if !cfg.enable_rerank {
        return false;
    }
    // Force flag is consulted only after the master switch.
    if cfg.force_rerank {
        return hits.len() >= 2;
    }
    if hits.len() < cfg.rerank_min_batch || hits.len() < 2 {
        return false;
    }

    let top1 = hits[0].emb_score;
    let top2 = hits[1].emb_score;
    let gap = top1 - top2;

    match cfg.rerank_mode {
        RerankMode::Always => true,
        RerankMode::Ambiguous => {
            // Cross-encode only when embeddings cannot separate the leaders:
            // query strong, runner-up not weak, gap small.
            if top1 < cfg.search_min_strong {
                return false;
            }
            let t2min = (cfg.search_min_strong - cfg.search_min_gap).max(cfg.search_min_score);
            if top2 < t2min {
                return false;
            }
            gap <= cfg.search_min_gap * 1.8
        }
        RerankMode::Smart => top1 >= cfg.search_min_strong,
        RerankMode::Conservative => {
            top1 >= cfg.search_min_strong && gap >= cfg.search_min_gap * 1.8
        }
    }
}

/// Diagnostics only; mirrors `should_rerank` without affecting it.
pub fn explain_rerank_skip(hits: &[SearchHit], cfg: &Config) -> &'static str {
    if !cfg.enable_rerank {
        return "disabled";
    }
    if cfg.force_rerank {
        return if hits.len() >= 2 { "forced" } else { "forced_but_insufficient_hits" };
    }
    if hits.len() < cfg.rerank_min_batch {
        return "too_few_hits";
    }
    if hits.len() == 1 {
        return "single_hit";
    }

    let top1 = hits[0].emb_score;
    let top2 = hits[1].emb_score;
    let gap = top1 - top2;

    match cfg.rerank_mode {
        RerankMode::Always => "mode_always",
        RerankMode::Ambiguous => {
            if top1 < cfg.search_min_strong {
                return "weak_query";
            }
            let t2min = (cfg.search_min_strong - cfg.search_min_gap).max(cfg.search_min_score);
            if top2 < t2min {
                return "top2_too_weak";
            }
            if gap > cfg.search_min_gap * 1.8 {
                return "gap_too_large";
            }
            "unknown"
        }
        RerankMode::Smart => {
            if top1 < cfg.search_min_strong {
                return "weak_query";
            }
            "unknown"
        }
        RerankMode::Conservative => {
            if top1 < cfg.search_min_strong {
                return "weak_query";
            }
            if gap < cfg.search_min_gap * 1.8 {
                return "gap_too_small";
            }
            "unknown"
        }
    }
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

pub async fn search_with_score(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    cache: &QueryEmbedCache,
    query: &str,
) -> Result<Vec<SearchHit>, TimeLayerError> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(vec![]);
    }

    let (qv, qn) = embed_query(ai, cfg, cache, query).await?;
    if qn == 0.0 || qv.is_empty() {
        return Ok(vec![]);
    }

    let rows = db_call(db, move |m| m.embedding_scan_rows()).await??;

    let mut hits: Vec<SearchHit> = Vec::new();
    for (typ, key, js, index_text, blob, l2, dim) in rows {
        if dim != qv.len() || l2 == 0.0 {
            continue;
        }
        let Some(dot) = ai::dot_with_blob(&qv, &blob, dim) else { continue };
        let emb_score = dot / (qn * l2);
        if !emb_score.is_finite() || emb_score < cfg.search_min_score {
            continue;
        }

        let display = if typ == "fact" && !index_text.trim().is_empty() {
            index_text.trim().to_string()
        } else {
            extract_human_text(&js)
        };
        let display = display.trim().to_string();
        if display.is_empty() {
            continue;
        }

        hits.push(SearchHit {
            score: emb_score,
            emb_score,
            summary_type: typ,
            date: key,
            text: display,
        });
    }

    if hits.is_empty() {
        return Ok(vec![]);
    }

    hits.sort_by(|a, b| b.emb_score.partial_cmp(&a.emb_score).unwrap_or(std::cmp::Ordering::Equal));

    let top_n = cfg.rerank_top_n.max(cfg.search_top_k);
    hits.truncate(top_n);

    if should_rerank(&hits, cfg) {
        let docs: Vec<String> = hits.iter().map(|h| h.text.clone()).collect();
        match ai::rerank_texts(ai, cfg, query, &docs).await {
            Ok(scores) if scores.len() == hits.len() => {
                for (h, s) in hits.iter_mut().zip(scores) {
                    h.score = s;
                }
                hits.sort_by(|a, b| {
                    b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
                });
                debug!(hits = hits.len(), "rerank applied");
            }
            Ok(scores) => {
                warn!(scores = scores.len(), hits = hits.len(), "rerank length mismatch; keeping embedding order");
            }
            Err(e) => {
                let (top1, top2) = (
                    hits.first().map(|h| h.emb_score).unwrap_or(0.0),
                    hits.get(1).map(|h| h.emb_score).unwrap_or(0.0),
                );
                warn!(error = %e, top1, top2, "rerank failed; keeping embedding order");
            }
        }
    } else {
        let reason = explain_rerank_skip(&hits, cfg);
        if hits.len() >= 2 {
            let (top1, top2) = (hits[0].emb_score, hits[1].emb_score);
            info!(
                mode = cfg.rerank_mode.as_str(),
                reason,
                hits = hits.len(),
                top1 = format!("{top1:.4}"),
                top2 = format!("{top2:.4}"),
                gap = format!("{:.4}", top1 - top2),
                strong = format!("{:.4}", cfg.search_min_strong),
                gap_th = format!("{:.4}", cfg.search_min_gap),
                "rerank skipped"
            );
        } else {
            info!(mode = cfg.rerank_mode.as_str(), reason, hits = hits.len(), "rerank skipped");
        }
    }

    hits.truncate(cfg.search_top_k);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(emb: f64) -> SearchHit {
        SearchHit {
            score: emb,
            emb_score: emb,
            summary_type: "daily".into(),
            date: "2026-01-05".into(),
            text: "t".into(),
        }
    }

    fn gate_cfg(mode: RerankMode) -> Config {
        let mut cfg = Config::from_env();
        cfg.enable_rerank = true;
        cfg.force_rerank = false;
        cfg.rerank_mode = mode;
        cfg.rerank_min_batch = 2;
        cfg.search_min_score = 0.75;
        cfg.search_min_strong = 0.90;
        cfg.search_min_gap = 0.05;
        cfg
    }

    #[test]
    fn gate_disabled_wins_over_force() {
        let mut cfg = gate_cfg(RerankMode::Always);
        cfg.enable_rerank = false;
        cfg.force_rerank = true;
        let hits = vec![hit(0.99), hit(0.98)];
        assert!(!should_rerank(&hits, &cfg));
        assert_eq!(explain_rerank_skip(&hits, &cfg), "disabled");
    }

    #[test]
    fn gate_force_needs_two_hits() {
        let mut cfg = gate_cfg(RerankMode::Conservative);
        cfg.force_rerank = true;
        assert!(should_rerank(&[hit(0.8), hit(0.7)], &cfg));
        assert!(!should_rerank(&[hit(0.8)], &cfg));
    }

    #[test]
    fn gate_conservative_skips_weak_query() {
        let cfg = gate_cfg(RerankMode::Conservative);
        // top scores 0.81/0.80 with strong=0.90 -> weak_query
        let hits = vec![hit(0.81), hit(0.80)];
        assert!(!should_rerank(&hits, &cfg));
        assert_eq!(explain_rerank_skip(&hits, &cfg), "weak_query");
    }

    #[test]
    fn gate_conservative_needs_large_gap() {
        let cfg = gate_cfg(RerankMode::Conservative);
        let close = vec![hit(0.95), hit(0.93)];
        assert!(!should_rerank(&close, &cfg));
        assert_eq!(explain_rerank_skip(&close, &cfg), "gap_too_small");
        let wide = vec![hit(0.95), hit(0.80)];
        assert!(should_rerank(&wide, &cfg));
    }

    #[test]
    fn gate_smart_only_needs_strong_top1() {
        let cfg = gate_cfg(RerankMode::Smart);
        assert!(should_rerank(&[hit(0.92), hit(0.60)], &cfg));
        assert!(!should_rerank(&[hit(0.89), hit(0.88)], &cfg));
    }

    #[test]
    fn gate_ambiguous_wants_close_strong_pair() {
        let cfg = gate_cfg(RerankMode::Ambiguous);
        // strong pair, small gap -> rerank
        assert!(should_rerank(&[hit(0.93), hit(0.91)], &cfg));
        // top2 below max(min_score, strong - gap) -> skip
        let hits = vec![hit(0.93), hit(0.80)];
        assert!(!should_rerank(&hits, &cfg));
        assert_eq!(explain_rerank_skip(&hits, &cfg), "top2_too_weak");
        // gap too large
        let hits = vec![hit(0.999), hit(0.86)];
        assert!(!should_rerank(&hits, &cfg));
    }

    #[test]
    fn gate_always_mode() {
        let cfg = gate_cfg(RerankMode::Always);
        assert!(should_rerank(&[hit(0.76), hit(0.75)], &cfg));
        assert!(!should_rerank(&[hit(0.76)], &cfg));
    }

    #[test]
    fn human_text_prefers_highlights() {
        let js = r#"{"type":"daily","highlights":["shipped it","fixed bug"]}"#;
        let t = extract_human_text(js);
        assert!(t.contains("- shipped it"));
        let t = extract_human_text(r#"{"type":"weekly"}"#);
        assert_eq!(t, "summary type: weekly");
    }
}
