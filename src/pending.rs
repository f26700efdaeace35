//! Candidate-fact ingestion and UI grouping. Candidates arrive from daily
//! summaries (`user_facts_explicit` / `user_facts_implicit`) or manual adds;
//! confirmed active facts are filtered, low-confidence candidates dropped,
//! and surviving rows deduplicated against the pending pool.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ai::{self, AiClient};
use crate::config::Config;
use crate::db::{has_active_user_fact, upsert_pending_fact, PendingFact};
use crate::error::TimeLayerError;
use crate::facts::triple::derive_fact_key;
use crate::{db_call, SharedDB};

pub const MIN_CONFIDENCE: f64 = 0.75;
pub const DEFAULT_CONFIDENCE: f64 = 0.85;
const IMPLICIT_DEFAULT_CONFIDENCE: f64 = 0.80;

/// Cosine similarity at or above which two pending facts join a group.
const CLUSTER_THRESHOLD: f64 = 0.88;

const INSTRUCTION_WRAPPERS: &[&str] =
    &["记住：", "记住:", "请记住：", "请记住:", "帮我记住：", "帮我记住:"];

/// Strip instruction wrappers and trailing terminal punctuation so wrapper
/// variants of the same statement derive the same fact key.
pub fn normalize_pending_text(s: &str) -> String {
    let mut s = s.trim();
    for p in INSTRUCTION_WRAPPERS {
        if let Some(rest) = s.strip_prefix(p) {
            s = rest.trim();
            break;
        }
    }
    s.trim_end_matches(['。', '.', '!', '！']).trim().to_string()
}

/// Insert or refresh one pending candidate. Skips empty, low-confidence, or
/// already-active facts. Composable inside a fact-engine transaction.
pub fn add_pending_fact(
    conn: &Connection,
    fact: &str,
    confidence: f64,
    source_type: &str,
    source_key: &str,
) -> Result<(), TimeLayerError> {
    let fact = normalize_pending_text(fact);
    if fact.is_empty() {
        return Ok(());
    }
    let confidence = if confidence <= 0.0 { DEFAULT_CONFIDENCE } else { confidence };
    if confidence < MIN_CONFIDENCE {
        return Ok(());
    }
    let source_type = if source_type.is_empty() { "manual" } else { source_type };
    let source_key = if source_key.is_empty() {
        crate::db::today_str()
    } else {
        source_key.to_string()
    };

    let fact_key = derive_fact_key(&fact);
    if fact_key.is_empty() {
        return Ok(());
    }
    if has_active_user_fact(conn, &fact_key)? {
        return Ok(());
    }

    upsert_pending_fact(conn, &fact, &fact_key, confidence, source_type, &source_key)
}

/// Manual pending add (UI / API).
pub async fn add_pending_manual(
    db: &SharedDB,
    fact: &str,
    confidence: f64,
) -> Result<(), TimeLayerError> {
    let fact = fact.to_string();
    db_call(db, move |d| {
        d.with_tx(|tx| add_pending_fact(tx, &fact, confidence, "manual", ""))
    })
    .await?
}

// ---------------------------------------------------------------------------
// Daily-summary ingestion
// ---------------------------------------------------------------------------

/// A candidate may arrive as a bare string or an object carrying its own
/// confidence; both normalize on ingest.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CandidateWire {
    Text(String),
    Object {
        #[serde(default)]
        fact: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        confidence: Option<f64>,
    },
}

#[derive(Debug, Clone)]
struct Candidate {
    fact: String,
    /// None when the wire shape carried no usable confidence; the ingest
    /// path substitutes the per-channel default.
    confidence: Option<f64>,
}

fn parse_candidates(raw: Option<&serde_json::Value>) -> Vec<Candidate> {
    let mut out = Vec::new();
    let Some(raw) = raw else { return out };

    let mut push_wire = |w: CandidateWire| {
        let (fact, confidence) = match w {
            CandidateWire::Text(t) => (t, None),
            CandidateWire::Object { fact, content, confidence } => {
                (fact.or(content).unwrap_or_default(), confidence.filter(|c| *c > 0.0))
            }
        };
        let fact = fact.trim().to_string();
        if !fact.is_empty() {
            out.push(Candidate { fact, confidence });
        }
    };

    match raw {
        serde_json::Value::Array(items) => {
            for it in items {
                if let Ok(w) = serde_json::from_value::<CandidateWire>(it.clone()) {
                    push_wire(w);
                }
            }
        }
        serde_json::Value::String(s) => push_wire(CandidateWire::Text(s.clone())),
        _ => {}
    }
    out
}

/// Ingest high-confidence candidates from a daily summary JSON. Explicit
/// candidates win over implicit duplicates within the same batch. Failures
/// to parse never fail the daily pipeline.
pub async fn ingest_from_daily_json(
    db: &SharedDB,
    date: &str,
    daily_json: &str,
) -> Result<(), TimeLayerError> {
    let daily_json = daily_json.trim();
    if daily_json.is_empty() {
        return Ok(());
    }
    let Ok(obj) = serde_json::from_str::<serde_json::Value>(daily_json) else {
        return Ok(());
    };

    let explicit = parse_candidates(obj.get("user_facts_explicit"));
    let implicit = parse_candidates(obj.get("user_facts_implicit"));
    if explicit.is_empty() && implicit.is_empty() {
        return Ok(());
    }

    let explicit_texts: std::collections::HashSet<String> =
        explicit.iter().map(|c| c.fact.trim().to_string()).collect();
    let date = date.to_string();

    db_call(db, move |d| {
        d.with_tx(|tx| {
            for c in &explicit {
                let conf = c.confidence.unwrap_or(DEFAULT_CONFIDENCE);
                if conf < MIN_CONFIDENCE {
                    continue;
                }
                add_pending_fact(tx, &c.fact, conf, "daily", &date)?;
            }
            for c in &implicit {
                if explicit_texts.contains(c.fact.trim()) {
                    continue;
                }
                let conf = c.confidence.unwrap_or(IMPLICIT_DEFAULT_CONFIDENCE);
                if conf < MIN_CONFIDENCE {
                    continue;
                }
                add_pending_fact(tx, &c.fact, conf, "daily_implicit", &date)?;
            }
            Ok(())
        })
    })
    .await?
}

// ---------------------------------------------------------------------------
// UI grouping by embedding similarity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PendingFactGroup {
    pub group_id: String,
    pub rep: PendingFact,
    pub items: Vec<PendingFact>,
    pub size: usize,
}

struct PendingVec {
    v: Vec<f32>,
    l2: f64,
}

fn cosine(a: &PendingVec, b: &PendingVec) -> f64 {
    if a.v.is_empty() || a.v.len() != b.v.len() || a.l2 == 0.0 || b.l2 == 0.0 {
        return 0.0;
    }
    let dot: f64 = a.v.iter().zip(&b.v).map(|(&x, &y)| x as f64 * y as f64).sum();
    dot / (a.l2 * b.l2)
}

/// Group pending facts by cosine similarity over lazily computed, cached
/// embeddings. Same fact_key always merges; facts without a vector become
/// singletons. Groups order by size desc, then representative confidence.
pub async fn list_pending_groups(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    limit: usize,
) -> Result<Vec<PendingFactGroup>, TimeLayerError> {
    let mut items = db_call(db, move |d| d.list_pending_facts(limit)).await??;
    if items.is_empty() {
        return Ok(vec![]);
    }

    items.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });

    // Lazily resolve one vector per item: cache table first, then a
    // best-effort embed call whose result is persisted for next time.
    let mut vecs: Vec<PendingVec> = Vec::with_capacity(items.len());
    for it in &items {
        let id = it.id;
        let cached = db_call(db, move |d| d.pending_fact_embedding(id)).await??;
        if let Some((v, l2)) = cached {
            vecs.push(PendingVec { v, l2 });
            continue;
        }
        match ai::embed_text(ai, cfg, &it.fact).await {
            Ok((v, l2)) if !v.is_empty() && l2 > 0.0 => {
                let v2 = v.clone();
                if let Ok(Err(e)) =
                    db_call(db, move |d| d.upsert_pending_fact_embedding(id, &v2, l2)).await
                {
                    warn!(id, error = %e, "pending embedding cache write failed");
                }
                vecs.push(PendingVec { v, l2 });
            }
            Ok(_) => vecs.push(PendingVec { v: vec![], l2: 0.0 }),
            Err(e) => {
                warn!(id, error = %e, "pending embedding failed; singleton group");
                vecs.push(PendingVec { v: vec![], l2: 0.0 });
            }
        }
    }

    struct Group {
        rep_idx: usize,
        member_idxs: Vec<usize>,
    }
    let mut groups: Vec<Group> = Vec::new();

    'items: for i in 0..items.len() {
        // exact fact_key match always merges, embeddings or not
        for g in groups.iter_mut() {
            let rep = &items[g.rep_idx];
            if !rep.fact_key.is_empty() && rep.fact_key == items[i].fact_key {
                g.member_idxs.push(i);
                continue 'items;
            }
        }

        if vecs[i].v.is_empty() {
            groups.push(Group { rep_idx: i, member_idxs: vec![i] });
            continue;
        }

        let mut best: Option<(usize, f64)> = None;
        for (gi, g) in groups.iter().enumerate() {
            let sim = cosine(&vecs[i], &vecs[g.rep_idx]);
            if best.map(|(_, s)| sim > s).unwrap_or(true) {
                best = Some((gi, sim));
            }
        }
        match best {
            Some((gi, sim)) if sim >= CLUSTER_THRESHOLD => groups[gi].member_idxs.push(i),
            _ => groups.push(Group { rep_idx: i, member_idxs: vec![i] }),
        }
    }

    groups.sort_by(|a, b| {
        b.member_idxs.len().cmp(&a.member_idxs.len()).then_with(|| {
            items[b.rep_idx]
                .confidence
                .partial_cmp(&items[a.rep_idx].confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    });

    let out = groups
        .into_iter()
        .enumerate()
        .map(|(n, g)| {
            let mut members: Vec<PendingFact> =
                g.member_idxs.iter().map(|&i| items[i].clone()).collect();
            members.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.fact.cmp(&b.fact))
            });
            PendingFactGroup {
                group_id: format!("g{}", n + 1),
                rep: items[g.rep_idx].clone(),
                size: members.len(),
                items: members,
            }
        })
        .collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_normalization() {
        assert_eq!(normalize_pending_text("记住：我最喜欢的颜色是黄色。"), "我最喜欢的颜色是黄色");
        assert_eq!(normalize_pending_text("请记住: 我的生日是5月1日!"), "我的生日是5月1日");
        assert_eq!(normalize_pending_text("  plain fact  "), "plain fact");
    }

    #[test]
    fn candidates_accept_both_shapes() {
        let v: serde_json::Value = serde_json::json!([
            "我最喜欢的颜色是黄色",
            {"fact": "我的生日是5月1日", "confidence": 0.9},
            {"content": "我住在上海"},
            {"unknown": true}
        ]);
        let cands = parse_candidates(Some(&v));
        assert_eq!(cands.len(), 3);
        assert_eq!(cands[0].confidence, None);
        assert!((cands[1].confidence.unwrap() - 0.9).abs() < 1e-9);
        assert_eq!(cands[2].confidence, None);
    }
}
