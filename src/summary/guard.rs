//! Post-LLM, pre-persist summary guards and the embedding drift check.
//! Guards only warn; they never abort a pipeline run. Drift BLOCK prevents
//! the 1:1 embedding overwrite but keeps the regenerated summary.

use serde::Serialize;

use crate::db::MemoryDB;
use crate::facts::triple::extract_fact_subject;

pub const DRIFT_WARN_THRESHOLD: f64 = 0.15;
pub const DRIFT_BLOCK_THRESHOLD: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GuardKind {
    FactConflict,
    Lint,
}

impl GuardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FactConflict => "FACT_CONFLICT",
            Self::Lint => "LINT",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryWarning {
    pub kind: GuardKind,
    pub message: String,
}

/// Run all guards over a finished summary. Fact-conflict probing only makes
/// sense where day-level claims survive (daily/weekly).
pub fn run_summary_guards(db: &MemoryDB, summary_type: &str, summary_json: &str) -> Vec<SummaryWarning> {
    let mut warnings = Vec::new();

    if summary_type == "daily" || summary_type == "weekly" {
        let active = db.list_active_fact_texts(0).unwrap_or_default();
        warnings.extend(detect_fact_conflicts(&active, summary_json));
    }
    warnings.extend(lint_summary(summary_type, summary_json));
    warnings
}

/// Claim-like lines: the crude filter is any line carrying a copula-ish
/// marker. Deliberately not NLP.
fn extract_summary_claims(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| ["是", "为", "担任", "属于"].iter().any(|m| l.contains(m)))
        .collect()
}

/// Warn when a summary line shares a subject with an active fact but does
/// not contain that fact verbatim.
fn detect_fact_conflicts(active_facts: &[String], summary_json: &str) -> Vec<SummaryWarning> {
    let mut warnings = Vec::new();
    for claim in extract_summary_claims(summary_json) {
        let subject = extract_fact_subject(claim);
        if subject.is_empty() {
            continue;
        }
        for fact in active_facts {
            if extract_fact_subject(fact) != subject {
                continue;
            }
            if !claim.contains(fact.as_str()) {
                warnings.push(SummaryWarning {
                    kind: GuardKind::FactConflict,
                    message: format!(
                        "Summary claim may conflict with authoritative fact.\n- Fact: {fact}\n- Summary: {claim}"
                    ),
                });
            }
        }
    }
    warnings
}

const SPECULATIVE_WORDS: &[&str] = &["可能", "似乎", "推测", "大概", "建议", "应该", "值得"];

fn lint_summary(summary_type: &str, text: &str) -> Vec<SummaryWarning> {
    let mut warnings = Vec::new();
    for w in SPECULATIVE_WORDS {
        if text.contains(w) {
            warnings.push(SummaryWarning {
                kind: GuardKind::Lint,
                message: format!("Summary contains speculative or advisory word: {w:?}"),
            });
        }
    }
    if summary_type != "daily" && (text.contains("今天") || text.contains("昨日")) {
        warnings.push(SummaryWarning {
            kind: GuardKind::Lint,
            message: "Non-daily summary references specific day-level events".into(),
        });
    }
    warnings
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftLevel {
    Warn,
    Block,
}

impl DriftLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warn => "WARN",
            Self::Block => "BLOCK",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriftWarning {
    pub level: DriftLevel,
    pub distance: f64,
}

/// Compare a freshly generated embedding against the most recent historical
/// vector for this summary. First-time embeddings have nothing to drift from.
pub fn check_embedding_drift(db: &MemoryDB, summary_id: i64, new_vec: &[f32]) -> Option<DriftWarning> {
    let old = db.last_embedding_history(summary_id).ok()??;
    let d = crate::ai::cosine_distance(&old, new_vec);
    if d >= DRIFT_BLOCK_THRESHOLD {
        return Some(DriftWarning { level: DriftLevel::Block, distance: d });
    }
    if d >= DRIFT_WARN_THRESHOLD {
        return Some(DriftWarning { level: DriftLevel::Warn, distance: d });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lint_flags_speculative_words() {
        let ws = lint_summary("daily", "{\"highlights\":[\"可能需要重构\"]}");
        assert!(ws.iter().any(|w| w.kind == GuardKind::Lint));
    }

    #[test]
    fn lint_flags_day_anchor_only_for_non_daily() {
        assert!(lint_summary("daily", "今天完成了迁移").is_empty());
        let ws = lint_summary("weekly", "今天完成了迁移");
        assert_eq!(ws.len(), 1);
    }

    #[test]
    fn fact_conflict_probe_matches_subject_only() {
        let facts = vec!["娜娜的真名是刘娜".to_string()];
        // same subject, fact text not contained -> warn
        let ws = detect_fact_conflicts(&facts, "娜娜的真名是王娜");
        assert_eq!(ws.len(), 1);
        assert_eq!(ws[0].kind, GuardKind::FactConflict);
        // claim containing the fact verbatim -> clean
        let ws = detect_fact_conflicts(&facts, "确认过：娜娜的真名是刘娜");
        assert!(ws.is_empty());
        // unrelated subject -> clean
        let ws = detect_fact_conflicts(&facts, "小明是学生");
        assert!(ws.is_empty());
    }
}
