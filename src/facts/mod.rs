//! Fact lifecycle engine: a proposal keyed by its derived fact key moves
//! through pending / active / rejected / conflict, with every transition
//! recorded in the append-only history. All transitions are transactional;
//! the semantic-search mirror and remote embedding run post-commit and are
//! best-effort.

pub mod triple;

use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::ai::{self, AiClient};
use crate::config::Config;
use crate::db::{
    append_user_fact_history, create_user_fact_conflict, get_active_user_fact_by_key,
    get_active_user_fact_by_slot, get_fact_conflict_by_id, get_pending_fact_by_id,
    set_conflict_status, set_pending_fact_status, today_str, upsert_user_fact,
};
use crate::error::TimeLayerError;
use crate::pending::add_pending_fact;
use crate::{db_call, SharedDB};
use triple::{derive_fact_key, extract_fact_triple};

const TX_ATTEMPTS: u32 = 3;
const TX_BACKOFF: Duration = Duration::from_millis(25);

/// Confidence attached to an explicit "remember" that lands in pending.
const EXPLICIT_PENDING_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Remembered,
    Pending,
    Conflict,
    Noop,
}

#[derive(Debug, Clone, Serialize)]
pub struct RememberOutcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub fact_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing: Option<String>,
}

impl RememberOutcome {
    fn noop() -> Self {
        Self { status: OutcomeStatus::Noop, fact_key: String::new(), conflict_id: None, existing: None }
    }

    fn with(status: OutcomeStatus, fact_key: impl Into<String>) -> Self {
        Self { status, fact_key: fact_key.into(), conflict_id: None, existing: None }
    }
}

fn default_source<'a>(source_type: &'a str, fallback: &'a str) -> &'a str {
    if source_type.is_empty() { fallback } else { source_type }
}

fn default_source_key(source_key: &str) -> String {
    if source_key.is_empty() { today_str() } else { source_key.to_string() }
}

// ---------------------------------------------------------------------------
// Core transition (shared by remember / accept-pending), transaction-scoped
// ---------------------------------------------------------------------------

/// Propose `content` as the new active truth. Conflict detection order:
/// exact fact_key first, then the (subject, relation) slot. The slot check
/// is skipped when the triple's relation is not single-valued.
fn propose_remember_with(
    conn: &rusqlite::Connection,
    content: &str,
    source_type: &str,
    source_key: &str,
) -> Result<RememberOutcome, TimeLayerError> {
    let content = content.trim();
    if content.is_empty() {
        return Ok(RememberOutcome::noop());
    }
    let fact_key = derive_fact_key(content);
    if fact_key.is_empty() {
        return Ok(RememberOutcome::noop());
    }

    // 1) exact key
    if let Some(existing) = get_active_user_fact_by_key(conn, &fact_key)? {
        if existing.trim() == content {
            // same truth, refresh updated_at
            upsert_user_fact(conn, &existing, &fact_key, true)?;
            return Ok(RememberOutcome::with(OutcomeStatus::Noop, fact_key));
        }
        let cid = create_user_fact_conflict(conn, &fact_key, &existing, content, source_type, source_key)?;
        if cid > 0 {
            append_user_fact_history(conn, &fact_key, content, "conflict", source_type, source_key)?;
        }
        return Ok(RememberOutcome {
            status: OutcomeStatus::Conflict,
            fact_key,
            conflict_id: (cid > 0).then_some(cid),
            existing: Some(existing),
        });
    }

    // 2) (subject, relation) slot across differently derived keys
    if let Some(slot_key) = extract_fact_triple(content).slot_key() {
        if let Some((existing_key, existing_fact)) = get_active_user_fact_by_slot(conn, &slot_key)? {
            if existing_fact.trim() == content {
                upsert_user_fact(conn, &existing_fact, &existing_key, true)?;
                return Ok(RememberOutcome::with(OutcomeStatus::Noop, existing_key));
            }
            let cid = create_user_fact_conflict(
                conn, &existing_key, &existing_fact, content, source_type, source_key,
            )?;
            if cid > 0 {
                append_user_fact_history(conn, &existing_key, content, "conflict", source_type, source_key)?;
            }
            return Ok(RememberOutcome {
                status: OutcomeStatus::Conflict,
                fact_key: existing_key,
                conflict_id: (cid > 0).then_some(cid),
                existing: Some(existing_fact),
            });
        }
    }

    // accept as new truth
    upsert_user_fact(conn, content, &fact_key, true)?;
    append_user_fact_history(conn, &fact_key, content, "active", source_type, source_key)?;
    Ok(RememberOutcome::with(OutcomeStatus::Remembered, fact_key))
}

/// Same conflict rules as `propose_remember_with`, but a new truth lands in
/// the pending pool for user confirmation instead of the active table.
fn propose_pending_with(
    conn: &rusqlite::Connection,
    content: &str,
    source_type: &str,
    source_key: &str,
) -> Result<RememberOutcome, TimeLayerError> {
    let content = content.trim();
    if content.is_empty() {
        return Ok(RememberOutcome::noop());
    }
    let fact_key = derive_fact_key(content);
    if fact_key.is_empty() {
        return Ok(RememberOutcome::noop());
    }

    if let Some(existing) = get_active_user_fact_by_key(conn, &fact_key)? {
        if existing.trim() == content {
            upsert_user_fact(conn, &existing, &fact_key, true)?;
            return Ok(RememberOutcome::with(OutcomeStatus::Noop, fact_key));
        }
        let cid = create_user_fact_conflict(conn, &fact_key, &existing, content, source_type, source_key)?;
        if cid > 0 {
            append_user_fact_history(conn, &fact_key, content, "conflict", source_type, source_key)?;
        }
        return Ok(RememberOutcome {
            status: OutcomeStatus::Conflict,
            fact_key,
            conflict_id: (cid > 0).then_some(cid),
            existing: Some(existing),
        });
    }

    if let Some(slot_key) = extract_fact_triple(content).slot_key() {
        if let Some((existing_key, existing_fact)) = get_active_user_fact_by_slot(conn, &slot_key)? {
            if existing_fact.trim() == content {
                upsert_user_fact(conn, &existing_fact, &existing_key, true)?;
                return Ok(RememberOutcome::with(OutcomeStatus::Noop, existing_key));
            }
            let cid = create_user_fact_conflict(
                conn, &existing_key, &existing_fact, content, source_type, source_key,
            )?;
            if cid > 0 {
                append_user_fact_history(conn, &existing_key, content, "conflict", source_type, source_key)?;
            }
            return Ok(RememberOutcome {
                status: OutcomeStatus::Conflict,
                fact_key: existing_key,
                conflict_id: (cid > 0).then_some(cid),
                existing: Some(existing_fact),
            });
        }
    }

    add_pending_fact(conn, content, EXPLICIT_PENDING_CONFIDENCE, source_type, source_key)?;
    Ok(RememberOutcome::with(OutcomeStatus::Pending, fact_key))
}

// ---------------------------------------------------------------------------
// Public operations (transaction + bounded retry + post-commit effects)
// ---------------------------------------------------------------------------

/// Store a fact directly as active truth, or record a conflict. The search
/// mirror sync runs post-commit and never undoes the transition.
pub async fn propose_remember(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    content: &str,
    source_type: &str,
    source_key: &str,
) -> Result<RememberOutcome, TimeLayerError> {
    let content = content.trim().to_string();
    if content.is_empty() {
        return Ok(RememberOutcome::noop());
    }
    let st = default_source(source_type, "remember").to_string();
    let sk = default_source_key(source_key);

    let content2 = content.clone();
    let st2 = st.clone();
    let out = db_call(db, move |d| {
        d.with_retry(TX_ATTEMPTS, TX_BACKOFF, || {
            d.with_tx(|tx| propose_remember_with(tx, &content2, &st2, &sk))
        })
    })
    .await??;

    if out.status == OutcomeStatus::Remembered {
        sync_fact_to_search(db, ai, cfg, &out.fact_key, &content, &st).await;
    }
    Ok(out)
}

/// Like `propose_remember`, but new truths go to the pending pool.
pub async fn propose_pending(
    db: &SharedDB,
    content: &str,
    source_type: &str,
    source_key: &str,
) -> Result<RememberOutcome, TimeLayerError> {
    let content = content.trim().to_string();
    if content.is_empty() {
        return Ok(RememberOutcome::noop());
    }
    let st = default_source(source_type, "remember_auto").to_string();
    let sk = default_source_key(source_key);

    db_call(db, move |d| {
        d.with_retry(TX_ATTEMPTS, TX_BACKOFF, || {
            d.with_tx(|tx| propose_pending_with(tx, &content, &st, &sk))
        })
    })
    .await?
}

/// Deactivate the current truth for this fact (by key, falling back to the
/// slot) and remove its search mirror. No-op when nothing is active.
pub async fn retract(
    db: &SharedDB,
    content: &str,
    source_type: &str,
    source_key: &str,
) -> Result<(), TimeLayerError> {
    let content = content.trim().to_string();
    if content.is_empty() {
        return Ok(());
    }
    let st = default_source(source_type, "forget").to_string();
    let sk = default_source_key(source_key);

    let removed_key = db_call(db, move |d| {
        d.with_retry(TX_ATTEMPTS, TX_BACKOFF, || {
            d.with_tx(|tx| {
                let fact_key = derive_fact_key(&content);
                if !fact_key.is_empty() {
                    if let Some(existing) = get_active_user_fact_by_key(tx, &fact_key)? {
                        upsert_user_fact(tx, &existing, &fact_key, false)?;
                        append_user_fact_history(tx, &fact_key, &existing, "forgotten", &st, &sk)?;
                        return Ok(Some(fact_key));
                    }
                }
                if let Some(slot_key) = extract_fact_triple(&content).slot_key() {
                    if let Some((existing_key, existing_fact)) =
                        get_active_user_fact_by_slot(tx, &slot_key)?
                    {
                        upsert_user_fact(tx, &existing_fact, &existing_key, false)?;
                        append_user_fact_history(
                            tx, &existing_key, &existing_fact, "forgotten", &st, &sk,
                        )?;
                        return Ok(Some(existing_key));
                    }
                }
                Ok(None)
            })
        })
    })
    .await??;

    if let Some(key) = removed_key {
        remove_fact_from_search(db, &key, "forgotten").await;
    }
    Ok(())
}

/// Promote a pending fact through the same conflict rules. The pending row's
/// status becomes accepted or conflict.
pub async fn remember_pending(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    id: i64,
) -> Result<RememberOutcome, TimeLayerError> {
    let (out, accepted_content, accepted_source) = db_call(db, move |d| {
        d.with_retry(TX_ATTEMPTS, TX_BACKOFF, || {
            d.with_tx(|tx| {
                let pf = get_pending_fact_by_id(tx, id)?
                    .filter(|p| p.status == "pending")
                    .ok_or(TimeLayerError::NotFound)?;

                let out = propose_remember_with(tx, &pf.fact, "pending", &pf.source_key)?;
                let new_status = if out.status == OutcomeStatus::Conflict { "conflict" } else { "accepted" };
                set_pending_fact_status(tx, id, new_status)?;
                Ok((out, pf.fact.trim().to_string(), pf.source_type))
            })
        })
    })
    .await??;

    if out.status == OutcomeStatus::Remembered {
        sync_fact_to_search(db, ai, cfg, &out.fact_key, &accepted_content, &accepted_source).await;
    }
    Ok(out)
}

/// Reject a pending fact; the audit trail gets a `rejected` version row.
pub async fn reject_pending(db: &SharedDB, id: i64) -> Result<(), TimeLayerError> {
    db_call(db, move |d| {
        d.with_retry(TX_ATTEMPTS, TX_BACKOFF, || {
            d.with_tx(|tx| {
                let pf = get_pending_fact_by_id(tx, id)?
                    .filter(|p| p.status == "pending")
                    .ok_or(TimeLayerError::NotFound)?;
                set_pending_fact_status(tx, id, "rejected")?;
                let fact_key = derive_fact_key(&pf.fact);
                append_user_fact_history(
                    tx,
                    &fact_key,
                    pf.fact.trim(),
                    "rejected",
                    "pending_reject",
                    &format!("pending:{}", pf.id),
                )?;
                Ok(())
            })
        })
    })
    .await?
}

/// Keep the existing truth; the proposed fact is recorded as rejected.
pub async fn resolve_conflict_keep(db: &SharedDB, id: i64) -> Result<(), TimeLayerError> {
    db_call(db, move |d| {
        d.with_retry(TX_ATTEMPTS, TX_BACKOFF, || {
            d.with_tx(|tx| {
                let c = get_fact_conflict_by_id(tx, id)?
                    .filter(|c| c.status == "conflict")
                    .ok_or(TimeLayerError::NotFound)?;
                append_user_fact_history(
                    tx,
                    &c.fact_key,
                    &c.proposed_fact,
                    "rejected",
                    "conflict_keep",
                    &format!("conflict:{}", c.id),
                )?;
                set_conflict_status(tx, id, "resolved_keep")?;
                Ok(())
            })
        })
    })
    .await?
}

/// Archive the current truth and replace it with `replacement` (defaulting
/// to the proposed fact). Post-commit, the search mirror follows the new
/// truth.
pub async fn resolve_conflict_replace(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    id: i64,
    replacement: Option<String>,
) -> Result<(), TimeLayerError> {
    let (fact_key, new_fact) = db_call(db, move |d| {
        d.with_retry(TX_ATTEMPTS, TX_BACKOFF, || {
            let replacement = replacement.clone();
            d.with_tx(|tx| {
                let c = get_fact_conflict_by_id(tx, id)?
                    .filter(|c| c.status == "conflict")
                    .ok_or(TimeLayerError::NotFound)?;

                let repl = replacement
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(c.proposed_fact.trim())
                    .to_string();
                if repl.is_empty() {
                    return Err(TimeLayerError::Validation("replacement fact empty".into()));
                }

                let source_key = format!("conflict:{}", c.id);
                let current = get_active_user_fact_by_key(tx, &c.fact_key)?;

                upsert_user_fact(tx, &repl, &c.fact_key, true)?;
                if let Some(cur) = current.filter(|s| !s.trim().is_empty()) {
                    append_user_fact_history(
                        tx, &c.fact_key, &cur, "archived", "conflict_replace", &source_key,
                    )?;
                }
                append_user_fact_history(
                    tx, &c.fact_key, &repl, "active", "conflict_replace", &source_key,
                )?;
                set_conflict_status(tx, id, "resolved_replace")?;
                Ok((c.fact_key, repl))
            })
        })
    })
    .await??;

    sync_fact_to_search(db, ai, cfg, &fact_key, &new_fact, "conflict_replace").await;
    Ok(())
}

/// Batch promotion; errors are per-id, not batch-fatal.
pub async fn remember_pending_batch(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    ids: &[i64],
) -> Vec<(i64, Option<RememberOutcome>)> {
    let mut out = Vec::with_capacity(ids.len());
    for &id in ids {
        if id <= 0 {
            continue;
        }
        match remember_pending(db, ai, cfg, id).await {
            Ok(o) => out.push((id, Some(o))),
            Err(e) => {
                warn!(id, error = %e, "remember pending failed");
                out.push((id, None));
            }
        }
    }
    out
}

pub async fn reject_pending_batch(db: &SharedDB, ids: &[i64]) -> Result<(), TimeLayerError> {
    let mut failed = 0usize;
    let mut first_err = None;
    for &id in ids {
        if id <= 0 {
            continue;
        }
        if let Err(e) = reject_pending(db, id).await {
            failed += 1;
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    match first_err {
        Some(e) => Err(TimeLayerError::Internal(format!(
            "reject batch: {failed}/{} failed (first: {e})",
            ids.len()
        ))),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Search-index mirror (post-commit, best-effort)
// ---------------------------------------------------------------------------

/// Mirror the current truth into the retrieval index: a synthetic summary
/// row `type="fact"` keyed `fact:<fact_key>` with the fact as index text,
/// re-embedded. Only call after the fact is committed as current truth.
pub async fn sync_fact_to_search(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    fact_key: &str,
    content: &str,
    source: &str,
) {
    let content = content.trim().to_string();
    if fact_key.is_empty() || content.is_empty() {
        return;
    }
    let today = today_str();
    let summary_key = format!("fact:{fact_key}");
    let source = source.to_string();

    let content2 = content.clone();
    let id = match db_call(db, move |d| {
        d.upsert_summary("fact", &summary_key, &today, &today, "", &content2, &source)
    })
    .await
    {
        Ok(Ok(id)) => id,
        Ok(Err(e)) => {
            warn!(fact_key, error = %e, "fact mirror upsert failed");
            return;
        }
        Err(e) => {
            warn!(fact_key, error = %e, "fact mirror upsert failed");
            return;
        }
    };

    match ai::embed_text(ai, cfg, &content).await {
        Ok((vec, l2)) if !vec.is_empty() && l2 > 0.0 => {
            if let Ok(Err(e)) = db_call(db, move |d| d.upsert_embedding(id, &vec, l2)).await {
                warn!(fact_key, error = %e, "fact mirror embedding write failed");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(fact_key, error = %e, "fact mirror embedding failed"),
    }
}

/// Drop the mirror's embedding and stamp the mirror row with the removal
/// reason so retrieval stops surfacing retracted truths.
pub async fn remove_fact_from_search(db: &SharedDB, fact_key: &str, reason: &str) {
    let summary_key = format!("fact:{fact_key}");
    let reason = reason.to_string();
    let res = db_call(db, move |d| -> Result<(), TimeLayerError> {
        if let Some(id) = d.summary_id("fact", &summary_key)? {
            d.delete_embedding(id)?;
            d.mark_summary_source(id, &reason)?;
        }
        Ok(())
    })
    .await;
    if let Ok(Err(e)) | Err(e) = res {
        warn!(fact_key, error = %e, "fact mirror removal failed");
    }
}
