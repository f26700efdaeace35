//! Fact lifecycle: propose / retract / resolve transitions, slot conflicts,
//! history versioning. Remote embedding calls are best-effort and simply
//! fail fast in these offline tests.

use tempfile::TempDir;
use timelayer::config::Config;
use timelayer::facts::{self, OutcomeStatus};
use timelayer::AppState;

fn state() -> (AppState, TempDir) {
    let tmp = TempDir::new().unwrap();
    let mut cfg = Config::from_env();
    // unroutable fast-fail endpoints so post-commit embedding never hangs
    cfg.embed_url = "http://127.0.0.1:1/embedding".into();
    cfg.chat_url = "http://127.0.0.1:1/v1/chat/completions".into();
    cfg.rerank_url = "http://127.0.0.1:1/v1/rerank_text".into();
    let st = AppState::for_tests(cfg, tmp.path()).unwrap();
    (st, tmp)
}

#[tokio::test]
async fn remember_then_forget_round_trip() {
    let (st, _tmp) = state();
    let fact = "我最喜欢的颜色是黄色";

    let out = facts::propose_remember(&st.db, &st.ai, &st.cfg, fact, "remember", "2026-01-05")
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::Remembered);
    let key = out.fact_key.clone();
    assert_eq!(key, "subject:我最喜欢的颜色");

    let active = st.db.list_active_facts(0).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].fact, fact);

    facts::retract(&st.db, fact, "forget", "2026-01-05").await.unwrap();
    assert!(st.db.list_active_facts(0).unwrap().is_empty());

    // exactly two history rows: active v1, forgotten v2
    let mut history = st.db.list_fact_history(0).unwrap();
    history.retain(|h| h.fact_key == key);
    assert_eq!(history.len(), 2);
    let mut by_version = history.clone();
    by_version.sort_by_key(|h| h.version);
    assert_eq!(by_version[0].status, "active");
    assert_eq!(by_version[0].version, 1);
    assert_eq!(by_version[1].status, "forgotten");
    assert_eq!(by_version[1].version, 2);
}

#[tokio::test]
async fn same_text_is_noop() {
    let (st, _tmp) = state();
    let fact = "我是程序员";
    facts::propose_remember(&st.db, &st.ai, &st.cfg, fact, "", "").await.unwrap();
    let out = facts::propose_remember(&st.db, &st.ai, &st.cfg, fact, "", "").await.unwrap();
    assert_eq!(out.status, OutcomeStatus::Noop);
    assert_eq!(st.db.list_active_facts(0).unwrap().len(), 1);
}

#[tokio::test]
async fn exact_key_conflict_keeps_current_truth() {
    let (st, _tmp) = state();
    facts::propose_remember(&st.db, &st.ai, &st.cfg, "我最喜欢的颜色是黄色", "", "")
        .await
        .unwrap();

    let out = facts::propose_remember(&st.db, &st.ai, &st.cfg, "我最喜欢的颜色是蓝色", "", "")
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::Conflict);
    assert!(out.conflict_id.is_some());
    assert_eq!(out.existing.as_deref(), Some("我最喜欢的颜色是黄色"));

    let active = st.db.list_active_facts(0).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].fact, "我最喜欢的颜色是黄色");
    assert_eq!(st.db.count_fact_conflicts(), 1);
}

#[tokio::test]
async fn slot_conflict_across_different_fact_keys() {
    let (st, _tmp) = state();
    let seeded = facts::propose_remember(&st.db, &st.ai, &st.cfg, "娜娜的真名是刘娜", "", "")
        .await
        .unwrap();
    assert_eq!(seeded.status, OutcomeStatus::Remembered);

    // Different derived fact_key, same (subject, name) slot.
    let out = facts::propose_remember(&st.db, &st.ai, &st.cfg, "娜娜真名是王娜", "", "")
        .await
        .unwrap();
    assert_eq!(out.status, OutcomeStatus::Conflict);
    // the conflict is keyed to the existing fact's key
    assert_eq!(out.fact_key, seeded.fact_key);

    let active = st.db.list_active_facts(0).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].fact, "娜娜的真名是刘娜");

    let conflicts = st.db.list_fact_conflicts(0).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].proposed_fact, "娜娜真名是王娜");

    let history = st.db.list_fact_history(0).unwrap();
    assert!(history
        .iter()
        .any(|h| h.status == "conflict" && h.fact_key == seeded.fact_key));
}

#[tokio::test]
async fn conflict_rows_dedupe_on_reproposal() {
    let (st, _tmp) = state();
    facts::propose_remember(&st.db, &st.ai, &st.cfg, "我的邮箱是a@b.c", "", "").await.unwrap();

    let first = facts::propose_remember(&st.db, &st.ai, &st.cfg, "我的邮箱是x@y.z", "", "")
        .await
        .unwrap();
    let second = facts::propose_remember(&st.db, &st.ai, &st.cfg, "我的邮箱是x@y.z", "", "")
        .await
        .unwrap();
    assert_eq!(first.conflict_id, second.conflict_id);
    assert_eq!(st.db.count_fact_conflicts(), 1);
}

#[tokio::test]
async fn resolve_keep_rejects_proposal() {
    let (st, _tmp) = state();
    facts::propose_remember(&st.db, &st.ai, &st.cfg, "我的地址是上海", "", "").await.unwrap();
    let out = facts::propose_remember(&st.db, &st.ai, &st.cfg, "我的地址是北京", "", "")
        .await
        .unwrap();
    let cid = out.conflict_id.unwrap();

    facts::resolve_conflict_keep(&st.db, cid).await.unwrap();

    let active = st.db.list_active_facts(0).unwrap();
    assert_eq!(active[0].fact, "我的地址是上海");
    assert_eq!(st.db.count_fact_conflicts(), 0);
    let history = st.db.list_fact_history(0).unwrap();
    assert!(history.iter().any(|h| h.status == "rejected" && h.fact == "我的地址是北京"));
}

#[tokio::test]
async fn resolve_replace_archives_and_activates() {
    let (st, _tmp) = state();
    let seeded = facts::propose_remember(&st.db, &st.ai, &st.cfg, "我的地址是上海", "", "")
        .await
        .unwrap();
    let out = facts::propose_remember(&st.db, &st.ai, &st.cfg, "我的地址是北京", "", "")
        .await
        .unwrap();
    let cid = out.conflict_id.unwrap();

    facts::resolve_conflict_replace(&st.db, &st.ai, &st.cfg, cid, None).await.unwrap();

    let active = st.db.list_active_facts(0).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].fact, "我的地址是北京");

    let mut history = st.db.list_fact_history(0).unwrap();
    history.retain(|h| h.fact_key == seeded.fact_key);
    history.sort_by_key(|h| h.version);
    let statuses: Vec<&str> = history.iter().map(|h| h.status.as_str()).collect();
    assert_eq!(statuses, vec!["active", "conflict", "archived", "active"]);
    // strictly increasing versions
    for w in history.windows(2) {
        assert!(w[1].version > w[0].version);
    }

    // explicit replacement text wins over the proposed fact
    let out = facts::propose_remember(&st.db, &st.ai, &st.cfg, "我的地址是广州", "", "")
        .await
        .unwrap();
    facts::resolve_conflict_replace(
        &st.db,
        &st.ai,
        &st.cfg,
        out.conflict_id.unwrap(),
        Some("我的地址是深圳".into()),
    )
    .await
    .unwrap();
    let active = st.db.list_active_facts(0).unwrap();
    assert_eq!(active[0].fact, "我的地址是深圳");
}

#[tokio::test]
async fn pending_accept_creates_truth_and_mirror() {
    let (st, _tmp) = state();
    timelayer::pending::add_pending_manual(&st.db, "我最喜欢的颜色是黄色", 0.9)
        .await
        .unwrap();
    let items = st.db.list_pending_facts(0).unwrap();
    assert_eq!(items.len(), 1);
    let id = items[0].id;

    let out = facts::remember_pending(&st.db, &st.ai, &st.cfg, id).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::Remembered);

    // pending row flipped, one active truth, mirror summary row present
    assert_eq!(st.db.count_pending_facts(), 0);
    let active = st.db.list_active_facts(0).unwrap();
    assert_eq!(active.len(), 1);
    let mirror = st
        .db
        .summary_id("fact", &format!("fact:{}", out.fact_key))
        .unwrap();
    assert!(mirror.is_some());

    let history = st.db.list_fact_history(0).unwrap();
    assert!(history.iter().any(|h| h.status == "active" && h.version == 1));
}

#[tokio::test]
async fn pending_accept_routes_conflicts() {
    let (st, _tmp) = state();
    facts::propose_remember(&st.db, &st.ai, &st.cfg, "娜娜的真名是刘娜", "", "")
        .await
        .unwrap();

    // different derived fact_key (passes the active-key filter on add) but
    // the same (subject, name) slot -> conflict on promotion
    timelayer::pending::add_pending_manual(&st.db, "娜娜真名是王娜", 0.9)
        .await
        .unwrap();
    let items = st.db.list_pending_facts(0).unwrap();
    assert_eq!(items.len(), 1);

    let out = facts::remember_pending(&st.db, &st.ai, &st.cfg, items[0].id).await.unwrap();
    assert_eq!(out.status, OutcomeStatus::Conflict);
    // pending row carries the conflict status now
    assert_eq!(st.db.count_pending_facts(), 0);
    assert_eq!(st.db.count_fact_conflicts(), 1);
    // the active truth did not flip
    let active = st.db.list_active_facts(0).unwrap();
    assert_eq!(active[0].fact, "娜娜的真名是刘娜");
}

#[tokio::test]
async fn reject_pending_leaves_audit_trail() {
    let (st, _tmp) = state();
    timelayer::pending::add_pending_manual(&st.db, "我养了一只叫咪咪的猫", 0.9)
        .await
        .unwrap();
    let id = st.db.list_pending_facts(0).unwrap()[0].id;

    facts::reject_pending(&st.db, id).await.unwrap();
    assert_eq!(st.db.count_pending_facts(), 0);

    let history = st.db.list_fact_history(0).unwrap();
    assert!(history
        .iter()
        .any(|h| h.status == "rejected" && h.source_type == "pending_reject"));

    // rejecting twice is NotFound
    let err = facts::reject_pending(&st.db, id).await.unwrap_err();
    assert!(matches!(err, timelayer::error::TimeLayerError::NotFound));
}

#[tokio::test]
async fn retract_missing_fact_is_noop() {
    let (st, _tmp) = state();
    facts::retract(&st.db, "我从未说过的事是真的", "", "").await.unwrap();
    assert!(st.db.list_fact_history(0).unwrap().is_empty());
}
