//! Pipeline behavior that does not require a live model: idempotent
//! early-return with pending re-ingestion, force cleanup, missing sources,
//! drift guard wiring, and reindex skip accounting.

use tempfile::TempDir;
use timelayer::ai::l2_norm;
use timelayer::config::Config;
use timelayer::summary::{self, guard};
use timelayer::AppState;

fn state() -> (AppState, TempDir) {
    let tmp = TempDir::new().unwrap();
    let mut cfg = Config::from_env();
    cfg.chat_url = "http://127.0.0.1:1/v1/chat/completions".into();
    cfg.embed_url = "http://127.0.0.1:1/embedding".into();
    let st = AppState::for_tests(cfg, tmp.path()).unwrap();
    (st, tmp)
}

#[tokio::test]
async fn missing_raw_log_is_a_noop() {
    let (st, _tmp) = state();
    summary::ensure_daily(&st.db, &st.ai, &st.cfg, "2026-01-05", false).await.unwrap();
    assert!(!st.db.summary_exists("daily", "2026-01-05").unwrap());
}

#[tokio::test]
async fn existing_daily_short_circuits_but_reingests_pending() {
    let (st, _tmp) = state();
    let date = "2026-01-05";

    // a prior run left both the row and the on-disk JSON
    st.db
        .upsert_summary("daily", date, date, date, "{}", "t", "p")
        .unwrap();
    let daily_json = serde_json::json!({
        "type": "daily",
        "user_facts_explicit": ["我最喜欢的颜色是黄色"]
    })
    .to_string();
    std::fs::write(st.cfg.log_dir.join(format!("{date}.daily.json")), &daily_json).unwrap();

    // also a raw log; if the early return were broken this would hit the
    // unreachable LLM endpoint and fail
    std::fs::write(
        st.cfg.log_dir.join(format!("{date}.jsonl")),
        "{\"role\":\"user\",\"content\":\"hi\"}\n",
    )
    .unwrap();

    summary::ensure_daily(&st.db, &st.ai, &st.cfg, date, false).await.unwrap();

    // idempotent: still one summary row, and the pending pool was fed
    let items = st.db.list_pending_facts(0).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].fact, "我最喜欢的颜色是黄色");

    // second run: no new rows, same single pending entry
    summary::ensure_daily(&st.db, &st.ai, &st.cfg, date, false).await.unwrap();
    assert_eq!(st.db.list_pending_facts(0).unwrap().len(), 1);
}

#[tokio::test]
async fn force_deletes_row_embedding_and_file() {
    let (st, _tmp) = state();
    let date = "2026-01-05";
    let id = st
        .db
        .upsert_summary("daily", date, date, date, "{}", "t", "p")
        .unwrap();
    let v = [1.0_f32, 0.0];
    st.db.upsert_embedding(id, &v, l2_norm(&v)).unwrap();
    let file = st.cfg.log_dir.join(format!("{date}.daily.json"));
    std::fs::write(&file, "{}").unwrap();

    // no raw log -> after force cleanup the run stops; everything is gone
    summary::ensure_daily(&st.db, &st.ai, &st.cfg, date, true).await.unwrap();
    assert!(!st.db.summary_exists("daily", date).unwrap());
    assert!(st.db.embedding_scan_rows().unwrap().is_empty());
    assert!(!file.exists());
}

#[tokio::test]
async fn weekly_without_dailies_is_a_noop() {
    let (st, _tmp) = state();
    summary::ensure_weekly(&st.db, &st.ai, &st.cfg, "2026-W02", false).await.unwrap();
    assert!(!st.db.summary_exists("weekly", "2026-W02").unwrap());
}

#[tokio::test]
async fn monthly_without_weeklies_is_a_noop() {
    let (st, _tmp) = state();
    summary::ensure_monthly(&st.db, &st.ai, &st.cfg, "2026-01", false).await.unwrap();
    assert!(!st.db.summary_exists("monthly", "2026-01").unwrap());
}

#[tokio::test]
async fn bad_period_keys_are_rejected() {
    let (st, _tmp) = state();
    assert!(summary::ensure_weekly(&st.db, &st.ai, &st.cfg, "not-a-week", false)
        .await
        .is_err());
    assert!(summary::ensure_monthly(&st.db, &st.ai, &st.cfg, "2026/01", false)
        .await
        .is_err());
}

#[test]
fn drift_guard_levels() {
    let db = timelayer::db::MemoryDB::open_default(":memory:").unwrap();
    let id = db
        .upsert_summary("weekly", "2026-W02", "2026-01-05", "2026-01-11", "{}", "t", "p")
        .unwrap();

    // no history yet: nothing to drift from
    assert!(guard::check_embedding_drift(&db, id, &[1.0, 0.0]).is_none());

    db.append_embedding_history(id, &[1.0, 0.0]).unwrap();

    // identical vector: clean
    assert!(guard::check_embedding_drift(&db, id, &[1.0, 0.0]).is_none());

    // small rotation: warn band (distance ~0.2 between these two)
    let warned = guard::check_embedding_drift(&db, id, &[0.8, 0.6]).unwrap();
    assert_eq!(warned.level, guard::DriftLevel::Warn);

    // orthogonal: distance 1.0 -> block
    let blocked = guard::check_embedding_drift(&db, id, &[0.0, 1.0]).unwrap();
    assert_eq!(blocked.level, guard::DriftLevel::Block);
}

#[tokio::test]
async fn reindex_skips_existing_embeddings() {
    let (st, _tmp) = state();
    let id = st
        .db
        .upsert_summary("daily", "2026-01-05", "2026-01-05", "2026-01-05", "{}", "t", "p")
        .unwrap();
    let v = [1.0_f32, 0.0];
    st.db.upsert_embedding(id, &v, l2_norm(&v)).unwrap();
    // a second summary without an embedding; the embed service is down so it
    // counts as failed, not created
    st.db
        .upsert_summary("daily", "2026-01-06", "2026-01-06", "2026-01-06",
            r#"{"highlights":["something"]}"#, "something", "p")
        .unwrap();

    let report = summary::reindex(&st.db, &st.ai, &st.cfg, "daily").await.unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.created, 0);

    assert!(summary::reindex(&st.db, &st.ai, &st.cfg, "bogus").await.is_err());
}
