//! Candidate ingestion from daily summary JSON: normalization, confidence
//! floor, explicit-over-implicit preference, and keyed upsert semantics.

use tempfile::TempDir;
use timelayer::config::Config;
use timelayer::pending;
use timelayer::AppState;

fn state() -> (AppState, TempDir) {
    let tmp = TempDir::new().unwrap();
    let mut cfg = Config::from_env();
    cfg.embed_url = "http://127.0.0.1:1/embedding".into();
    let st = AppState::for_tests(cfg, tmp.path()).unwrap();
    (st, tmp)
}

#[tokio::test]
async fn wrapper_variants_collapse_to_one_row() {
    let (st, _tmp) = state();
    let daily = serde_json::json!({
        "type": "daily",
        "user_facts_explicit": [
            "我最喜欢的颜色是黄色",
            "记住：我最喜欢的颜色是黄色。"
        ]
    })
    .to_string();

    pending::ingest_from_daily_json(&st.db, "2026-01-05", &daily).await.unwrap();

    let items = st.db.list_pending_facts(0).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].fact, "我最喜欢的颜色是黄色");
    assert_eq!(items[0].fact_key, "subject:我最喜欢的颜色");
    assert!((items[0].confidence - pending::DEFAULT_CONFIDENCE).abs() < 1e-9);
    assert_eq!(items[0].source_type, "daily");
    assert_eq!(items[0].source_key, "2026-01-05");
}

#[tokio::test]
async fn explicit_wins_over_implicit_duplicate() {
    let (st, _tmp) = state();
    let daily = serde_json::json!({
        "user_facts_explicit": ["我的生日是5月1日"],
        "user_facts_implicit": ["我的生日是5月1日", "我养了一只猫叫咪咪"]
    })
    .to_string();

    pending::ingest_from_daily_json(&st.db, "2026-01-05", &daily).await.unwrap();

    let items = st.db.list_pending_facts(0).unwrap();
    assert_eq!(items.len(), 2);
    let birthday = items.iter().find(|p| p.fact.contains("生日")).unwrap();
    assert_eq!(birthday.source_type, "daily");
    let cat = items.iter().find(|p| p.fact.contains("咪咪")).unwrap();
    assert_eq!(cat.source_type, "daily_implicit");
    assert!((cat.confidence - 0.80).abs() < 1e-9);
}

#[tokio::test]
async fn low_confidence_candidates_are_dropped() {
    let (st, _tmp) = state();
    let daily = serde_json::json!({
        "user_facts_explicit": [
            {"fact": "我的ID是tl007", "confidence": 0.5},
            {"fact": "我的邮箱是a@b.c", "confidence": 0.9}
        ]
    })
    .to_string();

    pending::ingest_from_daily_json(&st.db, "2026-01-05", &daily).await.unwrap();

    let items = st.db.list_pending_facts(0).unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0].fact.contains("邮箱"));
}

#[tokio::test]
async fn active_facts_never_reenter_pending() {
    let (st, _tmp) = state();
    timelayer::facts::propose_remember(
        &st.db, &st.ai, &st.cfg, "我最喜欢的颜色是黄色", "", "",
    )
    .await
    .unwrap();

    let daily = serde_json::json!({
        "user_facts_explicit": ["我最喜欢的颜色是黄色"]
    })
    .to_string();
    pending::ingest_from_daily_json(&st.db, "2026-01-05", &daily).await.unwrap();
    assert_eq!(st.db.count_pending_facts(), 0);
}

#[tokio::test]
async fn reingest_bumps_confidence_to_max() {
    let (st, _tmp) = state();
    let low = serde_json::json!({
        "user_facts_explicit": [{"fact": "我的邮箱是a@b.c", "confidence": 0.8}]
    })
    .to_string();
    let high = serde_json::json!({
        "user_facts_explicit": [{"fact": "我的邮箱是a@b.c", "confidence": 0.95}]
    })
    .to_string();

    pending::ingest_from_daily_json(&st.db, "2026-01-05", &low).await.unwrap();
    pending::ingest_from_daily_json(&st.db, "2026-01-05", &high).await.unwrap();
    // lower confidence later never downgrades
    pending::ingest_from_daily_json(&st.db, "2026-01-05", &low).await.unwrap();

    let items = st.db.list_pending_facts(0).unwrap();
    assert_eq!(items.len(), 1);
    assert!((items[0].confidence - 0.95).abs() < 1e-9);
}

#[tokio::test]
async fn malformed_daily_json_is_ignored() {
    let (st, _tmp) = state();
    pending::ingest_from_daily_json(&st.db, "2026-01-05", "{not json").await.unwrap();
    pending::ingest_from_daily_json(&st.db, "2026-01-05", "").await.unwrap();
    assert_eq!(st.db.count_pending_facts(), 0);
}

#[tokio::test]
async fn groups_merge_same_fact_key_without_embeddings() {
    let (st, _tmp) = state();
    // embedding service is unreachable; grouping falls back to fact_key
    // merges plus singletons
    pending::add_pending_manual(&st.db, "我最喜欢的颜色是黄色", 0.9).await.unwrap();
    pending::add_pending_manual(&st.db, "我的生日是5月1日", 0.85).await.unwrap();

    // same fact_key, different source rows
    let daily = serde_json::json!({
        "user_facts_explicit": ["我最喜欢的颜色是黄色"]
    })
    .to_string();
    pending::ingest_from_daily_json(&st.db, "2026-01-06", &daily).await.unwrap();
    assert_eq!(st.db.count_pending_facts(), 3);

    let groups = pending::list_pending_groups(&st.db, &st.ai, &st.cfg, 60).await.unwrap();
    assert_eq!(groups.len(), 2);
    // the color group merged on fact_key and sorts first by size
    assert_eq!(groups[0].size, 2);
    assert!(groups[0].rep.fact.contains("颜色"));
    assert_eq!(groups[1].size, 1);
}
