//! Prompt assembly against real files and a seeded store: ordering,
//! operational-line purity, duplicate-fact filtering, and the audit view.

use tempfile::TempDir;
use timelayer::config::Config;
use timelayer::context;
use timelayer::summary::RawLine;
use timelayer::AppState;

fn state() -> (AppState, TempDir) {
    let tmp = TempDir::new().unwrap();
    let mut cfg = Config::from_env();
    cfg.embed_url = "http://127.0.0.1:1/embedding".into();
    cfg.rerank_url = "http://127.0.0.1:1/v1/rerank_text".into();
    let st = AppState::for_tests(cfg, tmp.path()).unwrap();
    (st, tmp)
}

fn write_raw_log(st: &AppState, date: &str, lines: &[RawLine]) {
    let mut out = String::new();
    for l in lines {
        out.push_str(&serde_json::to_string(l).unwrap());
        out.push('\n');
    }
    std::fs::write(st.cfg.log_dir.join(format!("{date}.jsonl")), out).unwrap();
}

#[tokio::test]
async fn facts_always_lead_and_blocks_sort_by_priority() {
    let (st, _tmp) = state();
    let date = "2026-01-05";

    timelayer::facts::propose_remember(&st.db, &st.ai, &st.cfg, "我最喜欢的颜色是黄色", "", "")
        .await
        .unwrap();
    std::fs::write(
        st.cfg.log_dir.join(format!("{date}.daily.json")),
        r#"{"type":"daily","topics":["颜色"]}"#,
    )
    .unwrap();
    write_raw_log(
        &st,
        date,
        &[RawLine { role: "user".into(), content: "早上好".into(), kind: None }],
    );

    // empty query keeps retrieval offline
    let blocks =
        context::build_chat_context(&st.db, &st.ai, &st.cfg, &st.embed_cache, date, "").await;

    let sources: Vec<&str> = blocks.iter().map(|b| b.source.as_str()).collect();
    assert_eq!(sources[0], context::SOURCE_REMEMBERED_FACT);
    // daily before recent raw; every block downgraded + wrapped
    let daily_pos = sources.iter().position(|s| *s == context::SOURCE_DAILY_SUMMARY).unwrap();
    let recent_pos = sources.iter().position(|s| *s == context::SOURCE_RECENT_RAW).unwrap();
    assert!(daily_pos < recent_pos);
    for b in &blocks {
        assert_eq!(b.role, "assistant");
        assert!(b.content.starts_with("【参考信息】"));
    }
    assert!(blocks[0].content.contains("我最喜欢的颜色是黄色"));
}

#[tokio::test]
async fn op_lines_never_reach_recent_raw() {
    let (st, _tmp) = state();
    let date = "2026-01-05";
    write_raw_log(
        &st,
        date,
        &[
            RawLine { role: "user".into(), content: "记住：我最喜欢的颜色是黄色".into(), kind: Some("op".into()) },
            RawLine { role: "user".into(), content: "我最喜欢的颜色是黄色".into(), kind: None },
            RawLine { role: "assistant".into(), content: "[ok] 已写入 FACTS".into(), kind: None },
            RawLine { role: "assistant".into(), content: "黄色很亮眼。".into(), kind: None },
        ],
    );

    let recent = context::load_recent_raw(&st.cfg, date, 20);
    assert!(!recent.contains("记住："));
    assert!(!recent.contains("FACTS"));
    assert!(recent.contains("用户：我最喜欢的颜色是黄色"));
    assert!(recent.contains("助手：黄色很亮眼。（仅供语境，不保证正确）"));
}

#[tokio::test]
async fn recent_raw_respects_line_budget() {
    let (st, _tmp) = state();
    let date = "2026-01-05";
    let lines: Vec<RawLine> = (0..30)
        .map(|i| RawLine { role: "user".into(), content: format!("第{i}条"), kind: None })
        .collect();
    write_raw_log(&st, date, &lines);

    let recent = context::load_recent_raw(&st.cfg, date, 5);
    assert_eq!(recent.lines().count(), 5);
    assert!(recent.contains("第29条"));
    assert!(!recent.contains("第24条"));
}

#[tokio::test]
async fn confirmed_facts_filtered_from_daily_block() {
    let (st, _tmp) = state();
    let date = "2026-01-05";

    timelayer::facts::propose_remember(&st.db, &st.ai, &st.cfg, "我最喜欢的颜色是黄色", "", "")
        .await
        .unwrap();
    let daily = serde_json::json!({
        "type": "daily",
        "user_facts_explicit": ["我最喜欢的颜色是黄色", "我住在上海"]
    })
    .to_string();
    std::fs::write(st.cfg.log_dir.join(format!("{date}.daily.json")), &daily).unwrap();

    let blocks =
        context::build_chat_context(&st.db, &st.ai, &st.cfg, &st.embed_cache, date, "").await;
    let daily_block = blocks
        .iter()
        .find(|b| b.source == context::SOURCE_DAILY_SUMMARY)
        .unwrap();
    assert!(!daily_block.content.contains("我最喜欢的颜色是黄色"));
    assert!(daily_block.content.contains("我住在上海"));
}

#[tokio::test]
async fn audit_reports_steps_and_policy() {
    let (st, _tmp) = state();
    let date = timelayer::db::today_str();

    timelayer::pending::add_pending_manual(&st.db, "我的生日是5月1日", 0.9).await.unwrap();
    let audit = context::build_chat_context_audit(
        &st.db,
        &st.ai,
        &st.cfg,
        &st.embed_cache,
        &date,
        "生日",
    )
    .await;

    assert_eq!(audit.pending_n, 1);
    assert_eq!(audit.conflicts_n, 0);
    assert!(!audit.daily_summary);
    assert!(audit.steps.iter().any(|s| s.starts_with("daily_summary: added=0")));
    let order = audit.policy.get("order").unwrap().as_array().unwrap();
    assert_eq!(order[0], context::SOURCE_REMEMBERED_FACT);
    assert!(audit.policy.contains_key("generated_at"));
    assert_eq!(audit.blocks.len(), audit.blocks_view.len());
}
