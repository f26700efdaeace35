//! Orchestration flows that do not need a live model: explicit facts
//! intents, cancellation semantics, and bind safety.

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use timelayer::api;
use timelayer::chat;
use timelayer::config::Config;
use timelayer::error::TimeLayerError;
use timelayer::AppState;

fn state() -> (AppState, TempDir) {
    let tmp = TempDir::new().unwrap();
    let mut cfg = Config::from_env();
    cfg.chat_url = "http://127.0.0.1:1/v1/chat/completions".into();
    cfg.embed_url = "http://127.0.0.1:1/embedding".into();
    cfg.rerank_url = "http://127.0.0.1:1/v1/rerank_text".into();
    let st = AppState::for_tests(cfg, tmp.path()).unwrap();
    (st, tmp)
}

fn today_log(st: &AppState) -> String {
    let date = timelayer::db::today_str();
    std::fs::read_to_string(st.cfg.log_dir.join(format!("{date}.jsonl"))).unwrap_or_default()
}

#[tokio::test]
async fn forget_intent_short_circuits_with_minimal_reply() {
    let (st, _tmp) = state();
    timelayer::facts::propose_remember(&st.db, &st.ai, &st.cfg, "我最喜欢的颜色是黄色", "", "")
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let turn = chat::chat_once(&st, "忘记：我最喜欢的颜色是黄色", &cancel, |_| {})
        .await
        .unwrap();
    assert_eq!(turn.text, "好的。");
    assert!(turn.facts_notice);
    assert!(st.db.list_active_facts(0).unwrap().is_empty());

    // the original instruction is logged as an op line; the reply as normal
    let log = today_log(&st);
    assert!(log.contains(r#""kind":"op""#));
    assert!(log.contains("好的。"));
}

#[tokio::test]
async fn remember_intent_proposes_pending_and_rewrites_input() {
    let (st, _tmp) = state();
    let cancel = CancellationToken::new();

    // the LLM call at the end fails (unreachable endpoint); the pending
    // proposal must already have happened by then
    let err = chat::chat_once(&st, "记住：我最喜欢的颜色是黄色", &cancel, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, TimeLayerError::Upstream(_)));

    let items = st.db.list_pending_facts(0).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].fact, "我最喜欢的颜色是黄色");
    assert_eq!(items[0].source_type, "remember_auto");

    // the cleaned meaning is logged as a normal user line
    let log = today_log(&st);
    assert!(log.contains(r#""content":"我最喜欢的颜色是黄色","#) || log.contains(r#""content":"我最喜欢的颜色是黄色""#));
}

#[tokio::test]
async fn implicit_self_statement_lands_in_pending() {
    let (st, _tmp) = state();
    let cancel = CancellationToken::new();

    let _ = chat::chat_once(&st, "我最喜欢的颜色是黄色。", &cancel, |_| {}).await;

    let items = st.db.list_pending_facts(0).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].source_type, "realtime_implicit");
    // trailing punctuation stripped before proposing
    assert_eq!(items[0].fact, "我最喜欢的颜色是黄色");
}

#[tokio::test]
async fn cancelled_turn_persists_no_assistant_line() {
    let (st, _tmp) = state();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = chat::chat_once(&st, "随便聊聊今天的天气", &cancel, |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, TimeLayerError::Cancelled));

    // user line was logged before the stream, assistant line was not
    let log = today_log(&st);
    assert!(log.contains("随便聊聊今天的天气"));
    assert!(!log.contains(r#""role":"assistant""#));
}

#[tokio::test]
async fn empty_input_is_a_noop() {
    let (st, _tmp) = state();
    let cancel = CancellationToken::new();
    let turn = chat::chat_once(&st, "   ", &cancel, |_| {}).await.unwrap();
    assert!(turn.text.is_empty());
    assert!(today_log(&st).is_empty());
}

#[test]
fn refuses_public_bind_without_auth() {
    let mut cfg = Config::from_env();
    cfg.http_addr = "0.0.0.0:3210".into();
    cfg.http_auth_token = None;
    cfg.http_allow_insecure_remote = false;

    let err = api::check_bind_safety(&cfg).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("TIMELAYER_HTTP_AUTH_TOKEN"));
    assert!(msg.contains("TIMELAYER_HTTP_ALLOW_INSECURE_REMOTE"));

    // either escape hatch makes the bind acceptable
    cfg.http_auth_token = Some("secret".into());
    assert!(api::check_bind_safety(&cfg).is_ok());
    cfg.http_auth_token = None;
    cfg.http_allow_insecure_remote = true;
    assert!(api::check_bind_safety(&cfg).is_ok());

    // loopback never needs either
    cfg.http_allow_insecure_remote = false;
    cfg.http_addr = "127.0.0.1:3210".into();
    assert!(api::check_bind_safety(&cfg).is_ok());
}
