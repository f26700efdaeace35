//! Chat endpoints: one-shot chat, SSE streaming with cancellation and a
//! concurrency cap, and the context-injection audit.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::chat;
use crate::context;
use crate::error::TimeLayerError;
use crate::AppState;

#[derive(Deserialize)]
pub(super) struct ChatBody {
    #[serde(default)]
    input: String,
    /// Legacy alias used by older clients of the audit endpoint.
    #[serde(default)]
    question: String,
}

impl ChatBody {
    fn effective_input(&self) -> &str {
        let input = self.input.trim();
        if input.is_empty() { self.question.trim() } else { input }
    }
}

fn validate_input<'a>(state: &AppState, input: &'a str) -> Result<&'a str, TimeLayerError> {
    if input.is_empty() {
        return Err(TimeLayerError::Validation("input must not be empty".into()));
    }
    if state.cfg.http_max_input_bytes > 0 && input.len() > state.cfg.http_max_input_bytes {
        return Err(TimeLayerError::Validation("input too large".into()));
    }
    Ok(input)
}

pub(super) async fn health() -> &'static str {
    "ok"
}

pub(super) async fn api_chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Json<serde_json::Value>, TimeLayerError> {
    let input = validate_input(&state, body.input.trim())?.to_string();

    let cancel = CancellationToken::new();
    let turn = chat::chat_once(&state, &input, &cancel, |_| {}).await?;
    Ok(Json(serde_json::json!({ "text": turn.text })))
}

/// SSE frames: `{delta}` chunks, an optional `{notice:"facts"}` when the
/// turn changed the facts panel, then `{done:"1"}`, or `{error}`. Client
/// disconnect drops the response stream, which cancels the upstream chat
/// connection via the token's drop guard; a cancelled turn persists nothing.
pub(super) async fn api_chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, TimeLayerError> {
    let input = validate_input(&state, body.input.trim())?.to_string();

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let _ = tx.send(Event::default().comment("ok"));

    // Held by the response stream: cancelling guard + semaphore permit.
    // Dropping the response (client disconnect or completion) cancels the
    // upstream chat connection and frees the stream slot.
    let mut held = None;

    match state.stream_sem.clone().try_acquire_owned() {
        Err(_) => {
            let _ = tx.send(Event::default().data(r#"{"error":"too many concurrent streams"}"#));
            let _ = tx.send(Event::default().data(r#"{"done":"1"}"#));
        }
        Ok(permit) => {
            let cancel = CancellationToken::new();
            held = Some((cancel.clone().drop_guard(), permit));

            let task_state = state.clone();
            let task_tx = tx.clone();
            tokio::spawn(async move {
                let delta_tx = task_tx.clone();
                let result = chat::chat_once(&task_state, &input, &cancel, move |delta| {
                    let frame = serde_json::json!({ "delta": delta }).to_string();
                    let _ = delta_tx.send(Event::default().data(frame));
                })
                .await;

                match result {
                    Ok(turn) => {
                        if turn.facts_notice {
                            let _ = task_tx.send(Event::default().data(r#"{"notice":"facts"}"#));
                        }
                        let _ = task_tx.send(Event::default().data(r#"{"done":"1"}"#));
                    }
                    Err(TimeLayerError::Cancelled) => {
                        // clean close: the client is gone, nothing to send
                    }
                    Err(e) => {
                        warn!(error = %e, "chat stream failed");
                        let frame = serde_json::json!({ "error": e.to_string() }).to_string();
                        let _ = task_tx.send(Event::default().data(frame));
                    }
                }
            });
        }
    }
    drop(tx);

    let stream = UnboundedReceiverStream::new(rx).map(move |ev| {
        let _ = &held;
        Ok(ev)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub(super) async fn api_context_audit(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Json<context::ChatContextAudit>, TimeLayerError> {
    let q = validate_input(&state, body.effective_input())?.to_string();
    let date = crate::db::today_str();
    let audit = context::build_chat_context_audit(
        &state.db,
        &state.ai,
        &state.cfg,
        &state.embed_cache,
        &date,
        &q,
    )
    .await;
    Ok(Json(audit))
}
