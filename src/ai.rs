//! Remote service adapters: streaming/non-streaming chat completions,
//! embeddings (all known llama-server wire shapes), and cross-encoder rerank.
//! Embedding and rerank failures are non-fatal for callers; chat failures
//! surface as `Upstream` errors.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::TimeLayerError;

fn upstream(msg: impl Into<String>) -> TimeLayerError {
    TimeLayerError::Upstream(msg.into())
}

/// One HTTP client per upstream concern. The streaming chat client carries no
/// total timeout (a healthy stream can legitimately run for minutes); the
/// others are bounded.
#[derive(Clone)]
pub struct AiClient {
    chat_stream: reqwest::Client,
    llm: reqwest::Client,
    embed: reqwest::Client,
    rerank: reqwest::Client,
}

impl AiClient {
    pub fn new(cfg: &Config) -> Self {
        let build = |timeout: Option<Duration>| {
            let mut b = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
            if let Some(t) = timeout {
                b = b.timeout(t);
            }
            b.build().expect("failed to build HTTP client")
        };
        Self {
            chat_stream: build(None),
            llm: build(Some(cfg.http_timeout)),
            embed: build(Some(Duration::from_secs(120))),
            rerank: build(Some(cfg.rerank_timeout)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

// ---------------------------------------------------------------------------
// Non-streaming chat (summaries)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_thinking: Option<bool>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// One-shot completion used by the summary pipeline.
pub async fn llm_chat(ai: &AiClient, cfg: &Config, prompt: &str) -> Result<String, TimeLayerError> {
    let messages = [ChatMessage::new("user", prompt)];
    let req = ChatRequest {
        model: &cfg.chat_model,
        messages: &messages,
        stream: false,
        enable_thinking: None,
    };

    let resp = ai
        .llm
        .post(&cfg.chat_url)
        .json(&req)
        .send()
        .await
        .map_err(|e| upstream(format!("LLM request failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(upstream(format!("LLM returned {status}: {}", body.trim())));
    }

    let chat: ChatResponse = resp
        .json()
        .await
        .map_err(|e| upstream(format!("LLM response parse failed: {e}")))?;
    let choice = chat
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| upstream("LLM response has no choices"))?;

    if let Some(c) = choice.message.and_then(|m| m.content) {
        let c = c.trim().to_string();
        if !c.is_empty() {
            return Ok(c);
        }
    }
    if let Some(t) = choice.text {
        let t = t.trim().to_string();
        if !t.is_empty() {
            return Ok(t);
        }
    }
    Err(upstream("empty content in choices"))
}

// ---------------------------------------------------------------------------
// Streaming chat (one conversational turn)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SseChunk {
    #[serde(default)]
    choices: Vec<SseChoice>,
}

#[derive(Deserialize)]
struct SseChoice {
    #[serde(default)]
    delta: SseDelta,
}

#[derive(Deserialize, Default)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Stream one chat turn. `on_delta` is invoked for every content fragment;
/// the accumulated text is returned when the upstream sends `[DONE]` or the
/// stream ends. Cancelling `cancel` drops the upstream connection and
/// returns `Cancelled` with whatever was accumulated discarded by callers.
pub async fn stream_chat(
    ai: &AiClient,
    cfg: &Config,
    system_prompt: &str,
    context_messages: &[ChatMessage],
    user_question: &str,
    enable_thinking: bool,
    cancel: &CancellationToken,
    mut on_delta: impl FnMut(&str),
) -> Result<String, TimeLayerError> {
    if cancel.is_cancelled() {
        return Err(TimeLayerError::Cancelled);
    }
    let mut messages = Vec::with_capacity(context_messages.len() + 2);
    if !system_prompt.is_empty() {
        messages.push(ChatMessage::new("system", system_prompt));
    }
    for m in context_messages {
        if !m.role.is_empty() && !m.content.is_empty() {
            messages.push(m.clone());
        }
    }
    messages.push(ChatMessage::new("user", user_question));

    let req = ChatRequest {
        model: &cfg.chat_model,
        messages: &messages,
        stream: true,
        // The llama.cpp server may ignore this at runtime; kept for upstream
        // servers that do consume it.
        enable_thinking: Some(enable_thinking),
    };

    let resp = tokio::select! {
        _ = cancel.cancelled() => return Err(TimeLayerError::Cancelled),
        r = ai.chat_stream.post(&cfg.chat_url).json(&req).send() => {
            r.map_err(|e| upstream(format!("chat request failed: {e}")))?
        }
    };
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(upstream(format!("chat returned {status}: {}", body.trim())));
    }

    let mut stream = resp.bytes_stream();
    let mut buffer = String::new();
    let mut full = String::new();

    'outer: loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(TimeLayerError::Cancelled),
            c = stream.next() => c,
        };
        let Some(chunk) = chunk else { break };
        let bytes = chunk.map_err(|e| upstream(format!("stream read error: {e}")))?;
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim_end_matches('\r').to_string();
            buffer.drain(..=line_end);

            let Some(data) = line.strip_prefix("data: ") else { continue };
            if data == "[DONE]" {
                break 'outer;
            }
            let Ok(chunk) = serde_json::from_str::<SseChunk>(data) else { continue };
            let Some(delta) = chunk
                .choices
                .first()
                .and_then(|c| c.delta.content.as_deref())
            else {
                continue;
            };
            if delta.is_empty() {
                continue;
            }
            full.push_str(delta);
            on_delta(delta);
        }
    }

    Ok(full)
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbedRequest<'a> {
    input: &'a str,
}

/// The four known embedding wire shapes, tried in declaration order.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbedWire {
    Object { embedding: Vec<f32> },
    Flat(Vec<f32>),
    Matrix(Vec<Vec<f32>>),
    Batched(Vec<EmbedBatchItem>),
}

#[derive(Deserialize)]
struct EmbedBatchItem {
    #[allow(dead_code)]
    #[serde(default)]
    index: i64,
    embedding: Vec<Vec<f32>>,
}

pub fn decode_embedding(raw: &[u8]) -> Result<Vec<f32>, TimeLayerError> {
    let wire: EmbedWire = serde_json::from_slice(raw).map_err(|_| {
        let msg = String::from_utf8_lossy(raw);
        upstream(format!(
            "unknown embedding response format: {}",
            crate::util::truncate_chars(msg.trim(), 500)
        ))
    })?;

    let vec = match wire {
        EmbedWire::Object { embedding } => embedding,
        EmbedWire::Flat(v) => v,
        EmbedWire::Matrix(mut m) => {
            if m.is_empty() {
                return Err(upstream("embedding matrix is empty"));
            }
            m.swap_remove(0)
        }
        EmbedWire::Batched(mut b) => {
            if b.is_empty() || b[0].embedding.is_empty() {
                return Err(upstream("embedding batch is empty"));
            }
            b[0].embedding.swap_remove(0)
        }
    };
    if vec.is_empty() {
        return Err(upstream("embedding vector is empty"));
    }
    Ok(vec)
}

/// Embed a single text. Returns the vector and its L2 norm.
pub async fn embed_text(
    ai: &AiClient,
    cfg: &Config,
    text: &str,
) -> Result<(Vec<f32>, f64), TimeLayerError> {
    let resp = ai
        .embed
        .post(&cfg.embed_url)
        .json(&EmbedRequest { input: text })
        .send()
        .await
        .map_err(|e| upstream(format!("embedding request failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(upstream(format!("embedding returned {status}: {}", body.trim())));
    }
    let raw = resp
        .bytes()
        .await
        .map_err(|e| upstream(format!("embedding read failed: {e}")))?;
    let vec = decode_embedding(&raw)?;
    let l2 = l2_norm(&vec);
    Ok((vec, l2))
}

// ---------------------------------------------------------------------------
// Rerank
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    scores: Vec<f64>,
}

/// Score `docs` against `query` with the cross-encoder. The response is
/// rejected unless the score list is length-matched to the documents.
pub async fn rerank_texts(
    ai: &AiClient,
    cfg: &Config,
    query: &str,
    docs: &[String],
) -> Result<Vec<f64>, TimeLayerError> {
    let resp = ai
        .rerank
        .post(&cfg.rerank_url)
        .json(&RerankRequest { query, documents: docs })
        .send()
        .await
        .map_err(|e| upstream(format!("rerank request failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(upstream(format!(
            "rerank returned {status}: {}",
            crate::util::truncate_chars(body.trim(), 500)
        )));
    }

    let out: RerankResponse = resp
        .json()
        .await
        .map_err(|e| upstream(format!("rerank response parse failed: {e}")))?;
    if out.scores.len() != docs.len() {
        return Err(upstream(format!(
            "rerank length mismatch: scores={} docs={}",
            out.scores.len(),
            docs.len()
        )));
    }
    Ok(out.scores)
}

// ---------------------------------------------------------------------------
// Vector utilities
// ---------------------------------------------------------------------------

pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

/// Serialize an f32 vector to little-endian bytes for SQLite BLOB storage.
pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize little-endian bytes back to an f32 vector.
pub fn bytes_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("4 bytes")))
        .collect()
}

/// Dot product of a query vector against a stored blob; `None` when the blob
/// is shorter than `dim` floats.
pub fn dot_with_blob(q: &[f32], blob: &[u8], dim: usize) -> Option<f64> {
    if blob.len() < dim * 4 || q.len() < dim {
        return None;
    }
    let mut sum = 0.0_f64;
    for (i, chunk) in blob.chunks_exact(4).take(dim).enumerate() {
        let x = f32::from_le_bytes(chunk.try_into().ok()?);
        sum += (q[i] as f64) * (x as f64);
    }
    Some(sum)
}

/// Cosine distance (1 - similarity) between two vectors; 1 on mismatch.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let (mut dot, mut na, mut nb) = (0.0_f64, 0.0_f64, 0.0_f64);
    for i in 0..a.len() {
        let (x, y) = (a[i] as f64, b[i] as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_object_shape() {
        let v = decode_embedding(br#"{"embedding":[0.1,0.2]}"#).unwrap();
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn decode_flat_shape() {
        let v = decode_embedding(br#"[0.5,0.5,0.5]"#).unwrap();
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn decode_matrix_shape() {
        let v = decode_embedding(br#"[[1.0,2.0],[3.0,4.0]]"#).unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
    }

    #[test]
    fn decode_batched_shape() {
        let v = decode_embedding(br#"[{"index":0,"embedding":[[7.0,8.0]]}]"#).unwrap();
        assert_eq!(v, vec![7.0, 8.0]);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_embedding(br#"{"error":"oom"}"#).is_err());
    }

    #[test]
    fn bytes_round_trip() {
        let v = vec![0.25_f32, -1.5, 3.0];
        let b = embedding_to_bytes(&v);
        assert_eq!(b.len(), 12);
        assert_eq!(bytes_to_embedding(&b), v);
    }

    #[test]
    fn dot_matches_manual() {
        let q = vec![1.0_f32, 2.0, 3.0];
        let blob = embedding_to_bytes(&[4.0, 5.0, 6.0]);
        let dot = dot_with_blob(&q, &blob, 3).unwrap();
        assert!((dot - 32.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_distance_identical_is_zero() {
        let a = vec![0.6_f32, 0.8];
        assert!(cosine_distance(&a, &a) < 1e-9);
        assert_eq!(cosine_distance(&a, &[0.6]), 1.0);
    }
}
