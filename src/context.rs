//! Prompt assembly: gathers evidence (remembered facts, today's summary,
//! retrieval hits, recent raw dialog), sanitizes it, and emits
//! authority-ordered blocks. Authority is conveyed by ordering; every block
//! is downgraded to assistant-visible reference material at emission.

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::ai::AiClient;
use crate::config::Config;
use crate::search::{self, QueryEmbedCache, SearchHit};
use crate::summary::RawLine;
use crate::{db_call, SharedDB};

pub const SOURCE_REMEMBERED_FACT: &str = "remembered_fact";
pub const SOURCE_DAILY_SUMMARY: &str = "daily_summary";
pub const SOURCE_SEARCH_HIT: &str = "search_hit";
pub const SOURCE_RECENT_RAW: &str = "recent_raw";

const PRIORITY_REMEMBERED: i32 = 1000;
const PRIORITY_DAILY: i32 = 600;
const PRIORITY_SEARCH: i32 = 400;
const PRIORITY_RECENT: i32 = 200;

/// Max characters of a single raw message injected as recent context.
const MAX_CHARS_PER_MSG: usize = 900;

#[derive(Debug, Clone, Serialize)]
pub struct PromptBlock {
    pub role: String,
    pub source: String,
    pub content: String,
}

struct Evidence {
    source: &'static str,
    content: String,
    priority: i32,
}

pub fn priority_of(source: &str) -> i32 {
    match source {
        SOURCE_REMEMBERED_FACT => PRIORITY_REMEMBERED,
        SOURCE_DAILY_SUMMARY => PRIORITY_DAILY,
        SOURCE_SEARCH_HIT => PRIORITY_SEARCH,
        SOURCE_RECENT_RAW => PRIORITY_RECENT,
        _ => 0,
    }
}

/// Assemble the prompt context for one turn. The current user input itself
/// is never injected here; `user_query` only drives retrieval.
pub async fn build_chat_context(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    cache: &QueryEmbedCache,
    date: &str,
    user_query: &str,
) -> Vec<PromptBlock> {
    let mut evidences: Vec<Evidence> = Vec::new();
    let mut remembered: std::collections::HashSet<String> = std::collections::HashSet::new();

    // Explicit long-term facts: highest priority, never dropped.
    match db_call(db, move |m| m.list_active_fact_texts(200)).await {
        Ok(Ok(facts)) if !facts.is_empty() => {
            let mut b = String::from("以下是用户明确要求我长期记住的事实（高优先级、确定，不要质疑）：\n");
            for f in &facts {
                let f = f.trim();
                if f.is_empty() {
                    continue;
                }
                remembered.insert(f.to_string());
                b.push_str("- ");
                b.push_str(f);
                b.push('\n');
            }
            evidences.push(Evidence {
                source: SOURCE_REMEMBERED_FACT,
                content: b,
                priority: PRIORITY_REMEMBERED,
            });
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "active facts load failed"),
    }

    // Today's daily summary: automatic abstraction, lower authority. Facts
    // the user already confirmed are filtered out of user_facts_explicit.
    if let Some(daily) = load_daily_summary(cfg, date) {
        let daily = filter_confirmed_explicit(&daily, &remembered);
        evidences.push(Evidence {
            source: SOURCE_DAILY_SUMMARY,
            content: format!("这是今天的对话摘要（包含自动推断内容，未必完全准确）：\n{daily}"),
            priority: PRIORITY_DAILY,
        });
    }

    // Semantic retrieval over the whole memory.
    match search::search_with_score(db, ai, cfg, cache, user_query).await {
        Ok(hits) if !hits.is_empty() => {
            let mut b = String::from("以下内容是通过语义相似度检索得到，可能与当前问题相关，但未必完全准确：\n");
            let mut included = 0usize;
            for h in hits.iter().take(cfg.search_top_k) {
                if h.summary_type == "daily" && h.date == date {
                    continue;
                }
                let text = h.text.trim();
                if remembered.contains(text) {
                    continue;
                }
                b.push_str("- ");
                b.push_str(text);
                b.push('\n');
                included += 1;
            }
            if included > 0 {
                evidences.push(Evidence {
                    source: SOURCE_SEARCH_HIT,
                    content: b,
                    priority: PRIORITY_SEARCH,
                });
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "retrieval failed; continuing without hits"),
    }

    // Short-term context from the tail of today's raw log.
    let recent = load_recent_raw(cfg, date, cfg.recent_max_lines.max(1));
    if !recent.is_empty() {
        evidences.push(Evidence {
            source: SOURCE_RECENT_RAW,
            content: format!("以下是最近的原始对话记录：\n{recent}"),
            priority: PRIORITY_RECENT,
        });
    }

    resolve_blocks(evidences)
}

/// Single resolution gate: sanitize, force the assistant role, keep
/// remembered facts first unconditionally, sort the rest by priority
/// (stable on gathering order).
fn resolve_blocks(evidences: Vec<Evidence>) -> Vec<PromptBlock> {
    let mut facts: Vec<PromptBlock> = Vec::new();
    let mut others: Vec<(PromptBlock, i32, usize)> = Vec::new();

    for (idx, e) in evidences.into_iter().enumerate() {
        let content = sanitize_for_context(&e.content);
        if content.trim().is_empty() {
            continue;
        }
        let pb = PromptBlock {
            // Context never gets system/user speaking rights.
            role: "assistant".into(),
            source: e.source.into(),
            content,
        };
        if e.source == SOURCE_REMEMBERED_FACT {
            facts.push(pb);
        } else {
            others.push((pb, e.priority, idx));
        }
    }

    others.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));

    let mut out = facts;
    out.extend(others.into_iter().map(|(pb, _, _)| pb));
    out
}

/// Drop assistant-identity self-introduction lines from injected context and
/// wrap what remains as reference material. User self-descriptions are kept.
pub fn sanitize_for_context(s: &str) -> String {
    let s = s.trim();
    if s.is_empty() {
        return String::new();
    }

    let kept: Vec<&str> = s
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !looks_like_assistant_self_intro(l))
        .collect();
    if kept.is_empty() {
        return String::new();
    }
    format!("【参考信息】\n{}", kept.join("\n"))
}

fn looks_like_assistant_self_intro(line: &str) -> bool {
    let l = line.trim();
    if l.is_empty() {
        return false;
    }
    let low = l.to_lowercase();
    let contains_any = |hay: &str, subs: &[&str]| subs.iter().any(|s| hay.contains(s));

    let en_markers = ["chatgpt", "openai", "ai assistant", "language model"];
    if (low.starts_with("i am") || low.starts_with("i'm") || low.contains("as an ai"))
        && contains_any(&low, &en_markers)
    {
        return true;
    }
    if contains_any(&low, &en_markers)
        && (low.contains("i am") || low.contains("i'm") || low.contains("as an"))
    {
        return true;
    }

    // Chinese: only drop clear assistant identity declarations, never user
    // self-descriptions like 我是程序员.
    let cn_markers = ["AI助手", "语言模型", "通义", "通义千问", "Qwen", "阿里巴巴", "ChatGPT", "OpenAI", "小天"];
    let has_marker = contains_any(l, &cn_markers) || low.contains("qwen");
    if has_marker {
        if l.contains("我是") || l.contains("作为一个") || l.contains("作为") {
            return true;
        }
        if l.contains("我主要可以") || l.contains("我可以") {
            return true;
        }
    }
    false
}

pub fn load_daily_summary(cfg: &Config, date: &str) -> Option<String> {
    let path = cfg.log_dir.join(format!("{date}.daily.json"));
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Remove `user_facts_explicit` entries (string or object form) that already
/// exist as confirmed active facts; re-serialize pretty.
fn filter_confirmed_explicit(daily: &str, remembered: &std::collections::HashSet<String>) -> String {
    let Ok(mut obj) = serde_json::from_str::<Value>(daily) else {
        return daily.to_string();
    };
    let Some(map) = obj.as_object_mut() else { return daily.to_string() };

    if let Some(Value::Array(arr)) = map.get("user_facts_explicit") {
        let filtered: Vec<Value> = arr
            .iter()
            .filter(|it| {
                let fact = match it {
                    Value::String(s) => s.trim().to_string(),
                    Value::Object(o) => o
                        .get("fact")
                        .or_else(|| o.get("content"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .trim()
                        .to_string(),
                    _ => String::new(),
                };
                !fact.is_empty() && !remembered.contains(&fact)
            })
            .cloned()
            .collect();
        if filtered.is_empty() {
            map.remove("user_facts_explicit");
        } else {
            map.insert("user_facts_explicit".into(), Value::Array(filtered));
        }
    }

    serde_json::to_string_pretty(&obj).unwrap_or_else(|_| daily.to_string())
}

/// Tail of the day's raw log formatted for injection: operational lines are
/// never injected, internal assistant markers are dropped, and each message
/// is capped and role-prefixed so first/second-person referents stay
/// unambiguous.
pub fn load_recent_raw(cfg: &Config, date: &str, max_lines: usize) -> String {
    let path = cfg.log_dir.join(format!("{date}.jsonl"));
    let Ok(raw) = std::fs::read_to_string(&path) else { return String::new() };

    let lines: Vec<&str> = raw.lines().collect();
    let start = lines.len().saturating_sub(max_lines);

    let mut out: Vec<String> = Vec::new();
    for line in &lines[start..] {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(m) = serde_json::from_str::<RawLine>(line) else { continue };
        if m.kind.as_deref().map(str::trim) == Some("op") {
            continue;
        }

        match m.role.as_str() {
            "user" => {
                if let Some(s) = format_recent("用户：", &m.content, "") {
                    out.push(s);
                }
            }
            "assistant" => {
                // Internal ack markers must never pollute future turns.
                let trim = m.content.trim();
                let marker = ["[ok]", "[noop]", "[conflict]", "[error]"]
                    .iter()
                    .any(|p| trim.starts_with(p));
                if marker
                    && ["FACTS", "待确认事实", "PENDING", "CONFLICTS"]
                        .iter()
                        .any(|k| trim.contains(k))
                {
                    continue;
                }
                if let Some(s) = format_recent("助手：", &m.content, "（仅供语境，不保证正确）") {
                    out.push(s);
                }
            }
            _ => {}
        }
    }
    out.join("\n")
}

fn format_recent(prefix: &str, content: &str, hint: &str) -> Option<String> {
    let c = content.trim().replace("\r\n", "\n").replace('\r', "\n");
    let c = c.trim();
    if c.is_empty() {
        return None;
    }

    let c = if c.chars().count() > MAX_CHARS_PER_MSG {
        let cut: String = c.chars().take(MAX_CHARS_PER_MSG).collect();
        format!("{cut} …（已截断）")
    } else {
        c.to_string()
    };

    let mut lines = c.lines();
    let mut b = String::new();
    b.push_str(prefix);
    b.push_str(lines.next().unwrap_or(""));
    if !hint.is_empty() {
        b.push_str(hint);
    }
    for l in lines {
        let l = l.trim();
        if l.is_empty() {
            continue;
        }
        b.push_str("\n  ");
        b.push_str(l);
    }
    Some(b)
}

// ---------------------------------------------------------------------------
// Context injection audit (debug surface)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ContextBlockView {
    pub role: String,
    pub source: String,
    pub priority: i32,
    pub len: usize,
    pub preview: String,
}

#[derive(Debug, Serialize)]
pub struct ChatContextAudit {
    pub date: String,
    pub question: String,
    pub policy: serde_json::Map<String, Value>,
    pub steps: Vec<String>,
    pub blocks: Vec<PromptBlock>,
    pub blocks_view: Vec<ContextBlockView>,
    pub search_hits: Vec<SearchHit>,
    pub remembered_n: usize,
    pub pending_n: usize,
    pub conflicts_n: usize,
    pub recent_raw_n: usize,
    pub daily_summary: bool,
}

pub async fn build_chat_context_audit(
    db: &SharedDB,
    ai: &AiClient,
    cfg: &Config,
    cache: &QueryEmbedCache,
    date: &str,
    user_question: &str,
) -> ChatContextAudit {
    let user_question = user_question.trim().to_string();
    let max_lines = cfg.recent_max_lines.max(1);

    let mut policy = serde_json::Map::new();
    policy.insert("search_top_k".into(), cfg.search_top_k.into());
    policy.insert("max_recent_raw".into(), max_lines.into());
    policy.insert("force_role".into(), "assistant".into());
    policy.insert(
        "order".into(),
        serde_json::json!([
            SOURCE_REMEMBERED_FACT,
            SOURCE_DAILY_SUMMARY,
            SOURCE_SEARCH_HIT,
            SOURCE_RECENT_RAW
        ]),
    );
    policy.insert("generated_at".into(), crate::db::now_rfc3339().into());

    let mut audit = ChatContextAudit {
        date: date.to_string(),
        question: user_question.clone(),
        policy,
        steps: Vec::new(),
        blocks: Vec::new(),
        blocks_view: Vec::new(),
        search_hits: Vec::new(),
        remembered_n: 0,
        pending_n: 0,
        conflicts_n: 0,
        recent_raw_n: 0,
        daily_summary: false,
    };

    if let Ok((pending, conflicts)) =
        db_call(db, |m| (m.count_pending_facts(), m.count_fact_conflicts())).await
    {
        audit.pending_n = pending;
        audit.conflicts_n = conflicts;
    }

    match load_daily_summary(cfg, date) {
        Some(daily) => {
            audit.daily_summary = true;
            audit.steps.push(format!(
                "daily_summary: added=1 note=loaded {} chars",
                daily.chars().count()
            ));
        }
        None => audit.steps.push("daily_summary: added=0 note=not found".into()),
    }

    let remembered = db_call(db, move |m| m.list_active_fact_texts(200))
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();
    audit.remembered_n = remembered.len();
    if remembered.is_empty() {
        audit.steps.push("remembered_fact: added=0 note=none".into());
    } else {
        audit
            .steps
            .push(format!("remembered_fact: added=1 note={} active", remembered.len()));
    }

    let recent = load_recent_raw(cfg, date, max_lines);
    if recent.is_empty() {
        audit.steps.push("recent_raw: added=0 note=empty".into());
    } else {
        audit.recent_raw_n = recent.lines().count();
        audit
            .steps
            .push(format!("recent_raw: added=1 note={} lines", audit.recent_raw_n));
    }

    if cfg.search_top_k > 0 && !user_question.is_empty() {
        if let Ok(hits) = search::search_with_score(db, ai, cfg, cache, &user_question).await {
            if hits.is_empty() {
                audit.steps.push("search_hits: added=0 note=none".into());
            } else {
                audit.steps.push(format!("search_hits: added=1 note={} hits", hits.len()));
                audit.search_hits = hits;
            }
        }
    } else {
        audit.steps.push("search_hits: added=0 note=none".into());
    }

    audit.blocks = build_chat_context(db, ai, cfg, cache, date, &user_question).await;
    audit.blocks_view = audit
        .blocks
        .iter()
        .map(|b| {
            let prev: String = b.content.replace('\n', " ").trim().chars().take(160).collect();
            let truncated = b.content.replace('\n', " ").trim().chars().count() > 160;
            ContextBlockView {
                role: b.role.clone(),
                source: b.source.clone(),
                priority: priority_of(&b.source),
                len: b.content.chars().count(),
                preview: if truncated { format!("{prev}…") } else { prev },
            }
        })
        .collect();

    audit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_drops_assistant_identity_lines_only() {
        let s = "我是程序员\n我是通义千问，一个AI助手\nAs an AI language model I cannot\n正常内容";
        let out = sanitize_for_context(s);
        assert!(out.starts_with("【参考信息】"));
        assert!(out.contains("我是程序员"));
        assert!(out.contains("正常内容"));
        assert!(!out.contains("通义千问"));
        assert!(!out.contains("language model"));
    }

    #[test]
    fn resolve_puts_facts_first_then_priority() {
        let evs = vec![
            Evidence { source: SOURCE_RECENT_RAW, content: "raw".into(), priority: 200 },
            Evidence { source: SOURCE_REMEMBERED_FACT, content: "facts".into(), priority: 1000 },
            Evidence { source: SOURCE_SEARCH_HIT, content: "hits".into(), priority: 400 },
            Evidence { source: SOURCE_DAILY_SUMMARY, content: "daily".into(), priority: 600 },
        ];
        let blocks = resolve_blocks(evs);
        let order: Vec<&str> = blocks.iter().map(|b| b.source.as_str()).collect();
        assert_eq!(
            order,
            vec![SOURCE_REMEMBERED_FACT, SOURCE_DAILY_SUMMARY, SOURCE_SEARCH_HIT, SOURCE_RECENT_RAW]
        );
        assert!(blocks.iter().all(|b| b.role == "assistant"));
        assert!(blocks.iter().all(|b| b.content.starts_with("【参考信息】")));
    }

    #[test]
    fn explicit_filter_handles_both_shapes() {
        let mut remembered = std::collections::HashSet::new();
        remembered.insert("我最喜欢的颜色是黄色".to_string());
        let daily = serde_json::json!({
            "type": "daily",
            "user_facts_explicit": [
                "我最喜欢的颜色是黄色",
                {"fact": "我住在上海"},
            ]
        })
        .to_string();
        let out = filter_confirmed_explicit(&daily, &remembered);
        let v: Value = serde_json::from_str(&out).unwrap();
        let arr = v["user_facts_explicit"].as_array().unwrap();
        assert_eq!(arr.len(), 1);

        // all filtered -> key removed
        let daily = serde_json::json!({
            "user_facts_explicit": ["我最喜欢的颜色是黄色"]
        })
        .to_string();
        let out = filter_confirmed_explicit(&daily, &remembered);
        let v: Value = serde_json::from_str(&out).unwrap();
        assert!(v.get("user_facts_explicit").is_none());
    }

    #[test]
    fn recent_format_truncates_and_indents() {
        let long = "长".repeat(1000);
        let s = format_recent("用户：", &long, "").unwrap();
        assert!(s.contains("…（已截断）"));
        assert!(s.chars().count() < 1000);

        let multi = format_recent("助手：", "第一行\n第二行", "（仅供语境，不保证正确）").unwrap();
        assert!(multi.starts_with("助手：第一行（仅供语境，不保证正确）"));
        assert!(multi.contains("\n  第二行"));
    }
}
