//! Summary prompt templates. Built-in defaults are force-written to the
//! prompt directory on startup so operators can inspect what the pipeline
//! sends; the pipeline reads them back from disk.
//!
//! Guiding principle for all three: the model summarizes behavior and
//! patterns only. It must not infer user facts; it may verbatim-extract
//! explicitly stated ones (daily only).

use std::path::Path;

use crate::config::Config;
use crate::error::TimeLayerError;

pub const DAILY_PROMPT: &str = r#"You are a conversation log summarizer.
You are NOT an assistant, NOT an analyst, and NOT a memory writer.

CRITICAL RULES (must follow strictly):
- Do NOT guess, infer, or generate any facts about the user.
- Do NOT restate the user's identity, background, or preferences unless explicitly stated verbatim by the user.
- Do NOT create memory candidates or long-term interpretations.
- Do NOT rephrase, generalize, or interpret user statements.
- If something is ambiguous, implicit, or inferred, ignore it.

ALLOWED EXCEPTION (very strict):
- You MAY extract user facts ONLY IF they are:
  - Explicitly stated by the user
  - Clear, concrete, and unambiguous
  - Suitable as long-term factual statements
  - Directly restated WITHOUT paraphrasing or interpretation

If no such facts exist, do NOT output the field.

STYLE AND SCOPE CONSTRAINTS (very important):
- Do NOT improve wording, tone, or clarity beyond what is required for factual summarization.
- Do NOT generalize beyond what explicitly appears in the conversation.
- Prefer concrete descriptions over abstract interpretations.
- Avoid analytical or speculative language.

Your job is ONLY to:
1. Describe what happened in today's conversations (behavior-level).
2. Identify recurring topics or patterns.
3. Note unresolved questions or friction.
4. Strictly extract verbatim user-stated facts when allowed.

OUTPUT FORMAT (JSON only, no markdown, no extra fields):

{
  "type": "daily",
  "date": "{{DATE}}",
  "topics": [],
  "patterns": [],
  "open_questions": [],
  "highlights": [],
  "lowlights": [],
  "user_facts_explicit": []
}

IMPORTANT:
- The field "user_facts_explicit" must contain ONLY direct restatements of what the user explicitly said.
- Do NOT infer, summarize, or rewrite facts.
- If no valid facts exist, omit the field entirely.

RAW CONVERSATION LOG (JSONL):
{{TRANSCRIPT}}
"#;

pub const WEEKLY_PROMPT: &str = r#"You are a strict summarizer.
You must output JSON only.

CRITICAL RULES:
- Do NOT infer or generate user identity or personal facts.
- Do NOT create memory candidates or long-term facts.
- Do NOT restate assistant or system information.
- Weekly summary is for trends and progress only.

STYLE AND SCOPE CONSTRAINTS:
- Do NOT generalize beyond what is explicitly supported by daily summaries.
- Prefer concrete trends over abstract analysis.
- Avoid speculative or advisory language.
- If information is ambiguous, omit it.

GOAL:
Summarize patterns and progress from the past week based on daily summaries.

OUTPUT FORMAT (JSON only):

{
  "type": "weekly",
  "week_start": "{{WEEK_START}}",
  "week_end": "{{WEEK_END}}",
  "themes": [],
  "progress": [],
  "recurring_blockers": [],
  "notable_decisions": [],
  "next_week_focus": []
}

DAILY_SUMMARIES_JSON_ARRAY:
{{DAILY_JSON_ARRAY}}
"#;

pub const MONTHLY_PROMPT: &str = r#"You are a strict summarizer.
You must output JSON only.

CRITICAL RULES:
- Do NOT infer or generate user identity or personal facts.
- Do NOT create memory candidates or long-term facts.
- Do NOT restate assistant or system information.
- Monthly summary is for long-term trajectory only.

STYLE AND SCOPE CONSTRAINTS:
- Focus on direction and themes, not details.
- Avoid speculative conclusions.
- Do NOT add interpretation beyond what weekly summaries support.
- If a trend is weak or inconsistent, omit it.

GOAL:
Summarize overall direction and themes for the month.

OUTPUT FORMAT (JSON only):

{
  "type": "monthly",
  "month": "{{MONTH}}",
  "month_start": "{{MONTH_START}}",
  "month_end": "{{MONTH_END}}",
  "trajectory": [],
  "top_themes": [],
  "wins": [],
  "losses": [],
  "systems_improvements": [],
  "next_month_bets": []
}

WEEKLY_SUMMARIES_JSON_ARRAY:
{{WEEKLY_JSON_ARRAY}}
"#;

/// Force-write the built-in templates so stale copies never steer long-term
/// behavior.
pub fn ensure_prompt_files(cfg: &Config) -> std::io::Result<()> {
    std::fs::create_dir_all(&cfg.prompt_dir)?;
    std::fs::write(cfg.prompt_dir.join("daily.txt"), DAILY_PROMPT)?;
    std::fs::write(cfg.prompt_dir.join("weekly.txt"), WEEKLY_PROMPT)?;
    std::fs::write(cfg.prompt_dir.join("monthly.txt"), MONTHLY_PROMPT)?;
    Ok(())
}

/// Read a prompt template from the prompt directory, falling back to the
/// built-in default when the file is unreadable.
pub fn read_prompt(prompt_dir: &Path, name: &str) -> Result<String, TimeLayerError> {
    let path = prompt_dir.join(name);
    match std::fs::read_to_string(&path) {
        Ok(s) if !s.trim().is_empty() => Ok(s),
        _ => match name {
            "daily.txt" => Ok(DAILY_PROMPT.to_string()),
            "weekly.txt" => Ok(WEEKLY_PROMPT.to_string()),
            "monthly.txt" => Ok(MONTHLY_PROMPT.to_string()),
            other => Err(TimeLayerError::Internal(format!("unknown prompt: {other}"))),
        },
    }
}

/// Reduce partial outputs of one period into the single final JSON. The
/// reducer may only deduplicate and merge, never add facts.
pub fn merge_prompt(typ: &str, header_fields: &[(&str, &str)], partials: &[String]) -> String {
    let mut b = String::with_capacity(1024 + partials.iter().map(String::len).sum::<usize>());
    b.push_str(&format!("You are a strict {typ} summary reducer.\n"));
    b.push_str(&format!(
        "Merge multiple partial {typ} summaries into ONE final {typ} summary.\n\n"
    ));
    b.push_str("CRITICAL RULES:\n");
    b.push_str("- Output JSON only.\n");
    b.push_str("- Do NOT add new facts.\n");
    b.push_str("- Do NOT infer user identity.\n");
    b.push_str("- Deduplicate and merge semantically.\n\n");

    b.push_str("OUTPUT FORMAT (JSON only):\n{\n");
    b.push_str(&format!("  \"type\": \"{typ}\",\n"));
    for (k, v) in header_fields {
        b.push_str(&format!("  \"{k}\": \"{v}\",\n"));
    }
    let body_fields: &[&str] = match typ {
        "daily" => &["topics", "patterns", "open_questions", "highlights", "lowlights"],
        "weekly" => &["themes", "progress", "recurring_blockers", "notable_decisions", "next_week_focus"],
        _ => &["trajectory", "top_themes", "wins", "losses", "systems_improvements", "next_month_bets"],
    };
    for (i, f) in body_fields.iter().enumerate() {
        let comma = if i + 1 == body_fields.len() { "" } else { "," };
        b.push_str(&format!("  \"{f}\": []{comma}\n"));
    }
    b.push_str("}\n\n");

    b.push_str(&format!("PARTIAL {} SUMMARIES:\n", typ.to_uppercase()));
    for (i, p) in partials.iter().enumerate() {
        b.push_str(&format!("\n--- PART {}/{} ---\n{}\n", i + 1, partials.len(), p.trim()));
    }
    b
}
