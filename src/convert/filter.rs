// src/convert/filter.rs
// Rejects system-injected / tool-call / directive entries and cleans the
// surviving transcript text. Filter rules are data: a compiled pattern
// table plus a small set of structural predicates.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

/// Message role as persisted in part files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A filtered, cleaned transcript message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Assistant messages that are pure directive acknowledgements.
/// Matched with multiline+dotall semantics.
static DIRECTIVE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^Model set to .+\.$",
        r"^Model reset to default .+\.$",
        r"^Thinking level set to .+\.$",
        r"^Thinking disabled\.$",
        r"^Verbose logging (enabled|disabled|set to .+)\.$",
        r"^Reasoning (visibility|stream) (enabled|disabled)\.$",
        r"^Elevated mode (disabled|set to .+)\.$",
        r"^Queue mode (set to .+|reset to default)\.$",
        r"^Queue debounce set to .+\.$",
        r"^Auth profile set to .+\.$",
        r"^Exec defaults set .+\.$",
        r"^Current: .+\n\nSwitch: /model",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?ms){}", p)).unwrap_or_else(|e| panic!("bad pattern {p}: {e}")))
    .collect()
});

/// User text that is system-injected rather than typed.
static SYSTEM_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(?:System|SYSTEM)\b").unwrap_or_else(|e| panic!("{e}")));

static CALL_TOOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^Call the tool \S+ with\b").unwrap_or_else(|e| panic!("{e}")));

const CONTINUATION_SENTINEL: &str =
    "This session is being continued from a previous conversation";

const NO_REPLY_MARKER: &str = "NO_REPLY";

/// Cleanup passes, applied in order.
static MESSAGE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[message_id:\s*[0-9a-fA-F]+\]").unwrap_or_else(|e| panic!("{e}"))
});

static SYSTEM_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^System:\s*\[[^\n]*\][ \t]*\n?").unwrap_or_else(|e| panic!("{e}"))
});

static COMPACTION_BANNER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\[Conversation compacted[^\n]*\][ \t]*\n?").unwrap_or_else(|e| panic!("{e}"))
});

static TELEGRAM_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[Telegram[^\]]*?(\d{1,2}:\d{2})[ \t]+([A-Za-z]{2,5})\]")
        .unwrap_or_else(|e| panic!("{e}"))
});

static NEWLINE_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").unwrap_or_else(|e| panic!("{e}")));

/// Filter one raw JSONL entry down to a cleaned message, or None.
pub fn filter_entry(entry: &Value) -> Option<Message> {
    if entry.get("type").and_then(Value::as_str) != Some("message") {
        return None;
    }
    if is_truthy(entry.get("meta")) {
        return None;
    }
    // Tool-invocation linkage on the envelope.
    if entry.get("toolCallId").is_some() || entry.get("toolUseResult").is_some() {
        return None;
    }

    let message = entry.get("message")?;
    if message.get("tool_calls").is_some() {
        return None;
    }

    let role = match message.get("role").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        _ => return None,
    };

    let blocks = message.get("content").and_then(Value::as_array)?;
    // Tool-result shaped content rejects the whole entry.
    if blocks
        .iter()
        .any(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
    {
        return None;
    }

    let text = extract_text(blocks);
    let cleaned = clean_text(&text);
    if cleaned.is_empty() {
        return None;
    }

    match role {
        Role::User if is_system_injected(&cleaned) => None,
        Role::Assistant if is_directive_ack(&cleaned) => None,
        _ => Some(Message::new(role, cleaned)),
    }
}

/// Concatenate `content[]` entries of type `text`; tool calls, thinking,
/// images and other parts are dropped.
fn extract_text(blocks: &[Value]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) != Some("text") {
            continue;
        }
        if let Some(t) = block.get("text").and_then(Value::as_str) {
            if !t.trim().is_empty() {
                parts.push(t);
            }
        }
    }
    parts.join("\n")
}

/// Normalization pipeline over extracted text.
pub fn clean_text(text: &str) -> String {
    let text = MESSAGE_ID_RE.replace_all(text, "");
    let text = SYSTEM_LINE_RE.replace_all(&text, "");
    let text = COMPACTION_BANNER_RE.replace_all(&text, "");
    let text = TELEGRAM_HEADER_RE.replace_all(&text, "[Telegram $1 $2]");
    let text = NEWLINE_RUN_RE.replace_all(&text, "\n\n");
    text.trim().to_string()
}

fn is_system_injected(text: &str) -> bool {
    SYSTEM_PREFIX_RE.is_match(text)
        || text.trim_end().ends_with(NO_REPLY_MARKER)
        || text.contains(CONTINUATION_SENTINEL)
        || CALL_TOOL_RE.is_match(text)
}

fn is_directive_ack(text: &str) -> bool {
    DIRECTIVE_PATTERNS.iter().any(|p| p.is_match(text))
}

fn is_truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}
