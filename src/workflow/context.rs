//! Conversation context for a run: a size-bounded message payload and the
//! rolling per-project summary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ContextSection;
use crate::store::{Message, MessageKind, MessageRole};
use crate::util::truncate_chars;

#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub max_messages: usize,
    /// Bytes of JSON the message payload may occupy.
    pub payload_budget: usize,
    /// Bytes of JSON the rolling summary may occupy.
    pub summary_budget: usize,
}

impl From<&ContextSection> for ContextBudget {
    fn from(section: &ContextSection) -> Self {
        Self {
            max_messages: section.max_messages,
            payload_budget: section.payload_budget,
            summary_budget: section.summary_budget,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: MessageRole,
    pub kind: MessageKind,
    pub content: String,
}

impl From<&Message> for ContextMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role,
            kind: msg.kind,
            content: msg.content.clone(),
        }
    }
}

/// Output of `LOAD_CONTEXT`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadedContext {
    pub messages: Vec<ContextMessage>,
    /// Messages left out to stay within budget.
    pub dropped: usize,
    pub rolling_summary: Vec<String>,
    pub latest_fragment_id: Option<String>,
    pub files: BTreeMap<String, String>,
}

impl LoadedContext {
    /// Prompt-ready rendering: summary first, then the recent turns.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.rolling_summary.is_empty() {
            out.push_str("Earlier in this project:\n");
            for entry in &self.rolling_summary {
                out.push_str(&format!("- {}\n", entry));
            }
            out.push('\n');
        }
        if self.dropped > 0 {
            out.push_str(&format!("({} older message(s) omitted)\n", self.dropped));
        }
        for msg in &self.messages {
            let label = match (msg.role, msg.kind) {
                (MessageRole::User, _) => "user",
                (MessageRole::Assistant, MessageKind::Error) => "assistant (error)",
                (MessageRole::Assistant, MessageKind::Result) => "assistant",
            };
            out.push_str(&format!("{}: {}\n", label, msg.content));
        }
        if out.is_empty() {
            out.push_str("(no prior messages)");
        }
        out
    }
}

fn encoded_len<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map_or(usize::MAX, |v| v.len())
}

/// Keep the newest `max_messages`, then drop from the oldest end until the
/// JSON encoding fits `budget`. The newest message always survives.
///
/// Returns the kept messages (oldest first) and how many were dropped.
pub fn bound_payload(messages: Vec<ContextMessage>, budget: &ContextBudget) -> (Vec<ContextMessage>, usize) {
    let total = messages.len();
    let skip = total.saturating_sub(budget.max_messages.max(1));
    let mut kept: Vec<ContextMessage> = messages.into_iter().skip(skip).collect();
    while kept.len() > 1 && encoded_len(&kept) > budget.payload_budget {
        kept.remove(0);
    }
    let dropped = total - kept.len();
    (kept, dropped)
}

/// Append one turn to the rolling summary and drop the oldest entries while
/// the encoding exceeds `budget`. Appending the same turn twice in a row is a
/// no-op, so a replayed save does not duplicate it.
pub fn append_summary(entries: &mut Vec<String>, user: &str, assistant: &str, budget: usize) {
    // Each half gets a quarter of the budget so a single entry always fits.
    let side = (budget / 4).max(16);
    let entry = format!(
        "user: {} | assistant: {}",
        truncate_chars(user.trim(), side),
        truncate_chars(assistant.trim(), side)
    );
    if entries.last() == Some(&entry) {
        return;
    }
    entries.push(entry);
    while entries.len() > 1 && encoded_len(entries.as_slice()) > budget {
        entries.remove(0);
    }
}
