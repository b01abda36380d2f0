use super::message::Message;
use crate::provider::StylePreset;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user-visible conversation and its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatThread {
    id: String,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    style: StylePreset,
    #[serde(default = "default_guardrails")]
    guardrails: bool,
    #[serde(default)]
    messages: Vec<Message>,

    /// Completed assistant turns ever recorded; survives history clears.
    #[serde(default)]
    turns: u64,
}

fn default_guardrails() -> bool {
    true
}

impl ChatThread {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            style: StylePreset::default(),
            guardrails: true,
            messages: Vec::new(),
            turns: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn style(&self) -> StylePreset {
        self.style
    }

    pub fn guardrails(&self) -> bool {
        self.guardrails
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn turns(&self) -> u64 {
        self.turns
    }

    pub fn rename(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.touch();
    }

    pub fn set_style(&mut self, style: StylePreset) {
        self.style = style;
        self.touch();
    }

    pub fn set_guardrails(&mut self, enabled: bool) {
        self.guardrails = enabled;
        self.touch();
    }

    /// Empty the transcript. Identity, title and counters stay.
    pub fn clear_history(&mut self) {
        self.messages.clear();
        self.touch();
    }

    /// History followed by the pending user message, as handed to a session.
    pub fn transcript_with(&self, pending: &Message) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.extend(self.messages.iter().cloned());
        out.push(pending.clone());
        out
    }

    pub(crate) fn record_turn(&mut self, user: Message, assistant: Message) {
        self.messages.push(user);
        self.messages.push(assistant);
        self.turns += 1;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Short title derived from the first prompt of a thread.
pub fn title_from_prompt(prompt: &str) -> String {
    const MAX: usize = 40;
    let line = prompt.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return "New chat".to_string();
    }
    if line.chars().count() <= MAX {
        return line.to_string();
    }
    let mut t: String = line.chars().take(MAX).collect();
    t.push('…');
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Role;

    #[test]
    fn clear_history_keeps_title_and_counters() {
        let mut t = ChatThread::new("Groceries");
        t.record_turn(Message::user("milk?"), Message::assistant("yes"));
        assert_eq!(t.messages().len(), 2);
        assert_eq!(t.turns(), 1);

        let id = t.id().to_string();
        t.clear_history();
        assert!(t.messages().is_empty());
        assert_eq!(t.title(), "Groceries");
        assert_eq!(t.id(), id);
        assert_eq!(t.turns(), 1);
    }

    #[test]
    fn transcript_ends_with_pending_message() {
        let mut t = ChatThread::new("x");
        t.record_turn(Message::user("a"), Message::assistant("b"));
        let pending = Message::user("c");
        let tr = t.transcript_with(&pending);
        let roles: Vec<_> = tr.iter().map(|m| m.role()).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert_eq!(tr.last().map(|m| m.text()), Some("c"));
        assert_eq!(t.messages().len(), 2);
    }

    #[test]
    fn defaults_for_new_thread() {
        let t = ChatThread::new("x");
        assert_eq!(t.style(), StylePreset::Balanced);
        assert!(t.guardrails());
        assert_eq!(t.turns(), 0);
    }

    #[test]
    fn missing_fields_take_defaults_when_loading() {
        let json = r#"{
            "id": "abc",
            "title": "old",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        }"#;
        let t: ChatThread = serde_json::from_str(json).unwrap();
        assert!(t.guardrails());
        assert_eq!(t.style(), StylePreset::Balanced);
        assert!(t.messages().is_empty());
    }

    #[test]
    fn title_is_truncated() {
        assert_eq!(title_from_prompt("  Hello  "), "Hello");
        assert_eq!(title_from_prompt(""), "New chat");
        let long = "a".repeat(60);
        let t = title_from_prompt(&long);
        assert_eq!(t.chars().count(), 41);
        assert!(t.ends_with('…'));
    }
}
