use crate::chat::{Message, Role};

/// Model-facing text assembled from a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    text: String,
    messages: usize,
    last_user: Option<String>,
}

impl Prompt {
    /// System prompt (if any), every message in order role-tagged, then an
    /// assistant cue. Nothing is trimmed here.
    pub fn assemble(system_prompt: &str, messages: &[Message]) -> Self {
        let mut text = String::new();
        let system = system_prompt.trim();
        if !system.is_empty() {
            text.push_str("system: ");
            text.push_str(system);
            text.push_str("\n\n");
        }
        for m in messages {
            text.push_str(m.role().as_str());
            text.push_str(": ");
            text.push_str(m.text());
            text.push_str("\n\n");
        }
        text.push_str("assistant:");
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role() == Role::User)
            .map(|m| m.text().to_string());
        Self {
            text,
            messages: messages.len(),
            last_user,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn message_count(&self) -> usize {
        self.messages
    }

    /// Text of the most recent user message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.last_user.as_deref()
    }

    pub fn into_string(self) -> String {
        self.text
    }
}
