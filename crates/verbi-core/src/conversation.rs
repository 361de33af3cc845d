use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful Assistant called Verbi. \
You are friendly and fun and you will help the users with their requests. \
Your answers are short and concise.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

/// Ordered chat transcript sent to the language model on every turn.
///
/// The first entry is always the system prompt the history was built with.
/// User and assistant entries can only be appended, so turn order is the
/// order of the vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationHistory {
    system_prompt: String,
    entries: Vec<Message>,
}

// Never empty: the system entry is always present, see `is_fresh`.
#[allow(clippy::len_without_is_empty)]
impl ConversationHistory {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        let entries = vec![Message::new(Role::System, system_prompt.clone())];
        Self {
            system_prompt,
            entries,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn entries(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing but the system prompt is present.
    pub fn is_fresh(&self) -> bool {
        self.entries.len() == 1
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.entries.push(Message::new(Role::User, content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.entries.push(Message::new(Role::Assistant, content));
    }

    pub fn clear(&mut self) {
        self.entries.truncate(1);
        self.entries[0] = Message::new(Role::System, self.system_prompt.clone());
    }

    /// Content-free identity of the transcript, safe to put in trace logs.
    pub fn digest(&self) -> String {
        let mut h = Sha256::new();
        for m in &self.entries {
            h.update(m.role.as_str().as_bytes());
            h.update([0u8]);
            h.update(m.content.as_bytes());
            h.update([0u8]);
        }
        hex::encode(h.finalize())
    }
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_history_starts_with_system_prompt() {
        let h = ConversationHistory::new("be brief");
        assert_eq!(h.len(), 1);
        assert_eq!(h.entries()[0], Message::new(Role::System, "be brief"));
        assert!(h.is_fresh());
    }

    #[test]
    fn clear_is_idempotent_and_keeps_system_prompt() {
        let mut h = ConversationHistory::default();
        h.push_user("Hi");
        h.push_assistant("Hello!");
        h.clear();
        let once = h.clone();
        h.clear();
        assert_eq!(h, once);
        assert_eq!(h.entries()[0].role, Role::System);
        assert_eq!(h.entries()[0].content, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn digest_changes_with_content() {
        let mut h = ConversationHistory::default();
        let d0 = h.digest();
        h.push_user("Hi");
        assert_ne!(d0, h.digest());
        assert_eq!(h.digest().len(), 64);
    }

    #[test]
    fn role_serializes_lowercase() {
        let m = Message::new(Role::Assistant, "ok");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "assistant");
        assert_eq!(Role::parse(" User "), Some(Role::User));
        assert_eq!(Role::parse("bot"), None);
    }
}
