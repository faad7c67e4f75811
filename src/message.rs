use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ChatMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// local notices; never sent to a provider.
    System,
}

/// one entry of a chat transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub role: Role,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { content: content.into(), role }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// `llm` wire message; system notices have no counterpart.
    pub fn to_llm(&self) -> Option<ChatMessage> {
        match self.role {
            Role::User => Some(ChatMessage::user().content(self.content.clone()).build()),
            Role::Assistant => Some(ChatMessage::assistant().content(self.content.clone()).build()),
            Role::System => None,
        }
    }
}

/// prior turns worth sending upstream (everything but system notices).
pub fn upstream_history(messages: &[Message]) -> Vec<Message> {
    messages.iter().filter(|m| !m.is_system()).cloned().collect()
}

/// opaque chat identifier handed out by the owning store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl From<&str> for ChatId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
