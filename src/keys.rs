//! api key availability: which providers have a usable credential.
//!
//! keys are read once from the environment (see `Provider::env_var`). a key
//! counts only if it is non-empty and not a template placeholder such as
//! `your-actual-api-key` or `your-openai-key`.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::LLMBackend;

/// exact placeholder shipped in `.env` templates.
pub const PLACEHOLDER_KEY: &str = "your-actual-api-key";
/// any key containing this is a template value.
pub const PLACEHOLDER_FRAGMENT: &str = "your-";

/// the providers a chat can be routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GoogleAi,
    OpenAi,
    DeepSeekAi,
    AnthropicAi,
    XAi,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::GoogleAi,
        Provider::OpenAi,
        Provider::DeepSeekAi,
        Provider::AnthropicAi,
        Provider::XAi,
    ];

    /// short stable name, also used as the key in `Assistants`.
    pub fn name(self) -> &'static str {
        match self {
            Provider::GoogleAi => "googleai",
            Provider::OpenAi => "openai",
            Provider::DeepSeekAi => "deepseekai",
            Provider::AnthropicAi => "anthropicai",
            Provider::XAi => "xai",
        }
    }

    pub fn env_var(self) -> &'static str {
        match self {
            Provider::GoogleAi => "GOOGLE_AI_API_KEY",
            Provider::OpenAi => "OPEN_AI_API_KEY",
            Provider::DeepSeekAi => "DEEPSEEK_AI_API_KEY",
            Provider::AnthropicAi => "ANTHROPIC_AI_API_KEY",
            Provider::XAi => "X_AI_API_KEY",
        }
    }

    pub fn backend(self) -> LLMBackend {
        match self {
            Provider::GoogleAi => LLMBackend::Google,
            Provider::OpenAi => LLMBackend::OpenAI,
            Provider::DeepSeekAi => LLMBackend::DeepSeek,
            Provider::AnthropicAi => LLMBackend::Anthropic,
            Provider::XAi => LLMBackend::XAI,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::GoogleAi => "gemini-2.0-flash",
            Provider::OpenAi => "gpt-4o-mini",
            Provider::DeepSeekAi => "deepseek-chat",
            Provider::AnthropicAi => "claude-3-5-haiku-latest",
            Provider::XAi => "grok-2-latest",
        }
    }

    /// google chats are seeded once with history (`create_chat`) and then
    /// only receive the new turn; the others get the history on every call.
    pub fn requires_chat_init(self) -> bool {
        matches!(self, Provider::GoogleAi)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// true iff the value looks like a real key.
pub fn is_usable_key(key: &str) -> bool {
    !key.is_empty() && key != PLACEHOLDER_KEY && !key.contains(PLACEHOLDER_FRAGMENT)
}

/// raw credential values per provider (unset = `None`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CredentialSet {
    keys: HashMap<Provider, Option<String>>,
}

impl CredentialSet {
    /// reads every `Provider::env_var`; unset or non-unicode vars are `None`.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(mut lookup: impl FnMut(&str) -> Option<String>) -> Self {
        let keys = Provider::ALL
            .into_iter()
            .map(|p| (p, lookup(p.env_var())))
            .collect();
        Self { keys }
    }

    pub fn with(mut self, provider: Provider, key: impl Into<String>) -> Self {
        self.keys.insert(provider, Some(key.into()));
        self
    }

    pub fn get(&self, provider: Provider) -> Option<&str> {
        self.keys.get(&provider).and_then(|k| k.as_deref())
    }

    /// usable key for `provider`, if any.
    pub fn usable(&self, provider: Provider) -> Option<&str> {
        self.get(provider).filter(|k| is_usable_key(k))
    }

    /// providers with a usable key, in `Provider::ALL` order.
    pub fn available_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.usable(*p).is_some())
            .collect()
    }
}

/// one configuration key shown in the warning panel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyHint {
    pub env_var: &'static str,
    pub recommended: Option<&'static str>,
}

/// static warning shown when no provider has a usable key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiKeyWarning {
    pub title: &'static str,
    pub body: &'static str,
    pub keys: Vec<KeyHint>,
}

impl Default for ApiKeyWarning {
    fn default() -> Self {
        let hint = |p: Provider, recommended| KeyHint { env_var: p.env_var(), recommended };
        Self {
            title: "No API Keys Configured",
            body: "Please add at least one API key to use the chatbot:",
            keys: vec![
                hint(Provider::DeepSeekAi, Some("Recommended - Free tier")),
                hint(Provider::OpenAi, None),
                hint(Provider::GoogleAi, None),
                hint(Provider::AnthropicAi, None),
                hint(Provider::XAi, None),
            ],
        }
    }
}

impl ApiKeyWarning {
    /// plain text rendering, one line per entry.
    pub fn lines(&self) -> Vec<String> {
        let mut out = vec![format!("! {}", self.title), self.body.to_string()];
        for KeyHint { env_var, recommended } in &self.keys {
            match recommended {
                Some(note) => out.push(format!("  - {env_var} ({note})")),
                None => out.push(format!("  - {env_var}")),
            }
        }
        out
    }
}

/// which providers are usable, computed once per app.
#[derive(Resource, Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiKeyStatus {
    available: Vec<Provider>,
}

impl ApiKeyStatus {
    pub fn from_credentials(credentials: &CredentialSet) -> Self {
        Self { available: credentials.available_providers() }
    }

    pub fn from_env() -> Self {
        Self::from_credentials(&CredentialSet::from_env())
    }

    pub fn available_providers(&self) -> &[Provider] {
        &self.available
    }

    pub fn has_any_key(&self) -> bool {
        !self.available.is_empty()
    }

    /// `None` when at least one provider is usable: nothing to show.
    pub fn warning(&self) -> Option<ApiKeyWarning> {
        (!self.has_any_key()).then(ApiKeyWarning::default)
    }
}
