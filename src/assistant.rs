//! assistants: a provider plus the way it wants history delivered.
//!
//! - `Assistant::Stateless` gets the prior (non-system) turns on every call.
//! - `Assistant::Stateful` keeps one chat per `ChatId`, seeded by `create_chat`
//!   when a chat is loaded, and records each finished turn itself.
//!
//! the variant is picked from the `Provider` at construction, so callers never
//! branch on provider names.

use async_trait::async_trait;
use bevy::log::{debug, warn};
use futures_lite::{stream, Stream, StreamExt};
use std::any::type_name_of_val;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};

use crate::keys::Provider;
use crate::message::{upstream_history, ChatId, Message};
use crate::{
    ChatMessage, LLMBuilder, LLMError, LLMProvider, StreamChoice, StreamDelta, StreamResponse,
};

/// finite, in-order text fragments of one assistant reply.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, AssistantError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssistantError {
    #[error("{0}")]
    Provider(String),
    #[error("failed to build {provider} provider: {reason}")]
    Build { provider: Provider, reason: String },
    #[error("{0}")]
    Stream(String),
}

impl From<LLMError> for AssistantError {
    fn from(err: LLMError) -> Self {
        Self::Provider(err.to_string())
    }
}

/// the network side of an assistant.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// `messages` is the full request: prior turns followed by the new user turn.
    async fn chat_stream(&self, messages: &[Message]) -> Result<ChunkStream, AssistantError>;
}

/// `ChatBackend` over any `llm` provider.
#[derive(Clone)]
pub struct LlmBackend(pub Arc<dyn LLMProvider>);

#[async_trait]
impl ChatBackend for LlmBackend {
    async fn chat_stream(&self, messages: &[Message]) -> Result<ChunkStream, AssistantError> {
        let messages: Vec<ChatMessage> = messages.iter().filter_map(Message::to_llm).collect();
        let pty = type_name_of_val(self.0.as_ref());

        match self.0.chat_stream_struct(&messages).await {
            Ok(s) => Ok(s
                .filter_map(|item| match item {
                    Ok(StreamResponse { choices, .. }) => join_deltas(
                        choices
                            .into_iter()
                            .map(|StreamChoice { delta: StreamDelta { content, .. } }| content),
                    )
                    .map(Ok),
                    Err(err) => Some(Err(AssistantError::from(err))),
                })
                .boxed()),
            Err(err) => {
                warn!(target: "bevy_llm_chat",
                    "structured streaming failed for provider {}: {err}. falling back to one-shot chat()",
                    pty
                );
                let resp = self.0.chat(&messages).await?;
                let text = resp.text().unwrap_or_default().to_string();
                debug!(target: "bevy_llm_chat", "chat (fallback) completed: final_len={}", text.len());
                Ok(one_shot(text))
            }
        }
    }
}

/// text of one structured stream event; `None` when it carries no text.
fn join_deltas(contents: impl IntoIterator<Item = Option<String>>) -> Option<String> {
    let text: String = contents.into_iter().flatten().collect();
    (!text.is_empty()).then_some(text)
}

/// a whole reply as a stream: one chunk, or none for an empty reply.
fn one_shot(text: String) -> ChunkStream {
    let chunk = (!text.is_empty()).then_some(Ok::<_, AssistantError>(text));
    stream::iter(chunk).boxed()
}

/// history held by a stateful assistant, one entry per chat.
type ChatLog = Arc<Mutex<HashMap<ChatId, Vec<Message>>>>;

#[derive(Clone)]
pub enum Assistant {
    Stateless {
        provider: Provider,
        backend: Arc<dyn ChatBackend>,
    },
    Stateful {
        provider: Provider,
        backend: Arc<dyn ChatBackend>,
        chat: ChatLog,
    },
}

impl std::fmt::Debug for Assistant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assistant")
            .field("provider", &self.provider())
            .field("stateful", &self.is_stateful())
            .finish()
    }
}

impl Assistant {
    pub fn new(provider: Provider, backend: Arc<dyn ChatBackend>) -> Self {
        if provider.requires_chat_init() {
            Self::Stateful { provider, backend, chat: ChatLog::default() }
        } else {
            Self::Stateless { provider, backend }
        }
    }

    /// builds the `llm` provider for `provider` and wraps it.
    pub fn from_key(
        provider: Provider,
        api_key: impl Into<String>,
        model: Option<&str>,
    ) -> Result<Self, AssistantError> {
        let model = model.unwrap_or(provider.default_model());
        let llm: Arc<dyn LLMProvider> = LLMBuilder::new()
            .backend(provider.backend())
            .api_key(api_key.into())
            .model(model.to_string())
            .build()
            .map_err(|err| AssistantError::Build { provider, reason: err.to_string() })?
            .into();
        Ok(Self::new(provider, Arc::new(LlmBackend(llm))))
    }

    pub fn provider(&self) -> Provider {
        match self {
            Self::Stateless { provider, .. } | Self::Stateful { provider, .. } => *provider,
        }
    }

    pub fn name(&self) -> &'static str {
        self.provider().name()
    }

    pub fn is_stateful(&self) -> bool {
        matches!(self, Self::Stateful { .. })
    }

    /// seeds (or reseeds) the stateful chat for `chat_id`. no-op otherwise.
    pub fn create_chat(&self, chat_id: &ChatId, snapshot: &[Message]) {
        if let Self::Stateful { chat, .. } = self {
            chat.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(chat_id.clone(), upstream_history(snapshot));
        }
    }

    /// true when a stateful assistant still needs `create_chat` for `chat_id`.
    pub fn needs_chat(&self, chat_id: &ChatId) -> bool {
        match self {
            Self::Stateful { chat, .. } => {
                !chat.lock().unwrap_or_else(PoisonError::into_inner).contains_key(chat_id)
            }
            Self::Stateless { .. } => false,
        }
    }

    /// the stateful chat for `chat_id` as the provider will see it.
    pub fn chat_history(&self, chat_id: &ChatId) -> Option<Vec<Message>> {
        match self {
            Self::Stateful { chat, .. } => {
                chat.lock().unwrap_or_else(PoisonError::into_inner).get(chat_id).cloned()
            }
            Self::Stateless { .. } => None,
        }
    }

    /// starts a reply to `content`.
    ///
    /// stateful assistants use their own chat for `chat_id` and ignore `history`,
    /// unless that chat was never created or there is no `chat_id`; then `history`
    /// is sent and the turn is recorded only under a known `chat_id`.
    pub async fn chat_stream(
        &self,
        chat_id: Option<&ChatId>,
        content: &str,
        history: &[Message],
    ) -> Result<ChunkStream, AssistantError> {
        match self {
            Self::Stateless { backend, .. } => {
                let mut request = upstream_history(history);
                request.push(Message::user(content));
                backend.chat_stream(&request).await
            }
            Self::Stateful { backend, chat, .. } => {
                let mut request = chat_id
                    .and_then(|id| chat.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned())
                    .unwrap_or_else(|| upstream_history(history));
                request.push(Message::user(content));
                let inner = backend.chat_stream(&request).await?;
                let Some(chat_id) = chat_id else { return Ok(inner) };
                Ok(Box::pin(RecordTurn {
                    inner,
                    chat: chat.clone(),
                    chat_id: chat_id.clone(),
                    base: request,
                    reply: String::new(),
                    failed: false,
                }))
            }
        }
    }
}

/// passes chunks through and stores the finished turn under `chat_id`.
/// failed turns are not recorded.
struct RecordTurn {
    inner: ChunkStream,
    chat: ChatLog,
    chat_id: ChatId,
    /// the request that was sent: prior turns + the new user turn.
    base: Vec<Message>,
    reply: String,
    failed: bool,
}

impl Stream for RecordTurn {
    type Item = Result<String, AssistantError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = ready!(this.inner.as_mut().poll_next(cx));
        match &item {
            Some(Ok(text)) => this.reply.push_str(text),
            Some(Err(_)) => this.failed = true,
            None if !this.failed => {
                let mut turn = std::mem::take(&mut this.base);
                if !turn.is_empty() {
                    turn.push(Message::assistant(std::mem::take(&mut this.reply)));
                    this.chat
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(this.chat_id.clone(), turn);
                }
            }
            None => {}
        }
        Poll::Ready(item)
    }
}
