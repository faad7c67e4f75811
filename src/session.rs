//! per-chat controller state: the message list and its loading/streaming flags.
//!
//! one send walks `idle -> loading -> streaming -> idle`; any failure drops back
//! to idle with a system notice appended. systems in `lib.rs` drive the
//! transitions; everything here is plain state so it can be tested without an app.

use bevy::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::message::{upstream_history, ChatId, Message, Role};

pub const NO_ASSISTANT_NOTICE: &str =
    "No AI assistant selected. Please choose an assistant from the dropdown.";

/// coarse failure buckets, picked by substring match on the error text.
///
/// this is a heuristic: an unrelated error that happens to mention "network"
/// lands in `Network`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChatErrorKind {
    Credentials,
    RateLimit,
    Network,
    Unknown,
}

impl ChatErrorKind {
    pub fn classify(message: &str) -> Self {
        let has = |needle: &str| message.contains(needle);
        if has("API key") || has("401") {
            Self::Credentials
        } else if has("quota") || has("429") {
            Self::RateLimit
        } else if has("network") || has("fetch") {
            Self::Network
        } else {
            Self::Unknown
        }
    }

    /// text shown to the user as a system message.
    pub fn notice(self) -> &'static str {
        match self {
            Self::Credentials => "API key is missing or invalid. Please check your configuration.",
            Self::RateLimit => {
                "API quota exceeded. Please try again later or use a different assistant."
            }
            Self::Network => "Network error. Please check your connection and try again.",
            Self::Unknown => "Sorry, I couldn't process your request. Please try again!",
        }
    }
}

/// whether the local list still matches what the store handed us.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncState {
    /// freshly loaded snapshot; nothing to push back.
    #[default]
    Loaded,
    /// changed locally since the last push.
    Dirty,
    /// local changes have been pushed.
    Synced,
}

/// shared flag telling an in-flight stream task to stop.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// what a stream task needs after `begin_send`.
#[derive(Clone, Debug)]
pub struct SendTicket {
    pub generation: u64,
    /// chat the send belongs to, if one was loaded.
    pub chat_id: Option<ChatId>,
    /// prior turns, system notices removed, *without* the new user message.
    pub history: Vec<Message>,
    pub cancel: CancelToken,
}

/// read-only projection for ui systems.
#[derive(Clone, Copy, Debug)]
pub struct SessionView<'a> {
    pub chat_id: Option<&'a ChatId>,
    pub messages: &'a [Message],
    /// show a busy indicator.
    pub busy: bool,
    pub send_disabled: bool,
}

/// attach to an entity to give it a chat. starts active and empty.
#[derive(Component, Clone, Debug)]
pub struct ChatSession {
    /// key into `Assistants`; `None` uses the selected assistant.
    pub assistant: Option<String>,
    /// inactive sessions keep their state but render nothing.
    pub active: bool,
    chat_id: Option<ChatId>,
    messages: Vec<Message>,
    is_loading: bool,
    is_streaming: bool,
    sync: SyncState,
    generation: u64,
    inflight: Option<CancelToken>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self {
            assistant: None,
            active: true,
            chat_id: None,
            messages: Vec::new(),
            is_loading: false,
            is_streaming: false,
            sync: SyncState::default(),
            generation: 0,
            inflight: None,
        }
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assistant(mut self, key: impl Into<String>) -> Self {
        self.assistant = Some(key.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn chat_id(&self) -> Option<&ChatId> {
        self.chat_id.as_ref()
    }
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
    pub fn is_loading(&self) -> bool {
        self.is_loading
    }
    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }
    pub fn sync_state(&self) -> SyncState {
        self.sync
    }
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// no concurrent sends on one session.
    pub fn is_send_disabled(&self) -> bool {
        self.is_loading || self.is_streaming
    }

    pub fn view(&self) -> Option<SessionView<'_>> {
        self.active.then(|| SessionView {
            chat_id: self.chat_id.as_ref(),
            messages: &self.messages,
            busy: self.is_loading,
            send_disabled: self.is_send_disabled(),
        })
    }

    /// replaces the list with a store snapshot. abandons any in-flight reply.
    pub fn load(&mut self, chat_id: ChatId, snapshot: Vec<Message>) {
        self.abandon_inflight();
        self.chat_id = Some(chat_id);
        self.messages = snapshot;
        self.sync = SyncState::Loaded;
    }

    fn abandon_inflight(&mut self) {
        if let Some(cancel) = self.inflight.take() {
            cancel.cancel();
        }
        self.generation += 1;
        self.is_loading = false;
        self.is_streaming = false;
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.sync = SyncState::Dirty;
    }

    /// streaming append onto the newest message.
    pub fn append_to_last(&mut self, text: &str) {
        if let Some(last) = self.messages.last_mut() {
            last.content.push_str(text);
            self.sync = SyncState::Dirty;
        }
    }

    pub fn reject_no_assistant(&mut self) {
        self.push(Message::system(NO_ASSISTANT_NOTICE));
    }

    /// appends the user turn and enters `loading`.
    pub fn begin_send(&mut self, content: impl Into<String>) -> SendTicket {
        let history = upstream_history(&self.messages);
        self.abandon_inflight();
        self.push(Message::user(content));
        self.is_loading = true;
        let cancel = CancelToken::default();
        self.inflight = Some(cancel.clone());
        SendTicket { generation: self.generation, chat_id: self.chat_id.clone(), history, cancel }
    }

    /// stream updates from older sends (or from before a switch) are dropped.
    pub fn accepts(&self, generation: u64) -> bool {
        self.generation == generation && self.inflight.is_some()
    }

    /// first chunk arrived: open an empty assistant message.
    pub fn begin_reply(&mut self) {
        self.push(Message::assistant(String::new()));
        self.is_loading = false;
        self.is_streaming = true;
    }

    /// returns the streamed reply, if one was opened.
    pub fn finish_reply(&mut self) -> Option<String> {
        let streamed = self.is_streaming;
        self.is_loading = false;
        self.is_streaming = false;
        self.inflight = None;
        self.messages
            .last()
            .filter(|m| streamed && m.role == Role::Assistant)
            .map(|m| m.content.clone())
    }

    pub fn fail_reply(&mut self, error: &str) -> ChatErrorKind {
        let kind = ChatErrorKind::classify(error);
        self.push(Message::system(kind.notice()));
        self.is_loading = false;
        self.is_streaming = false;
        self.inflight = None;
        kind
    }

    /// the list to push to the store, if it changed since the last push.
    pub fn take_dirty(&mut self) -> Option<(ChatId, Vec<Message>)> {
        if self.sync != SyncState::Dirty {
            return None;
        }
        self.sync = SyncState::Synced;
        self.chat_id.clone().map(|id| (id, self.messages.clone()))
    }
}
