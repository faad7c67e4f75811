//! bevy_llm_chat: chat sessions over several `llm` providers, as a bevy plugin.
//!
//! - one `ChatSession` component per chat view: message list + loading/streaming flags.
//! - `ChatStore` is the parent store; sessions load snapshots from it on switch and
//!   push their changes back through `ChatMessagesUpdated`.
//! - `Assistants` holds one `Assistant` per configured provider (see `keys` for
//!   which providers have usable api keys).
//! - never blocks the main thread: on native we spawn onto a tiny tokio runtime;
//!   on wasm we use bevy's async pool, which yields to the browser/event loop.
//!   chunks come back through one inbox and are applied in arrival order.
//!
//! api docs for the provider side: https://docs.rs/llm

use bevy::prelude::*;
use bevy::tasks::AsyncComputeTaskPool;
use flume::{Receiver, Sender, TryRecvError};
use futures_lite::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;

pub mod assistant;
pub mod keys;
pub mod message;
pub mod session;

pub use assistant::{Assistant, AssistantError, ChatBackend, ChunkStream, LlmBackend};
pub use keys::{ApiKeyStatus, ApiKeyWarning, CredentialSet, KeyHint, Provider, is_usable_key};
pub use message::{ChatId, Message, Role};
pub use session::{
    CancelToken, ChatErrorKind, ChatSession, SendTicket, SessionView, SyncState,
    NO_ASSISTANT_NOTICE,
};

/// re-export the llm types so downstream code can build its own providers.
pub use llm::{
    builder::{LLMBackend, LLMBuilder},
    chat::{ChatMessage, ChatProvider, ChatRole, StreamChoice, StreamDelta, StreamResponse},
    error::LLMError,
    LLMProvider,
};

/// ready-to-use assistants, keyed by name.
///
/// - `selected`: used when a `ChatSession` doesn't name one
/// - `per_key`: every configured assistant
#[derive(Resource, Clone, Debug, Default)]
pub struct Assistants {
    pub selected: Option<String>,
    pub per_key: HashMap<String, Assistant>,
}

impl Assistants {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with(mut self, key: impl Into<String>, assistant: Assistant) -> Self {
        let key = key.into();
        if self.selected.is_none() {
            self.selected = Some(key.clone());
        }
        self.per_key.insert(key, assistant);
        self
    }
    /// `None` clears the selection (sends then report "no assistant").
    pub fn select(&mut self, key: Option<&str>) {
        self.selected = key.filter(|k| self.per_key.contains_key(*k)).map(str::to_string);
    }
    /// the named assistant, else the selected one.
    pub fn resolve(&self, key: Option<&String>) -> Option<Assistant> {
        key.or(self.selected.as_ref())
            .and_then(|k| self.per_key.get(k))
            .cloned()
    }

    /// one assistant per provider with a usable key; the first one is selected.
    pub fn from_credentials(credentials: &CredentialSet, model: Option<&str>) -> Self {
        let mut out = Self::new();
        for provider in credentials.available_providers() {
            let Some(key) = credentials.usable(provider) else { continue };
            match Assistant::from_key(provider, key, model) {
                Ok(assistant) => out = out.with(provider.name(), assistant),
                Err(err) => warn!(target: "bevy_llm_chat", "skipping {}: {}", provider, err),
            }
        }
        info!(target: "bevy_llm_chat",
            "assistants: {:?} (selected={:?})",
            out.per_key.keys().collect::<Vec<_>>(), out.selected
        );
        out
    }
}

/// parent-owned message history per chat.
#[derive(Resource, Clone, Debug, Default)]
pub struct ChatStore {
    chats: HashMap<ChatId, Vec<Message>>,
}

impl ChatStore {
    pub fn with_chat(mut self, id: impl Into<ChatId>, messages: Vec<Message>) -> Self {
        self.insert(id.into(), messages);
        self
    }
    pub fn insert(&mut self, id: ChatId, messages: Vec<Message>) {
        self.chats.insert(id, messages);
    }
    pub fn messages(&self, id: &ChatId) -> &[Message] {
        self.chats.get(id).map(Vec::as_slice).unwrap_or_default()
    }
    pub fn chat_ids(&self) -> impl Iterator<Item = &ChatId> {
        self.chats.keys()
    }
}

/// on native we keep a tiny tokio runtime to drive `llm` futures.
/// we spawn onto this rt from compute tasks so neither the main thread
/// nor bevy's compute pools block.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_llm_chat", "ChatPlugin: initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering within `Update`; ui systems reading sessions should run after `Sync`.
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum ChatSet {
    /// `SwitchChat` markers load store snapshots
    Switch,
    /// `ChatRequest` markers start replies
    Send,
    /// stream inbox is applied to sessions, Chat* events emitted
    Drain,
    /// dirty sessions are pushed to the store
    Sync,
}

/// insert to load `chat_id` from the `ChatStore` into the session entity.
#[derive(Component, Clone, Debug)]
pub struct SwitchChat {
    pub chat_id: ChatId,
}

/// insert to send `content` as the next user turn of the session entity.
#[derive(Component, Clone, Debug)]
pub struct ChatRequest {
    pub content: String,
}

/// helper to enqueue a user message on a session entity.
pub fn send_content(commands: &mut Commands, target: Entity, content: impl Into<String>) {
    let content = content.into();
    info!(target: "bevy_llm_chat", "send_content -> '{}' (len={})", content, content.len());
    commands.entity(target).insert(ChatRequest { content });
}

/// helper to switch a session entity to another chat.
pub fn switch_chat(commands: &mut Commands, target: Entity, chat_id: impl Into<ChatId>) {
    commands.entity(target).insert(SwitchChat { chat_id: chat_id.into() });
}

#[derive(Event, Debug)]
pub struct ChatStarted {
    pub entity: Entity,
}
#[derive(Event, Debug)]
pub struct ChatDeltaEvt {
    pub entity: Entity,
    pub text: String,
}
#[derive(Event, Debug)]
pub struct ChatCompletedEvt {
    pub entity: Entity,
    /// the streamed assistant text, if any chunk arrived.
    pub final_text: Option<String>,
}
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub entity: Entity,
    pub error: String,
    pub kind: ChatErrorKind,
}
/// a session changed its messages; the full list for `chat_id`.
#[derive(Event, Debug, Clone)]
pub struct ChatMessagesUpdated {
    pub chat_id: ChatId,
    pub messages: Vec<Message>,
}

/// cross-thread inbox for streaming; producers send, main thread drains.
/// bounded to avoid unbounded growth when the frame stalls briefly.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

#[derive(Debug)]
pub enum StreamMsg {
    /// first chunk is about to follow
    Begin { entity: Entity, generation: u64 },
    Delta { entity: Entity, generation: u64, text: String },
    Done  { entity: Entity, generation: u64 },
    Err   { entity: Entity, generation: u64, error: String },
}

impl StreamMsg {
    fn target(&self) -> (Entity, u64) {
        match self {
            StreamMsg::Begin { entity, generation }
            | StreamMsg::Delta { entity, generation, .. }
            | StreamMsg::Done { entity, generation }
            | StreamMsg::Err { entity, generation, .. } => (*entity, *generation),
        }
    }
}

/// send to inbox (ignore disconnected). waits for room when the inbox is full
/// instead of blocking the runtime thread.
async fn push_inbox(tx: &Sender<StreamMsg>, msg: StreamMsg) {
    let _ = tx.send_async(msg).await;
}

/// drives one reply: opens the stream and forwards every chunk in order.
/// stops quietly once `ticket.cancel` is set.
async fn run_reply(
    assistant: Assistant,
    content: String,
    ticket: SendTicket,
    entity: Entity,
    tx: Sender<StreamMsg>,
) {
    let SendTicket { generation, chat_id, history, cancel } = ticket;
    let mut s = match assistant.chat_stream(chat_id.as_ref(), &content, &history).await {
        Ok(s) => s,
        Err(err) => {
            error!(target: "bevy_llm_chat", "chat error: {}", err);
            push_inbox(&tx, StreamMsg::Err { entity, generation, error: err.to_string() }).await;
            return;
        }
    };

    let mut total = 0;
    let mut began = false;
    while let Some(item) = s.next().await {
        if cancel.is_cancelled() {
            debug!(target: "bevy_llm_chat", "reply abandoned: entity={:?} generation={}", entity, generation);
            return;
        }
        match item {
            Ok(text) => {
                if !began {
                    began = true;
                    push_inbox(&tx, StreamMsg::Begin { entity, generation }).await;
                }
                total += text.len();
                push_inbox(&tx, StreamMsg::Delta { entity, generation, text }).await;
            }
            Err(err) => {
                error!(target: "bevy_llm_chat", "streaming error: {}", err);
                push_inbox(&tx, StreamMsg::Err { entity, generation, error: err.to_string() }).await;
                return;
            }
        }
    }
    info!(target: "bevy_llm_chat", "stream completed: provider={} final_len={}", assistant.name(), total);
    push_inbox(&tx, StreamMsg::Done { entity, generation }).await;
}

/// bevy plugin: wires systems, events, resources.
/// insert `Assistants` (e.g. `Assistants::from_credentials`) to enable replies.
/// on native, also inserts a tiny tokio runtime resource by default.
pub struct ChatPlugin;

impl Plugin for ChatPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_llm_chat", "ChatPlugin: build()");

        // computed once per app; tests and embedders may insert their own
        if app.world().get_resource::<ApiKeyStatus>().is_none() {
            app.insert_resource(ApiKeyStatus::from_env());
        }
        let status = app.world().resource::<ApiKeyStatus>();
        if let Some(warning) = status.warning() {
            for line in warning.lines() {
                warn!(target: "bevy_llm_chat", "{}", line);
            }
        } else {
            info!(target: "bevy_llm_chat", "api keys available for: {:?}", status.available_providers());
        }

        app.init_resource::<StreamInbox>()
            .init_resource::<ChatStore>()
            .add_event::<ChatStarted>()
            .add_event::<ChatDeltaEvt>()
            .add_event::<ChatCompletedEvt>()
            .add_event::<ChatErrorEvt>()
            .add_event::<ChatMessagesUpdated>()
            .configure_sets(
                Update,
                (ChatSet::Switch, ChatSet::Send, ChatSet::Drain, ChatSet::Sync).chain(),
            )
            .add_systems(Update, load_chat_switches.in_set(ChatSet::Switch))
            .add_systems(Update, spawn_chat_requests.in_set(ChatSet::Send))
            .add_systems(Update, drain_stream_inbox.in_set(ChatSet::Drain))
            .add_systems(
                Update,
                (sync_chat_store, apply_store_updates).chain().in_set(ChatSet::Sync),
            );

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

/// loads store snapshots into sessions and seeds stateful assistants.
fn load_chat_switches(
    mut commands: Commands,
    store: Res<ChatStore>,
    assistants: Option<Res<Assistants>>,
    mut q: Query<(Entity, &mut ChatSession, &SwitchChat)>,
) {
    for (e, mut session, SwitchChat { chat_id }) in q.iter_mut() {
        commands.entity(e).remove::<SwitchChat>();
        let snapshot = store.messages(chat_id).to_vec();
        info!(target: "bevy_llm_chat",
            "switch chat: entity={:?} chat={} msgs={}", e, chat_id, snapshot.len()
        );

        if let Some(assistant) = assistants.as_ref().and_then(|a| a.resolve(session.assistant.as_ref()))
            && assistant.is_stateful() {
                debug!(target: "bevy_llm_chat", "create_chat: provider={}", assistant.name());
                assistant.create_chat(chat_id, &snapshot);
        }
        session.load(chat_id.clone(), snapshot);
    }
}

/// spawns async tasks to fulfill pending requests (compute-tasks-first).
fn spawn_chat_requests(
    mut commands: Commands,
    assistants: Option<Res<Assistants>>,
    inbox: Res<StreamInbox>,
    mut q: Query<(Entity, &mut ChatSession, &ChatRequest)>,
    mut ev_start: EventWriter<ChatStarted>,

    // native-only: small runtime to drive network futures from `llm`
    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    for (e, mut session, req) in q.iter_mut() {
        // one-shot marker removal
        commands.entity(e).remove::<ChatRequest>();

        if session.is_send_disabled() {
            warn!(target: "bevy_llm_chat", "send ignored: entity={:?} is still replying", e);
            continue;
        }
        let Some(assistant) = assistants.as_ref().and_then(|a| a.resolve(session.assistant.as_ref()))
        else {
            info!(target: "bevy_llm_chat", "send: entity={:?} has no assistant", e);
            session.reject_no_assistant();
            continue;
        };

        // a stateful assistant picked after the switch has not seen this chat yet
        if let Some(chat_id) = session.chat_id()
            && assistant.needs_chat(chat_id) {
                debug!(target: "bevy_llm_chat", "create_chat on send: provider={} chat={}", assistant.name(), chat_id);
                assistant.create_chat(chat_id, session.messages());
        }

        let content = req.content.clone();
        let ticket = session.begin_send(content.clone());
        info!(target: "bevy_llm_chat",
            "spawn_chat_requests: entity={:?} provider={} stateful={} history={} generation={}",
            e, assistant.name(), assistant.is_stateful(), ticket.history.len(), ticket.generation
        );
        ev_start.write(ChatStarted { entity: e });

        let run = run_reply(assistant, content, ticket, e, inbox.tx.clone());
        let pool = AsyncComputeTaskPool::get();
        #[cfg(not(target_arch = "wasm32"))]
        let rt = rt.0.clone();

        pool.spawn(async move {
            #[cfg(target_arch = "wasm32")]
            {
                // wasm path: just await directly (no tokio).
                run.await;
            }
            #[cfg(not(target_arch = "wasm32"))]
            {
                // native: hand off to tokio so bevy pools stay free.
                let _ = rt.spawn(run).await;
            }
        })
        .detach();
    }
}

/// applies the inbox to sessions in arrival order and emits user-facing events.
fn drain_stream_inbox(
    inbox: Res<StreamInbox>,
    mut q: Query<&mut ChatSession>,
    mut ev_delta: EventWriter<ChatDeltaEvt>,
    mut ev_done: EventWriter<ChatCompletedEvt>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    // drain up to a cap per frame to avoid long frames on bursty streams;
    // the rest stays queued, in order, for the next frame
    const MAX_PER_FRAME: usize = 512;
    for _ in 0..MAX_PER_FRAME {
        let msg = match inbox.rx.try_recv() {
            Ok(m) => m,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        };

        let (entity, generation) = msg.target();
        let Ok(mut session) = q.get_mut(entity) else {
            debug!(target: "bevy_llm_chat", "dropping stream msg for missing entity {:?}", entity);
            continue;
        };
        if !session.accepts(generation) {
            debug!(target: "bevy_llm_chat", "dropping stale stream msg: entity={:?} generation={}", entity, generation);
            continue;
        }

        match msg {
            StreamMsg::Begin { .. } => session.begin_reply(),
            StreamMsg::Delta { text, .. } => {
                session.append_to_last(&text);
                ev_delta.write(ChatDeltaEvt { entity, text });
            }
            StreamMsg::Done { .. } => {
                let final_text = session.finish_reply();
                ev_done.write(ChatCompletedEvt { entity, final_text });
            }
            StreamMsg::Err { error, .. } => {
                let kind = session.fail_reply(&error);
                warn!(target: "bevy_llm_chat", "chat failed ({:?}): {}", kind, error);
                ev_err.write(ChatErrorEvt { entity, error, kind });
            }
        }
    }
}

/// pushes locally changed sessions to the parent store.
fn sync_chat_store(mut q: Query<&mut ChatSession>, mut ev_update: EventWriter<ChatMessagesUpdated>) {
    for mut session in q.iter_mut() {
        if session.sync_state() != SyncState::Dirty {
            continue;
        }
        if let Some((chat_id, messages)) = session.take_dirty() {
            debug!(target: "bevy_llm_chat", "sync chat={} msgs={}", chat_id, messages.len());
            ev_update.write(ChatMessagesUpdated { chat_id, messages });
        }
    }
}

/// default parent store: keeps the latest list per chat.
fn apply_store_updates(mut ev: EventReader<ChatMessagesUpdated>, mut store: ResMut<ChatStore>) {
    for ChatMessagesUpdated { chat_id, messages } in ev.read() {
        store.insert(chat_id.clone(), messages.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::testing::ScriptedBackend;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn app() -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.insert_resource(ApiKeyStatus::default());
        app.add_plugins(ChatPlugin);
        app
    }

    fn session(app: &App, e: Entity) -> &ChatSession {
        app.world().entity(e).get::<ChatSession>().expect("ChatSession exists")
    }

    fn store_updates(app: &mut App) -> Vec<ChatMessagesUpdated> {
        app.world_mut()
            .resource_mut::<Events<ChatMessagesUpdated>>()
            .drain()
            .collect()
    }

    fn inbox(app: &App) -> Sender<StreamMsg> {
        app.world().resource::<StreamInbox>().tx.clone()
    }

    /// runs frames until the session is idle again (replies run off-thread).
    fn run_until_idle(app: &mut App, e: Entity) {
        for _ in 0..500 {
            app.update();
            if !session(app, e).is_send_disabled() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("session never went idle");
    }

    #[test]
    fn attach_request_via_send_content() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);

        let e = app.world_mut().spawn(ChatSession::new()).id();
        {
            let mut commands = app.world_mut().commands();
            super::send_content(&mut commands, e, "hello world");
        }
        app.world_mut().flush();

        let req = app.world().entity(e).get::<ChatRequest>().expect("ChatRequest exists");
        assert_eq!(req.content, "hello world");
    }

    #[test]
    fn send_without_assistant_adds_one_system_message() {
        let mut app = app();
        let e = app.world_mut().spawn(ChatSession::new()).id();

        {
            let mut commands = app.world_mut().commands();
            super::send_content(&mut commands, e, "hi");
        }
        app.update();

        let s = session(&app, e);
        assert_eq!(s.messages(), &[Message::system(NO_ASSISTANT_NOTICE)]);
        assert!(!s.is_loading() && !s.is_streaming());
        assert!(app.world().entity(e).get::<ChatRequest>().is_none());
    }

    #[test]
    fn switch_loads_snapshot_without_echo() {
        let mut app = app();
        let snapshot = vec![Message::user("hi"), Message::assistant("yo")];
        app.insert_resource(ChatStore::default().with_chat("a", snapshot.clone()));
        let e = app.world_mut().spawn(ChatSession::new()).id();

        {
            let mut commands = app.world_mut().commands();
            super::switch_chat(&mut commands, e, "a");
        }
        app.update();
        assert_eq!(session(&app, e).messages(), snapshot.as_slice());
        assert!(store_updates(&mut app).is_empty(), "loading must not propagate");

        for expected_len in [3, 4] {
            {
                let mut commands = app.world_mut().commands();
                super::send_content(&mut commands, e, "again");
            }
            app.update();
            let updates = store_updates(&mut app);
            assert_eq!(updates.len(), 1);
            assert_eq!(updates[0].chat_id, ChatId::from("a"));
            assert_eq!(updates[0].messages.len(), expected_len);
        }
        assert_eq!(app.world().resource::<ChatStore>().messages(&"a".into()).len(), 4);
    }

    #[test]
    fn drain_applies_chunks_in_order() {
        let mut app = app();
        let e = app.world_mut().spawn(ChatSession::new()).id();
        let generation = {
            let mut s = app.world_mut().get_mut::<ChatSession>(e).unwrap();
            s.begin_send("say hello").generation
        };

        let tx = inbox(&app);
        tx.send(StreamMsg::Begin { entity: e, generation }).unwrap();
        tx.send(StreamMsg::Delta { entity: e, generation, text: "Hel".into() }).unwrap();
        tx.send(StreamMsg::Delta { entity: e, generation, text: "lo".into() }).unwrap();
        tx.send(StreamMsg::Done { entity: e, generation }).unwrap();
        app.update();

        let s = session(&app, e);
        assert_eq!(s.messages().last(), Some(&Message::assistant("Hello")));
        assert!(!s.is_streaming() && !s.is_loading());

        let deltas: Vec<_> = app
            .world_mut()
            .resource_mut::<Events<ChatDeltaEvt>>()
            .drain()
            .map(|d| d.text)
            .collect();
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
        let done: Vec<_> = app.world_mut().resource_mut::<Events<ChatCompletedEvt>>().drain().collect();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].final_text.as_deref(), Some("Hello"));
    }

    #[test]
    fn drain_classifies_errors() {
        let mut app = app();
        let e = app.world_mut().spawn(ChatSession::new()).id();
        let generation = app.world_mut().get_mut::<ChatSession>(e).unwrap().begin_send("x").generation;

        inbox(&app)
            .send(StreamMsg::Err { entity: e, generation, error: "HTTP 401 Unauthorized".into() })
            .unwrap();
        app.update();

        let s = session(&app, e);
        assert_eq!(s.messages().last(), Some(&Message::system(ChatErrorKind::Credentials.notice())));
        assert!(!s.is_loading() && !s.is_streaming());
        let errs: Vec<_> = app.world_mut().resource_mut::<Events<ChatErrorEvt>>().drain().collect();
        assert_eq!(errs[0].kind, ChatErrorKind::Credentials);
    }

    #[test]
    fn stale_chunks_are_dropped_after_switch() {
        let mut app = app();
        let e = app.world_mut().spawn(ChatSession::new()).id();
        let generation = app.world_mut().get_mut::<ChatSession>(e).unwrap().begin_send("x").generation;

        {
            let mut commands = app.world_mut().commands();
            super::switch_chat(&mut commands, e, "other");
        }
        app.update();

        let tx = inbox(&app);
        tx.send(StreamMsg::Begin { entity: e, generation }).unwrap();
        tx.send(StreamMsg::Delta { entity: e, generation, text: "late".into() }).unwrap();
        app.update();

        let s = session(&app, e);
        assert!(s.messages().is_empty());
        assert!(!s.is_send_disabled());
    }

    #[test]
    fn streams_reply_from_assistant() {
        let mut app = app();
        let backend = ScriptedBackend::chunks(&["Hel", "lo"]);
        app.insert_resource(
            Assistants::new().with("openai", Assistant::new(Provider::OpenAi, backend.clone())),
        );
        app.insert_resource(ChatStore::default().with_chat(
            "a",
            vec![Message::user("earlier"), Message::system("quota note"), Message::assistant("ok")],
        ));
        let e = app.world_mut().spawn(ChatSession::new()).id();
        {
            let mut commands = app.world_mut().commands();
            super::switch_chat(&mut commands, e, "a");
        }
        app.update();
        {
            let mut commands = app.world_mut().commands();
            super::send_content(&mut commands, e, "greet me");
        }
        run_until_idle(&mut app, e);

        let s = session(&app, e);
        assert_eq!(s.messages().len(), 5);
        assert_eq!(s.messages()[3], Message::user("greet me"));
        assert_eq!(s.messages()[4], Message::assistant("Hello"));
        assert_eq!(
            backend.requests(),
            vec![vec![Message::user("earlier"), Message::assistant("ok"), Message::user("greet me")]]
        );
    }

    #[test]
    fn failed_open_becomes_a_notice() {
        let mut app = app();
        app.insert_resource(Assistants::new().with(
            "deepseekai",
            Assistant::new(Provider::DeepSeekAi, ScriptedBackend::failing("insufficient quota")),
        ));
        let e = app.world_mut().spawn(ChatSession::new()).id();
        {
            let mut commands = app.world_mut().commands();
            super::send_content(&mut commands, e, "hi");
        }
        app.update();
        run_until_idle(&mut app, e);

        assert_eq!(
            session(&app, e).messages(),
            &[Message::user("hi"), Message::system(ChatErrorKind::RateLimit.notice())]
        );
    }

    #[test]
    fn sends_while_busy_are_dropped() {
        let mut app = app();
        app.insert_resource(
            Assistants::new().with("openai", Assistant::new(Provider::OpenAi, ScriptedBackend::chunks(&["x"]))),
        );
        let e = app.world_mut().spawn(ChatSession::new()).id();
        app.world_mut().get_mut::<ChatSession>(e).unwrap().begin_send("first");

        {
            let mut commands = app.world_mut().commands();
            super::send_content(&mut commands, e, "second");
        }
        app.update();

        assert_eq!(session(&app, e).messages(), &[Message::user("first")]);
    }

    #[test]
    fn switch_seeds_stateful_assistant() {
        let mut app = app();
        let google = Assistant::new(Provider::GoogleAi, ScriptedBackend::chunks(&[]));
        app.insert_resource(Assistants::new().with("googleai", google.clone()));
        app.insert_resource(ChatStore::default().with_chat(
            "a",
            vec![Message::user("q"), Message::system("n"), Message::assistant("r")],
        ));
        let e = app.world_mut().spawn(ChatSession::new().with_assistant("googleai")).id();
        {
            let mut commands = app.world_mut().commands();
            super::switch_chat(&mut commands, e, "a");
        }
        app.update();

        assert_eq!(
            google.chat_history(&"a".into()),
            Some(vec![Message::user("q"), Message::assistant("r")])
        );
    }

    #[test]
    fn stateful_chats_follow_their_session() {
        let mut app = app();
        let backend = ScriptedBackend::chunks(&["ok"]);
        let google = Assistant::new(Provider::GoogleAi, backend.clone());
        app.insert_resource(Assistants::new().with("googleai", google.clone()));
        app.insert_resource(
            ChatStore::default()
                .with_chat("a", vec![Message::user("A-history")])
                .with_chat("b", vec![Message::user("B-history")]),
        );
        let a = app.world_mut().spawn(ChatSession::new()).id();
        let b = app.world_mut().spawn(ChatSession::new().inactive()).id();
        {
            let mut commands = app.world_mut().commands();
            super::switch_chat(&mut commands, a, "a");
            super::switch_chat(&mut commands, b, "b");
        }
        app.update();

        {
            let mut commands = app.world_mut().commands();
            super::send_content(&mut commands, a, "question for A");
        }
        run_until_idle(&mut app, a);

        assert_eq!(
            backend.requests(),
            vec![vec![Message::user("A-history"), Message::user("question for A")]]
        );
        assert_eq!(google.chat_history(&"b".into()), Some(vec![Message::user("B-history")]));
    }

    #[test]
    fn stateful_assistant_picked_after_switch_sees_the_chat() {
        let mut app = app();
        app.insert_resource(
            Assistants::new().with("openai", Assistant::new(Provider::OpenAi, ScriptedBackend::chunks(&[]))),
        );
        app.insert_resource(ChatStore::default().with_chat(
            "a",
            vec![Message::user("q"), Message::system("n"), Message::assistant("r")],
        ));
        let e = app.world_mut().spawn(ChatSession::new()).id();
        {
            let mut commands = app.world_mut().commands();
            super::switch_chat(&mut commands, e, "a");
        }
        app.update();

        // selection changes to a stateful provider after the chat was loaded
        let backend = ScriptedBackend::chunks(&["fine"]);
        let google = Assistant::new(Provider::GoogleAi, backend.clone());
        app.insert_resource(Assistants::new().with("googleai", google.clone()));
        {
            let mut commands = app.world_mut().commands();
            super::send_content(&mut commands, e, "and now?");
        }
        run_until_idle(&mut app, e);

        assert_eq!(
            backend.requests(),
            vec![vec![Message::user("q"), Message::assistant("r"), Message::user("and now?")]]
        );
        assert_eq!(session(&app, e).messages().last(), Some(&Message::assistant("fine")));
    }

    #[test]
    fn full_inbox_waits_for_the_drain() {
        let (tx, rx) = flume::bounded(1);
        let assistant = Assistant::new(Provider::OpenAi, ScriptedBackend::chunks(&["a", "b", "c"]));
        let ticket = ChatSession::new().begin_send("hi");
        let generation = ticket.generation;

        // single-threaded: the reply only finishes if sends yield while the inbox is full
        let reply = run_reply(assistant, "hi".into(), ticket, Entity::PLACEHOLDER, tx);
        let drain = async {
            let mut got = Vec::new();
            while let Ok(msg) = rx.recv_async().await {
                got.push(msg);
            }
            got
        };
        let ((), got) = pollster::block_on(futures_lite::future::zip(reply, drain));

        let labels: Vec<_> = got
            .iter()
            .map(|m| {
                assert_eq!(m.target(), (Entity::PLACEHOLDER, generation));
                match m {
                    StreamMsg::Begin { .. } => "begin".to_string(),
                    StreamMsg::Delta { text, .. } => text.clone(),
                    StreamMsg::Done { .. } => "done".to_string(),
                    StreamMsg::Err { error, .. } => error.clone(),
                }
            })
            .collect();
        assert_eq!(labels, vec!["begin", "a", "b", "c", "done"]);
    }

    #[test]
    fn assistants_selection() {
        let a = Assistant::new(Provider::OpenAi, ScriptedBackend::chunks(&[]));
        let b = Assistant::new(Provider::XAi, ScriptedBackend::chunks(&[]));
        let mut assistants = Assistants::new().with("openai", a).with("xai", b);

        assert_eq!(assistants.selected.as_deref(), Some("openai"));
        assert_eq!(assistants.resolve(Some(&"xai".to_string())).unwrap().provider(), Provider::XAi);

        assistants.select(Some("missing"));
        assert!(assistants.resolve(None).is_none());
        assistants.select(Some("xai"));
        assert_eq!(assistants.resolve(None).unwrap().provider(), Provider::XAi);
    }

    #[test]
    fn no_credentials_no_assistants() {
        let assistants = Assistants::from_credentials(
            &CredentialSet::default().with(Provider::OpenAi, "your-actual-api-key"),
            None,
        );
        assert!(assistants.per_key.is_empty());
        assert_eq!(assistants.selected, None);
    }
}
