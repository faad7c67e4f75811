//! two-chat bevy_llm_chat demo.
//! - tab switches the visible chat (both keep their state while hidden).
//! - f1..f5 pick an assistant (only providers with a usable key exist), f10 clears it.
//! - enter sends the prompt; sending is disabled while a reply is loading/streaming.
//! - when no api key is configured a warning panel lists the env vars to set.
//!
//! env:
//!   GOOGLE_AI_API_KEY, OPEN_AI_API_KEY, DEEPSEEK_AI_API_KEY,
//!   ANTHROPIC_AI_API_KEY, X_AI_API_KEY   (any subset)
//!   LLM_MODEL                              (optional model override)

use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_llm_chat::{
    ApiKeyStatus, Assistants, ChatErrorEvt, ChatPlugin, ChatSession, ChatSet, ChatStore,
    CredentialSet, Message, Provider, Role, send_content, switch_chat,
};

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct WarningText;
#[derive(Component)]
struct HeaderText;
#[derive(Component)]
struct HistoryText;
#[derive(Component)]
struct BusyText;
#[derive(Component)]
struct PromptText;

// ---------------------- app state ----------------------

#[derive(Resource, Default)]
struct PromptBuf(String);

/// session entities in tab order.
#[derive(Resource, Default)]
struct Chats(Vec<Entity>);

const CHAT_IDS: [&str; 2] = ["chat-1", "chat-2"];

// ---------------------- main ----------------------

fn main() {
    #[cfg(target_arch = "wasm32")]
    console_error_panic_hook::set_once();

    let credentials = CredentialSet::from_env();
    let model = std::env::var("LLM_MODEL").ok();

    let store = CHAT_IDS.iter().fold(ChatStore::default(), |store, id| {
        store.with_chat(*id, vec![Message::assistant(format!("hi! this is {id}. ask me anything."))])
    });

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(ApiKeyStatus::from_credentials(&credentials))
        .insert_resource(Assistants::from_credentials(&credentials, model.as_deref()))
        .insert_resource(store)
        .insert_resource(PromptBuf::default())
        .insert_resource(Chats::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(ChatPlugin)
        .add_systems(Startup, setup)
        .add_systems(Update, (handle_text_input, refresh_prompt_text).before(ChatSet::Switch))
        .add_systems(Update, (refresh_chat_view, on_error).after(ChatSet::Sync))
        .run();
}

// ---------------------- setup ui ----------------------

fn setup(mut commands: Commands, status: Res<ApiKeyStatus>, mut chats: ResMut<Chats>) {
    commands.spawn(Camera2d);

    for (i, id) in CHAT_IDS.iter().enumerate() {
        let mut session = ChatSession::new();
        session.active = i == 0;
        let e = commands.spawn(session).id();
        switch_chat(&mut commands, e, *id);
        chats.0.push(e);
    }

    let style_18 = TextFont { font_size: 18.0, ..default() };
    let style_14 = TextFont { font_size: 14.0, ..default() };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            // rendered once; nothing at all when a key is usable
            if let Some(warning) = status.warning() {
                p.spawn((
                    Node {
                        width: Val::Percent(100.0),
                        padding: UiRect::all(Val::Px(8.0)),
                        ..default()
                    },
                    BackgroundColor(Color::srgb(0.35, 0.22, 0.08)),
                ))
                .with_children(|w| {
                    w.spawn((
                        Text::new(warning.lines().join("\n")),
                        style_14.clone(),
                        TextColor(Color::srgb_u8(255, 220, 160)),
                        WarningText,
                    ));
                });
            }

            p.spawn((Text::new(""), style_14.clone(), TextColor(Color::srgb_u8(160, 160, 170)), HeaderText));

            // --- conversation box ---
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_grow: 1.0,
                    flex_direction: FlexDirection::Column,
                    overflow: Overflow::scroll_y(),
                    padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
            ))
            .with_children(|c| {
                c.spawn((Text::new(""), style_18.clone(), TextColor(Color::WHITE), HistoryText));
            });

            p.spawn((Text::new(""), style_14.clone(), TextColor(Color::srgb_u8(200, 200, 120)), BusyText));
            p.spawn((Text::new("> "), style_14.clone(), TextColor(Color::WHITE), PromptText));
        });
}

// ---------------------- input ----------------------

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    chats: Res<Chats>,
    mut assistants: ResMut<Assistants>,
    mut q_sessions: Query<&mut ChatSession>,
) {
    // always consume typed text so shortcut keys never leak into the prompt later
    let typed: String = ev_kbd
        .read()
        .filter(|ev| ev.state.is_pressed())
        .filter_map(|ev| ev.text.as_ref())
        .flat_map(|t| t.chars())
        .filter(|c| !c.is_control())
        .collect();

    // tab: next chat becomes the visible one
    if keys.just_pressed(KeyCode::Tab) {
        let current = chats.0.iter().position(|e| q_sessions.get(*e).is_ok_and(|s| s.active));
        let next = current.map_or(0, |i| (i + 1) % chats.0.len());
        for (i, e) in chats.0.iter().enumerate() {
            if let Ok(mut s) = q_sessions.get_mut(*e) {
                s.active = i == next;
            }
        }
        info!(target: "chat_demo", "active chat -> {}", CHAT_IDS[next]);
    }

    // f1..f5 pick the assistant, f10 clears it
    let fkeys = [KeyCode::F1, KeyCode::F2, KeyCode::F3, KeyCode::F4, KeyCode::F5];
    if let Some(i) = fkeys.iter().position(|k| keys.just_pressed(*k)) {
        assistants.select(Some(Provider::ALL[i].name()));
        info!(target: "chat_demo", "assistant -> {:?}", assistants.selected);
    }
    if keys.just_pressed(KeyCode::F10) {
        assistants.select(None);
        info!(target: "chat_demo", "assistant cleared");
    }

    prompt.0.push_str(&typed);
    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }

    if keys.just_pressed(KeyCode::Enter) && !prompt.0.trim().is_empty() {
        let Some((e, session)) = chats
            .0
            .iter()
            .find_map(|e| q_sessions.get(*e).ok().filter(|s| s.active).map(|s| (*e, s)))
        else {
            return;
        };
        // the send control is disabled while a reply is in flight
        if session.is_send_disabled() {
            return;
        }
        let msg = std::mem::take(&mut prompt.0);
        send_content(&mut commands, e, msg);
    }
}

// ---------------------- text refresh ----------------------

fn refresh_prompt_text(prompt: Res<PromptBuf>, mut q_prompt: Query<&mut Text, With<PromptText>>) {
    if prompt.is_changed()
        && let Ok(mut t) = q_prompt.single_mut() {
            t.0 = format!("> {} |", prompt.0);
    }
}

fn render_messages(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        let who = match m.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        out.push_str(who);
        out.push_str(": ");
        out.push_str(&m.content);
        out.push('\n');
    }
    out
}

fn refresh_chat_view(
    q_sessions: Query<Ref<ChatSession>>,
    assistants: Res<Assistants>,
    mut sets: ParamSet<(
        Query<&mut Text, With<HeaderText>>,
        Query<&mut Text, With<HistoryText>>,
        Query<&mut Text, With<BusyText>>,
    )>,
) {
    let changed = assistants.is_changed() || q_sessions.iter().any(|s| s.is_changed());
    if !changed {
        return;
    }
    // inactive sessions render nothing
    let Some(view) = q_sessions.iter().find_map(|s| s.into_inner().view()) else {
        return;
    };

    if let Ok(mut t) = sets.p0().single_mut() {
        let chat = view.chat_id.map(|c| c.to_string()).unwrap_or_default();
        let assistant = assistants.selected.as_deref().unwrap_or("<none>");
        t.0 = format!("chat: {chat}  |  assistant: {assistant}  |  [tab] switch chat  [f1-f5] pick assistant  [f10] none");
    }
    if let Ok(mut t) = sets.p1().single_mut() {
        t.0 = render_messages(view.messages);
    }
    if let Ok(mut t) = sets.p2().single_mut() {
        t.0 = match (view.busy, view.send_disabled) {
            (true, _) => "thinking...".to_string(),
            (false, true) => "streaming (send disabled)".to_string(),
            (false, false) => String::new(),
        };
    }
}

// ---------------------- chat events ----------------------

fn on_error(mut ev: EventReader<ChatErrorEvt>) {
    for ChatErrorEvt { entity, error, kind } in ev.read() {
        error!(target: "chat_demo", "chat error (entity={:?}, {:?}): {}", entity, kind, error);
    }
}
