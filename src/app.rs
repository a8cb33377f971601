use std::sync::Arc;

use ratatui::widgets::ListState;
use tokio::sync::mpsc::UnboundedSender;

use crate::bus::{ChatSignal, EventBus};
use crate::message::ChatMode;
use crate::router::Router;
use crate::session::{ChatSession, SessionEvent, HISTORY_PARAM};
use crate::store::LastChatStore;
use crate::transport::{ChatSummary, ChatTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusPane {
    Thread,
    Sidebar,
}

/// Completions for app-level background work, kept separate from the
/// per-session event channels.
#[derive(Debug)]
pub enum UiMessage {
    SidebarLoaded {
        mode: ChatMode,
        result: Result<Vec<ChatSummary>, TransportError>,
    },
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub mode: ChatMode,
    pub input_mode: InputMode,
    pub focus: FocusPane,

    // One session per chat mode; switching screens never tears them down.
    pub ask: ChatSession,
    pub market: ChatSession,
    pub ask_router: Router,
    pub market_router: Router,

    // History sidebar
    pub show_sidebar: bool,
    pub sidebar_chats: Vec<ChatSummary>,
    pub sidebar_state: ListState,
    pub sidebar_loading: bool,

    // Thread viewport
    pub thread_scroll: u16,
    pub thread_height: u16,
    pub thread_width: u16,
    pub stick_to_bottom: bool,

    // Transient notice shown at the bottom of the screen
    pub toast: Option<String>,
    toast_ticks: u8,

    // Animation state
    pub animation_frame: u8, // 0-2 for ellipsis animation

    transport: Arc<dyn ChatTransport>,
    bus: EventBus,
    ui_tx: UnboundedSender<UiMessage>,
    user_id: String,
}

impl App {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: String,
        transport: Arc<dyn ChatTransport>,
        store: LastChatStore,
        bus: EventBus,
        ask_tx: UnboundedSender<SessionEvent>,
        market_tx: UnboundedSender<SessionEvent>,
        ui_tx: UnboundedSender<UiMessage>,
    ) -> Self {
        let ask_router = Router::new("/ask-buddy");
        let market_router = Router::new("/market-transaction");

        let ask = ChatSession::new(
            ChatMode::AskBuddy,
            user_id.clone(),
            transport.clone(),
            store.clone(),
            ask_router.clone(),
            bus.clone(),
            ask_tx,
        );
        let market = ChatSession::new(
            ChatMode::MarketTransaction,
            user_id.clone(),
            transport.clone(),
            store.clone(),
            market_router.clone(),
            bus.clone(),
            market_tx,
        );

        Self {
            should_quit: false,
            mode: ChatMode::AskBuddy,
            input_mode: InputMode::Normal,
            focus: FocusPane::Thread,
            ask,
            market,
            ask_router,
            market_router,
            show_sidebar: false,
            sidebar_chats: Vec::new(),
            sidebar_state: ListState::default(),
            sidebar_loading: false,
            thread_scroll: 0,
            thread_height: 0,
            thread_width: 0,
            stick_to_bottom: true,
            toast: None,
            toast_ticks: 0,
            animation_frame: 0,
            transport,
            bus,
            ui_tx,
            user_id,
        }
    }

    pub fn session(&self) -> &ChatSession {
        match self.mode {
            ChatMode::AskBuddy => &self.ask,
            ChatMode::MarketTransaction => &self.market,
        }
    }

    pub fn session_mut(&mut self) -> &mut ChatSession {
        match self.mode {
            ChatMode::AskBuddy => &mut self.ask,
            ChatMode::MarketTransaction => &mut self.market,
        }
    }

    pub fn router(&self) -> &Router {
        match self.mode {
            ChatMode::AskBuddy => &self.ask_router,
            ChatMode::MarketTransaction => &self.market_router,
        }
    }

    fn store(&self) -> &LastChatStore {
        // Both sessions share the same backing file; either handle works.
        self.session().store()
    }

    /// Switch the visible screen. The hidden session keeps its thread and
    /// any in-flight turn.
    pub fn switch_mode(&mut self, mode: ChatMode) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        self.stick_to_bottom = true;
        self.thread_scroll = 0;
        self.session_mut().sync_route();
        if self.show_sidebar {
            self.refresh_sidebar();
        }
    }

    /// Start a fresh conversation in the current mode. The reset itself is
    /// driven by the broadcast so every listener sees the same signal.
    pub fn request_new_chat(&mut self) {
        self.bus.emit(ChatSignal::NewChat(self.mode));
    }

    /// Seed each mode's location with its stored last chat id so the
    /// sessions pick up where the user left off. Called once at startup.
    pub fn restore_last_chats(&mut self) {
        if let Some(id) = self.ask.store().get(ChatMode::AskBuddy) {
            self.ask_router.replace_query_param(HISTORY_PARAM, Some(&id));
            self.ask.sync_route();
        }
        if let Some(id) = self.market.store().get(ChatMode::MarketTransaction) {
            self.market_router.replace_query_param(HISTORY_PARAM, Some(&id));
            self.market.sync_route();
        }
    }

    /// Reopen the most recent conversation for this mode, if one is known.
    pub fn resume_last_chat(&mut self) {
        let Some(id) = self.store().get(self.mode) else {
            self.show_toast("No previous chat for this mode");
            return;
        };
        self.router().replace_query_param(HISTORY_PARAM, Some(&id));
        self.stick_to_bottom = true;
        self.session_mut().sync_route();
    }

    /// Send one of the mode's suggested questions. Only offered while the
    /// thread is still empty.
    pub fn send_suggested(&mut self, index: usize) {
        let session = self.session_mut();
        if !session.messages.is_empty() || session.is_loading() {
            return;
        }
        let question = session.profile().suggested_questions.get(index).copied();
        if let Some(question) = question {
            session.send_message(question);
            self.stick_to_bottom = true;
        }
    }

    pub fn on_signal(&mut self, signal: ChatSignal) {
        match signal {
            ChatSignal::NewChat(mode) => {
                let session = match mode {
                    ChatMode::AskBuddy => &mut self.ask,
                    ChatMode::MarketTransaction => &mut self.market,
                };
                session.reset_new_chat();
                if mode == self.mode {
                    self.stick_to_bottom = true;
                    self.thread_scroll = 0;
                }
            }
            ChatSignal::ChatUpdated => {
                if self.show_sidebar {
                    self.refresh_sidebar();
                }
            }
        }
    }

    // ---- Sidebar -----------------------------------------------------------

    pub fn toggle_sidebar(&mut self) {
        self.show_sidebar = !self.show_sidebar;
        if self.show_sidebar {
            self.focus = FocusPane::Sidebar;
            self.refresh_sidebar();
        } else {
            self.focus = FocusPane::Thread;
        }
    }

    pub fn refresh_sidebar(&mut self) {
        self.sidebar_loading = true;
        let transport = self.transport.clone();
        let ui_tx = self.ui_tx.clone();
        let mode = self.mode;
        let user_id = self.user_id.clone();
        tokio::spawn(async move {
            let result = transport.list_chats(mode, &user_id).await;
            let _ = ui_tx.send(UiMessage::SidebarLoaded { mode, result });
        });
    }

    pub fn apply_ui(&mut self, message: UiMessage) {
        match message {
            UiMessage::SidebarLoaded { mode, result } => {
                if mode != self.mode {
                    return;
                }
                self.sidebar_loading = false;
                match result {
                    Ok(mut chats) => {
                        // Newest first, matching the web sidebar.
                        chats.reverse();
                        self.sidebar_chats = chats;
                        if self.sidebar_chats.is_empty() {
                            self.sidebar_state.select(None);
                        } else if self.sidebar_state.selected().is_none() {
                            self.sidebar_state.select(Some(0));
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to list chats");
                        self.show_toast("Could not load chat history");
                    }
                }
            }
        }
    }

    pub fn sidebar_nav_down(&mut self) {
        let len = self.sidebar_chats.len();
        if len > 0 {
            let i = self.sidebar_state.selected().unwrap_or(0);
            self.sidebar_state.select(Some((i + 1).min(len - 1)));
        }
    }

    pub fn sidebar_nav_up(&mut self) {
        let i = self.sidebar_state.selected().unwrap_or(0);
        self.sidebar_state.select(Some(i.saturating_sub(1)));
    }

    /// Open the selected sidebar entry in the current mode's screen.
    pub fn open_selected_chat(&mut self) {
        let Some(summary) = self
            .sidebar_state
            .selected()
            .and_then(|i| self.sidebar_chats.get(i))
        else {
            return;
        };
        let id = summary.id.clone();
        self.router().replace_query_param(HISTORY_PARAM, Some(&id));
        self.stick_to_bottom = true;
        self.thread_scroll = 0;
        self.session_mut().sync_route();
        self.show_sidebar = false;
        self.focus = FocusPane::Thread;
    }

    // ---- Transient UI ------------------------------------------------------

    pub fn show_toast(&mut self, message: &str) {
        self.toast = Some(message.to_string());
        self.toast_ticks = 10; // ~3s at the 300ms tick rate
    }

    /// Surface any pending session notices as toasts.
    pub fn drain_notices(&mut self) {
        if let Some(notice) = self.ask.take_notice() {
            self.show_toast(&notice);
        }
        if let Some(notice) = self.market.take_notice() {
            self.show_toast(&notice);
        }
    }

    /// Tick animation frame (called by Tick event)
    pub fn tick_animation(&mut self) {
        if self.session().is_loading() || self.session().is_loading_history() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
        if self.toast_ticks > 0 {
            self.toast_ticks -= 1;
            if self.toast_ticks == 0 {
                self.toast = None;
            }
        }
    }

    // Thread scrolling
    pub fn scroll_down(&mut self) {
        self.thread_scroll = self.thread_scroll.saturating_add(1);
    }

    pub fn scroll_up(&mut self) {
        self.stick_to_bottom = false;
        self.thread_scroll = self.thread_scroll.saturating_sub(1);
    }

    pub fn scroll_to_top(&mut self) {
        self.stick_to_bottom = false;
        self.thread_scroll = 0;
    }

    pub fn scroll_to_bottom(&mut self) {
        self.stick_to_bottom = true;
    }
}
