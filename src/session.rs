use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{ChatSignal, EventBus};
use crate::message::{
    clock_from_timestamp, clock_now, normalize_role, parse_image_urls, parse_reply_payload,
    reveal_tokens, timestamp_now, ChatMessage, ChatMode,
};
use crate::router::Router;
use crate::store::LastChatStore;
use crate::transport::{
    ChatRecordMessage, ChatTransport, CreatedChat, FetchedChat, OutgoingMessage, QueryRequest,
    TransportError,
};

pub const HISTORY_PARAM: &str = "historyId";

const SESSION_EXPIRED_TEXT: &str = "It looks like your session has ended, so I couldn't start the conversation. Please log in again to continue.";
const GENERIC_ERROR_TEXT: &str = "Sorry, I encountered an error. Please try again.";
const NOT_FOUND_NOTICE: &str = "This chat no longer exists.";
const INTERRUPTED_HISTORY_TEXT: &str = "For this chat, only the first message was saved. It looks like the previous request may have been canceled or interrupted. You can continue now";

/// Per-mode copy and query defaults, mirroring the two chat pages.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    pub title: &'static str,
    pub description: &'static str,
    pub welcome_placeholder: &'static str,
    pub bottom_placeholder: &'static str,
    pub thinking_intro: String,
    pub thinking_mid: String,
    pub suggested_questions: Vec<&'static str>,
    pub market_name: Option<String>,
    pub transaction_type: Option<String>,
}

impl SessionProfile {
    pub fn for_mode(mode: ChatMode) -> Self {
        match mode {
            ChatMode::AskBuddy => Self {
                title: "Welcome,",
                description: "I am your smart buddy for data and insights. How can I help you today?",
                welcome_placeholder: "What's the unit availability at Sobha One? Give me the handover date.",
                bottom_placeholder: "Ask anything",
                thinking_intro: "Understanding your query".to_string(),
                thinking_mid: "Looking up information for you".to_string(),
                suggested_questions: vec![
                    "Give me units in Sobha One with 1200 sq ft area & price under 3M AED.",
                    "What's the price range and psf range for 2-bed units in Sobha Hartland II?",
                    "How is Sobha One better than Emaar Beachfront for investment?",
                    "What's the unit availability at Sobha SeaHaven? Give me the payment plan.",
                ],
                market_name: None,
                transaction_type: None,
            },
            ChatMode::MarketTransaction => Self {
                title: "Transaction Data",
                description: "Query and analyze new sale, resales and rental transaction data across property types.",
                welcome_placeholder: "What's the avg price psf sold in Business Bay vs Downtown Dubai?",
                bottom_placeholder: "Ask any market transaction question",
                thinking_intro: "Understanding your transaction query".to_string(),
                thinking_mid: "Reviewing market transaction data for you".to_string(),
                suggested_questions: vec![
                    "What is the avg price per sq ft for off-plan sales in Downtown Dubai in 2024?",
                    "Which area had the most villa sales in the last 3 months?",
                    "Give sales trends for Palm Jumeirah. What's the median PSF?",
                    "What's the avg rental yield in JVC for 1-bed apartments?",
                ],
                market_name: Some("dubai".to_string()),
                transaction_type: Some("default-transaction".to_string()),
            },
        }
    }
}

/// Simulated UI pacing for the thinking/reveal phases. Injectable so tests
/// can shrink the schedule; none of it is derived from network progress.
#[derive(Debug, Clone)]
pub struct SessionTiming {
    /// Staged placeholder copy, as (offset from send, text). The intro text
    /// is applied synchronously at send time.
    pub thinking_stages: Vec<(Duration, String)>,
    pub reveal_interval: Duration,
}

impl SessionTiming {
    pub fn standard(profile: &SessionProfile) -> Self {
        Self {
            thinking_stages: vec![
                (Duration::from_secs(5), profile.thinking_mid.clone()),
                (Duration::from_secs(10), "Thinking".to_string()),
                (Duration::from_secs(15), "Almost there".to_string()),
                (
                    Duration::from_secs(18),
                    "This is taking a while, thanks for your patience.".to_string(),
                ),
            ],
            reveal_interval: Duration::from_millis(20),
        }
    }
}

/// Completions posted back to the controller by its spawned tasks. Every
/// event carries the turn or hydration-request id it belongs to; stale ids
/// are discarded on apply.
#[derive(Debug)]
pub enum SessionEvent {
    ThinkingStage { turn: u64, text: String },
    ChatCreated { turn: u64, result: Result<CreatedChat, TransportError> },
    QueryFinished { turn: u64, result: Result<String, TransportError> },
    RevealTick { turn: u64 },
    HistoryLoaded { request: u64, result: Result<FetchedChat, TransportError> },
}

#[derive(Debug)]
struct RevealState {
    tokens: Vec<String>,
    shown: usize,
    full_text: String,
    images: Vec<String>,
}

/// Rollback context and task handles for the single in-flight turn.
/// Dropping it aborts every task belonging to the turn.
#[derive(Debug)]
struct PendingTurn {
    id: u64,
    user_msg_id: String,
    placeholder_id: String,
    submitted_text: String,
    thinking_task: Option<JoinHandle<()>>,
    driver_task: Option<JoinHandle<()>>,
    reveal_task: Option<JoinHandle<()>>,
    reveal: Option<RevealState>,
}

impl PendingTurn {
    fn abort_tasks(&mut self) {
        for task in [
            self.thinking_task.take(),
            self.driver_task.take(),
            self.reveal_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

impl Drop for PendingTurn {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[derive(Debug)]
enum Hydration {
    Idle,
    Loading {
        request: u64,
        history_id: String,
        task: JoinHandle<()>,
    },
    Hydrated {
        history_id: String,
    },
}

/// The chat session controller. Owns one conversation's message list,
/// identity, and in-flight work for a fixed mode. All mutation happens on
/// the app loop through `apply`; spawned tasks only post `SessionEvent`s.
pub struct ChatSession {
    mode: ChatMode,
    profile: SessionProfile,
    timing: SessionTiming,
    user_id: String,

    transport: Arc<dyn ChatTransport>,
    store: LastChatStore,
    router: Router,
    bus: EventBus,
    tx: UnboundedSender<SessionEvent>,

    pub messages: Vec<ChatMessage>,
    pub input: String,
    pub cursor: usize,

    conversation_id: Option<String>,
    session_id: Option<String>,
    hydration: Hydration,
    hydration_seq: u64,
    suppress_next_history_load: bool,
    turn: Option<PendingTurn>,
    turn_seq: u64,
    notice: Option<String>,
}

impl ChatSession {
    pub fn new(
        mode: ChatMode,
        user_id: String,
        transport: Arc<dyn ChatTransport>,
        store: LastChatStore,
        router: Router,
        bus: EventBus,
        tx: UnboundedSender<SessionEvent>,
    ) -> Self {
        let profile = SessionProfile::for_mode(mode);
        let timing = SessionTiming::standard(&profile);
        Self {
            mode,
            profile,
            timing,
            user_id,
            transport,
            store,
            router,
            bus,
            tx,
            messages: Vec::new(),
            input: String::new(),
            cursor: 0,
            conversation_id: None,
            session_id: None,
            hydration: Hydration::Idle,
            hydration_seq: 0,
            suppress_next_history_load: false,
            turn: None,
            turn_seq: 0,
            notice: None,
        }
    }

    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    pub fn profile(&self) -> &SessionProfile {
        &self.profile
    }

    pub fn store(&self) -> &LastChatStore {
        &self.store
    }

    pub fn set_timing(&mut self, timing: SessionTiming) {
        self.timing = timing;
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// True while a turn is in flight (placeholder pending or typing).
    pub fn is_loading(&self) -> bool {
        self.turn.is_some()
    }

    pub fn is_loading_history(&self) -> bool {
        matches!(self.hydration, Hydration::Loading { .. })
    }

    /// One-shot notice for the toast surface.
    pub fn take_notice(&mut self) -> Option<String> {
        self.notice.take()
    }

    // ---- History hydration -------------------------------------------------

    /// Reconcile with the session's location. Called whenever the history
    /// query parameter may have changed.
    pub fn sync_route(&mut self) {
        let Some(history_id) = self.router.query_param(HISTORY_PARAM) else {
            // Leaving a history chat for a fresh one.
            if !matches!(self.hydration, Hydration::Idle) {
                self.abort_hydration();
                self.conversation_id = None;
                self.messages.clear();
            }
            return;
        };

        if self.tracked_history_id() == Some(history_id.as_str()) {
            return;
        }

        // A navigation the controller itself caused by pushing a freshly
        // created chat id into the location must not re-hydrate it.
        if self.suppress_next_history_load
            && self.conversation_id.as_deref() == Some(history_id.as_str())
        {
            self.suppress_next_history_load = false;
            self.hydration = Hydration::Hydrated { history_id };
            return;
        }

        self.start_history_load(history_id);
    }

    fn tracked_history_id(&self) -> Option<&str> {
        match &self.hydration {
            Hydration::Idle => None,
            Hydration::Loading { history_id, .. } | Hydration::Hydrated { history_id } => {
                Some(history_id)
            }
        }
    }

    fn abort_hydration(&mut self) {
        if let Hydration::Loading { task, .. } =
            std::mem::replace(&mut self.hydration, Hydration::Idle)
        {
            task.abort();
        }
    }

    fn start_history_load(&mut self, history_id: String) {
        self.abort_hydration();
        self.hydration_seq += 1;
        let request = self.hydration_seq;
        self.messages.clear();

        tracing::info!(mode = self.mode.as_str(), %history_id, "loading chat history");

        let transport = self.transport.clone();
        let tx = self.tx.clone();
        let mode = self.mode;
        let id = history_id.clone();
        let task = tokio::spawn(async move {
            let result = transport.get_chat(mode, &id).await;
            let _ = tx.send(SessionEvent::HistoryLoaded { request, result });
        });

        self.hydration = Hydration::Loading {
            request,
            history_id,
            task,
        };
    }

    fn on_history_loaded(&mut self, request: u64, result: Result<FetchedChat, TransportError>) {
        let history_id = match &self.hydration {
            Hydration::Loading {
                request: current,
                history_id,
                ..
            } if *current == request => history_id.clone(),
            // Superseded by a newer load or a reset; drop the stale result.
            _ => return,
        };

        match result {
            Err(err) if err.is_not_found() => {
                self.notice = Some(NOT_FOUND_NOTICE.to_string());
                self.hydration = Hydration::Idle;
                self.conversation_id = None;
                self.messages.clear();
                self.router.replace_query_param(HISTORY_PARAM, None);
            }
            Err(err) => {
                tracing::error!(%history_id, error = %err, "failed to load chat history");
                self.hydration = Hydration::Idle;
            }
            Ok(chat) => {
                if chat.messages.is_empty() {
                    self.hydration = Hydration::Idle;
                    return;
                }

                self.conversation_id =
                    Some(chat.id.clone().unwrap_or_else(|| history_id.clone()));
                self.session_id = Some(Uuid::new_v4().to_string());
                if let Err(err) = self.store.set(self.mode, Some(&history_id)) {
                    tracing::warn!(error = %err, "failed to persist last chat id");
                }

                let mut records = chat.messages.clone();
                if records.len() == 1 {
                    // The backend only durably stored the first turn of an
                    // interrupted request; pair it with an explanation so the
                    // thread never ends on a dangling user message.
                    let timestamp = records[0]
                        .timestamp
                        .clone()
                        .or_else(|| chat.created_at.clone());
                    records.push(ChatRecordMessage {
                        id: None,
                        role: "assistant".to_string(),
                        text: INTERRUPTED_HISTORY_TEXT.to_string(),
                        timestamp,
                    });
                }

                self.messages = records
                    .iter()
                    .enumerate()
                    .map(|(idx, record)| {
                        let (content, images) = parse_image_urls(&record.text);
                        let mut msg = ChatMessage {
                            id: record.id.clone().unwrap_or_else(|| idx.to_string()),
                            role: normalize_role(&record.role),
                            content,
                            time: clock_from_timestamp(
                                record
                                    .timestamp
                                    .as_deref()
                                    .or(chat.created_at.as_deref()),
                            ),
                            images: Vec::new(),
                            pending: false,
                            typing: false,
                            image_placeholder_count: 0,
                        };
                        msg.images = images;
                        msg
                    })
                    .collect();
                self.hydration = Hydration::Hydrated { history_id };
            }
        }
    }

    /// Mode-scoped "new chat" reset: empty thread, no identity, cleared
    /// last-chat slot. Any in-flight turn or hydration is superseded.
    pub fn reset_new_chat(&mut self) {
        self.abort_hydration();
        self.turn = None;
        self.messages.clear();
        self.conversation_id = None;
        if let Err(err) = self.store.set(self.mode, None) {
            tracing::warn!(error = %err, "failed to clear last chat id");
        }
        self.router.replace_query_param(HISTORY_PARAM, None);
    }

    // ---- Send / thinking / typing pipeline ---------------------------------

    pub fn send_current_input(&mut self) {
        let text = self.input.clone();
        self.send_message(&text);
    }

    pub fn send_message(&mut self, text: &str) {
        let trimmed = text.trim().to_string();
        if trimmed.is_empty() || self.turn.is_some() {
            return;
        }

        let time = clock_now();
        let user_msg_id = Uuid::new_v4().to_string();
        let placeholder_id = Uuid::new_v4().to_string();
        self.messages.push(ChatMessage::user(
            user_msg_id.clone(),
            trimmed.clone(),
            time.clone(),
        ));
        self.messages.push(ChatMessage::placeholder(
            placeholder_id.clone(),
            self.profile.thinking_intro.clone(),
            time,
        ));

        let submitted_text = text.to_string();
        self.input.clear();
        self.cursor = 0;

        self.turn_seq += 1;
        let turn_id = self.turn_seq;
        let session_id = self
            .session_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();

        let stages = self.timing.thinking_stages.clone();
        let tx = self.tx.clone();
        let thinking_task = tokio::spawn(async move {
            let mut elapsed = Duration::ZERO;
            for (offset, text) in stages {
                tokio::time::sleep(offset.saturating_sub(elapsed)).await;
                elapsed = offset;
                if tx
                    .send(SessionEvent::ThinkingStage {
                        turn: turn_id,
                        text,
                    })
                    .is_err()
                {
                    return;
                }
            }
        });

        let transport = self.transport.clone();
        let tx = self.tx.clone();
        let mode = self.mode;
        let user_id = self.user_id.clone();
        let conversation_id = self.conversation_id.clone();
        let market_name = self.profile.market_name.clone();
        let transaction_type = self.profile.transaction_type.clone();
        let query = trimmed;
        let driver_task = tokio::spawn(async move {
            let mut effective_user = user_id.clone();
            let chat_id = match conversation_id {
                Some(id) => id,
                None => {
                    let first_message = OutgoingMessage {
                        role: "user".to_string(),
                        text: query.clone(),
                        timestamp: timestamp_now(),
                    };
                    match transport.create_chat(mode, &user_id, first_message).await {
                        Ok(created) => {
                            if let Some(corrected) = &created.user_id {
                                effective_user = corrected.clone();
                            }
                            let chat_id = created.chat_id.clone();
                            let _ = tx.send(SessionEvent::ChatCreated {
                                turn: turn_id,
                                result: Ok(created),
                            });
                            chat_id
                        }
                        Err(err) => {
                            let _ = tx.send(SessionEvent::ChatCreated {
                                turn: turn_id,
                                result: Err(err),
                            });
                            return;
                        }
                    }
                }
            };

            let request = QueryRequest {
                chat_id,
                user_id: effective_user,
                query,
                query_id: Uuid::new_v4().to_string(),
                session_id,
                market_name,
                transaction_type,
            };
            let result = transport.run_query(mode, request).await;
            let _ = tx.send(SessionEvent::QueryFinished {
                turn: turn_id,
                result,
            });
        });

        self.turn = Some(PendingTurn {
            id: turn_id,
            user_msg_id,
            placeholder_id,
            submitted_text,
            thinking_task: Some(thinking_task),
            driver_task: Some(driver_task),
            reveal_task: None,
            reveal: None,
        });
    }

    /// Cancel the in-flight turn: abort its tasks, unwind the optimistic
    /// user/placeholder pair, and put the submitted text back in the input.
    /// Returns false when nothing was in flight.
    pub fn cancel_current(&mut self) -> bool {
        let Some(turn) = self.turn.take() else {
            return false;
        };
        self.messages
            .retain(|m| m.id != turn.user_msg_id && m.id != turn.placeholder_id);
        self.input = turn.submitted_text.clone();
        self.cursor = self.input.chars().count();
        // Dropping the turn aborts its timers and the network call; a late
        // resolution cannot match the retired turn id either way.
        true
    }

    // ---- Event application -------------------------------------------------

    pub fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ThinkingStage { turn, text } => self.on_thinking_stage(turn, text),
            SessionEvent::ChatCreated { turn, result } => self.on_chat_created(turn, result),
            SessionEvent::QueryFinished { turn, result } => self.on_query_finished(turn, result),
            SessionEvent::RevealTick { turn } => self.on_reveal_tick(turn),
            SessionEvent::HistoryLoaded { request, result } => {
                self.on_history_loaded(request, result)
            }
        }
    }

    fn on_thinking_stage(&mut self, turn_id: u64, text: String) {
        let Some(placeholder_id) = self
            .turn
            .as_ref()
            .filter(|t| t.id == turn_id)
            .map(|t| t.placeholder_id.clone())
        else {
            return;
        };
        // Only while the placeholder is still waiting for a real answer.
        if let Some(msg) = self
            .messages
            .iter_mut()
            .find(|m| m.id == placeholder_id && m.pending)
        {
            msg.content = text;
        }
    }

    fn on_chat_created(&mut self, turn_id: u64, result: Result<CreatedChat, TransportError>) {
        let Some(turn) = self.turn.as_ref().filter(|t| t.id == turn_id) else {
            return;
        };
        let placeholder_id = turn.placeholder_id.clone();

        match result {
            Ok(created) => {
                tracing::info!(mode = self.mode.as_str(), chat_id = %created.chat_id, "conversation created");
                self.conversation_id = Some(created.chat_id.clone());
                // The location update below must not be mistaken for an
                // external switch request.
                self.suppress_next_history_load = true;
                self.router
                    .replace_query_param(HISTORY_PARAM, Some(&created.chat_id));
                if let Err(err) = self.store.set(self.mode, Some(&created.chat_id)) {
                    tracing::warn!(error = %err, "failed to persist last chat id");
                }
                self.bus.emit(ChatSignal::ChatUpdated);
                self.sync_route();
            }
            Err(err) => {
                tracing::warn!(error = %err, "chat creation failed");
                self.notice = Some("Failed to initialize chat".to_string());
                if let Some(msg) = self.messages.iter_mut().find(|m| m.id == placeholder_id) {
                    msg.pending = false;
                    msg.content = SESSION_EXPIRED_TEXT.to_string();
                    msg.time = clock_now();
                }
                self.turn = None;
            }
        }
    }

    fn on_query_finished(&mut self, turn_id: u64, result: Result<String, TransportError>) {
        let Some(turn) = self.turn.as_mut().filter(|t| t.id == turn_id) else {
            return;
        };
        // Thinking copy must not advance once the answer has arrived.
        if let Some(task) = turn.thinking_task.take() {
            task.abort();
        }
        let placeholder_id = turn.placeholder_id.clone();

        match result {
            Err(err) if err.is_cancelled() => {
                self.turn = None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "query failed");
                self.notice = Some(err.to_string());
                if let Some(msg) = self.messages.iter_mut().find(|m| m.id == placeholder_id) {
                    msg.pending = false;
                    msg.typing = false;
                    msg.content = GENERIC_ERROR_TEXT.to_string();
                    msg.time = clock_now();
                }
                self.turn = None;
            }
            Ok(body) => {
                let payload = parse_reply_payload(&body);
                let (text, inline_images) = parse_image_urls(&payload.text);
                let images = if payload.images.is_empty() {
                    inline_images
                } else {
                    payload.images
                };

                if let Some(msg) = self.messages.iter_mut().find(|m| m.id == placeholder_id) {
                    msg.pending = false;
                    msg.typing = true;
                    msg.content = String::new();
                    msg.image_placeholder_count = images.len();
                    msg.images.clear();
                }

                let tokens = reveal_tokens(&text);
                let interval = self.timing.reveal_interval;
                let tx = self.tx.clone();
                if let Some(turn) = self.turn.as_mut() {
                    turn.reveal = Some(RevealState {
                        tokens,
                        shown: 0,
                        full_text: text,
                        images,
                    });
                    turn.reveal_task = Some(tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(interval);
                        // The first tick of an interval resolves immediately.
                        ticker.tick().await;
                        loop {
                            ticker.tick().await;
                            if tx.send(SessionEvent::RevealTick { turn: turn_id }).is_err() {
                                return;
                            }
                        }
                    }));
                }
            }
        }
    }

    fn on_reveal_tick(&mut self, turn_id: u64) {
        let Some(turn) = self.turn.as_mut().filter(|t| t.id == turn_id) else {
            return;
        };
        let Some(reveal) = turn.reveal.as_mut() else {
            return;
        };

        reveal.shown = (reveal.shown + 1).min(reveal.tokens.len());
        let content = reveal.tokens[..reveal.shown].concat();
        let done = reveal.shown >= reveal.tokens.len();
        let placeholder_id = turn.placeholder_id.clone();

        if let Some(msg) = self.messages.iter_mut().find(|m| m.id == placeholder_id) {
            msg.content = content;
        }

        if done {
            self.finish_reveal();
        }
    }

    fn finish_reveal(&mut self) {
        let Some(mut turn) = self.turn.take() else {
            return;
        };
        let Some(reveal) = turn.reveal.take() else {
            return;
        };

        if let Some(msg) = self
            .messages
            .iter_mut()
            .find(|m| m.id == turn.placeholder_id)
        {
            msg.typing = false;
            msg.content = reveal.full_text;
            msg.images = reveal.images;
            msg.image_placeholder_count = 0;
            msg.time = clock_now();
        }
        self.bus.emit(ChatSignal::ChatUpdated);
        // Turn drops here, aborting the reveal ticker.
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Hydration::Loading { task, .. } = &self.hydration {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    #[derive(Default)]
    struct MockTransport {
        fail_create: bool,
        hang_query: bool,
        query_delay: Option<Duration>,
        reply_body: Mutex<String>,
        chats: Mutex<HashMap<String, FetchedChat>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn with_reply(body: &str) -> Self {
            Self {
                reply_body: Mutex::new(body.to_string()),
                ..Default::default()
            }
        }

        fn insert_chat(&self, id: &str, chat: FetchedChat) {
            self.chats.lock().unwrap().insert(id.to_string(), chat);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, op: &str, mode: ChatMode) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", op, mode.as_str()));
        }
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        async fn create_chat(
            &self,
            mode: ChatMode,
            _user_id: &str,
            _first_message: OutgoingMessage,
        ) -> Result<CreatedChat, TransportError> {
            self.record("create", mode);
            if self.fail_create {
                return Err(TransportError::Status { status: 401 });
            }
            Ok(CreatedChat {
                chat_id: format!("{}-chat-1", mode.as_str()),
                user_id: None,
            })
        }

        async fn run_query(
            &self,
            mode: ChatMode,
            _request: QueryRequest,
        ) -> Result<String, TransportError> {
            self.record("query", mode);
            if self.hang_query {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.query_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.reply_body.lock().unwrap().clone())
        }

        async fn get_chat(
            &self,
            mode: ChatMode,
            chat_id: &str,
        ) -> Result<FetchedChat, TransportError> {
            self.record("get", mode);
            self.chats
                .lock()
                .unwrap()
                .get(chat_id)
                .cloned()
                .ok_or(TransportError::NotFound)
        }

        async fn list_chats(
            &self,
            mode: ChatMode,
            _user_id: &str,
        ) -> Result<Vec<crate::transport::ChatSummary>, TransportError> {
            self.record("list", mode);
            Ok(Vec::new())
        }
    }

    struct Harness {
        session: ChatSession,
        rx: UnboundedReceiver<SessionEvent>,
        router: Router,
        store: LastChatStore,
        _dir: TempDir,
    }

    fn harness(mode: ChatMode, transport: Arc<MockTransport>) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = LastChatStore::with_path(dir.path().join("last_chats.json"));
        let router = Router::new(&format!("/{}", mode.as_str()));
        let bus = EventBus::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = ChatSession::new(
            mode,
            "agent-1".to_string(),
            transport,
            store.clone(),
            router.clone(),
            bus,
            tx,
        );
        // Keep test pacing fast; offsets stay far enough apart to observe.
        session.set_timing(SessionTiming {
            thinking_stages: vec![(Duration::from_millis(10), "stage one".to_string())],
            reveal_interval: Duration::from_millis(1),
        });
        Harness {
            session,
            rx,
            router,
            store,
            _dir: dir,
        }
    }

    async fn pump_until<F>(h: &mut Harness, mut predicate: F)
    where
        F: FnMut(&ChatSession) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !predicate(&h.session) {
                let event = h.rx.recv().await.expect("event channel closed");
                h.session.apply(event);
            }
        })
        .await
        .expect("session did not reach the expected state");
    }

    async fn pump_until_idle(h: &mut Harness) {
        pump_until(h, |s| !s.is_loading() && !s.is_loading_history()).await;
    }

    fn fetched(messages: Vec<(&str, &str)>) -> FetchedChat {
        FetchedChat {
            id: Some("c1".to_string()),
            created_at: Some("2026-03-01T09:30:00Z".to_string()),
            messages: messages
                .into_iter()
                .map(|(role, text)| ChatRecordMessage {
                    id: None,
                    role: role.to_string(),
                    text: text.to_string(),
                    timestamp: Some("2026-03-01T09:30:00Z".to_string()),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_at_most_one_turn_in_flight() {
        let transport = Arc::new(MockTransport {
            hang_query: true,
            ..Default::default()
        });
        let mut h = harness(ChatMode::AskBuddy, transport);

        h.session.send_message("first question");
        h.session.send_message("second question");
        h.session.send_message("third question");

        // Exactly one optimistic user/placeholder pair.
        assert_eq!(h.session.messages.len(), 2);
        assert_eq!(h.session.messages[0].content, "first question");
        assert!(h.session.messages[1].pending);
        assert!(h.session.is_loading());
    }

    #[tokio::test]
    async fn test_whitespace_only_input_is_ignored() {
        let transport = Arc::new(MockTransport::with_reply("hi"));
        let mut h = harness(ChatMode::AskBuddy, transport);
        h.session.send_message("   \n\t ");
        assert!(h.session.messages.is_empty());
        assert!(!h.session.is_loading());
    }

    #[tokio::test]
    async fn test_cancel_restores_input_and_unwinds_messages() {
        let transport = Arc::new(MockTransport {
            hang_query: true,
            ..Default::default()
        });
        let mut h = harness(ChatMode::AskBuddy, transport);

        h.session.input = "  check Sobha One availability ".to_string();
        h.session.send_current_input();
        // Let the turn reach the awaiting-query phase.
        pump_until(&mut h, |s| s.conversation_id().is_some()).await;
        assert!(h.session.is_loading());

        assert!(h.session.cancel_current());
        assert!(h.session.messages.is_empty());
        assert_eq!(h.session.input, "  check Sobha One availability ");
        assert!(!h.session.is_loading());
        // Cancelling again is a no-op.
        assert!(!h.session.cancel_current());
    }

    #[tokio::test]
    async fn test_fast_completion_skips_thinking_stages() {
        let transport = Arc::new(MockTransport::with_reply("Hello world"));
        let mut h = harness(ChatMode::AskBuddy, transport);
        // Stages far beyond the test horizon: none should ever render.
        h.session.set_timing(SessionTiming {
            thinking_stages: vec![(Duration::from_secs(5), "stage one".to_string())],
            reveal_interval: Duration::from_millis(1),
        });

        h.session.send_message("quick one");
        pump_until_idle(&mut h).await;

        let answer = h.session.messages.last().unwrap();
        assert_eq!(answer.content, "Hello world");
        assert!(!answer.pending);
        assert!(!answer.typing);

        // A stale stage timer firing after completion must not touch content.
        let stale_turn = 1;
        h.session.apply(SessionEvent::ThinkingStage {
            turn: stale_turn,
            text: "stage one".to_string(),
        });
        assert_eq!(h.session.messages.last().unwrap().content, "Hello world");
    }

    #[tokio::test]
    async fn test_thinking_stage_renders_while_query_is_slow() {
        let transport = Arc::new(MockTransport {
            query_delay: Some(Duration::from_millis(100)),
            reply_body: Mutex::new("done".to_string()),
            ..Default::default()
        });
        let mut h = harness(ChatMode::AskBuddy, transport);

        h.session.send_message("slow one");
        let mut saw_stage = false;
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.session.is_loading() {
                let event = h.rx.recv().await.expect("event channel closed");
                let is_stage = matches!(event, SessionEvent::ThinkingStage { .. });
                h.session.apply(event);
                if is_stage {
                    saw_stage = true;
                    let placeholder = h.session.messages.last().unwrap();
                    assert!(placeholder.pending);
                    assert_eq!(placeholder.content, "stage one");
                }
            }
        })
        .await
        .unwrap();

        assert!(saw_stage);
        assert_eq!(h.session.messages.last().unwrap().content, "done");
    }

    #[tokio::test]
    async fn test_typed_reveal_is_complete_and_attaches_images() {
        let body = "Here are results:\nIMAGE_URL: https://a/1.png\nMore text\nIMAGE_URL: https://a/2.png";
        let transport = Arc::new(MockTransport::with_reply(body));
        let mut h = harness(ChatMode::AskBuddy, transport);

        h.session.send_message("show me pictures");
        pump_until_idle(&mut h).await;

        let answer = h.session.messages.last().unwrap();
        assert_eq!(answer.content, "Here are results:\nMore text");
        assert_eq!(
            answer.images,
            vec!["https://a/1.png".to_string(), "https://a/2.png".to_string()]
        );
        assert!(!answer.typing);
        assert_eq!(answer.image_placeholder_count, 0);
    }

    #[tokio::test]
    async fn test_json_object_reply_is_decoded() {
        let transport = Arc::new(MockTransport::with_reply(
            r#"{"result": "three units available", "images": ["https://x/u.png"]}"#,
        ));
        let mut h = harness(ChatMode::AskBuddy, transport);

        h.session.send_message("availability?");
        pump_until_idle(&mut h).await;

        let answer = h.session.messages.last().unwrap();
        assert_eq!(answer.content, "three units available");
        assert_eq!(answer.images, vec!["https://x/u.png".to_string()]);
    }

    #[tokio::test]
    async fn test_create_failure_shows_session_expired() {
        let transport = Arc::new(MockTransport {
            fail_create: true,
            ..Default::default()
        });
        let mut h = harness(ChatMode::AskBuddy, transport);

        h.session.send_message("hello");
        pump_until_idle(&mut h).await;

        assert_eq!(h.session.messages.len(), 2);
        let answer = &h.session.messages[1];
        assert!(!answer.pending);
        assert!(answer.content.contains("session has ended"));
        assert_eq!(
            h.session.take_notice(),
            Some("Failed to initialize chat".to_string())
        );
        assert!(h.session.conversation_id().is_none());
    }

    #[tokio::test]
    async fn test_conversation_bootstrap_updates_location_and_store() {
        let transport = Arc::new(MockTransport::with_reply("sure"));
        let mut h = harness(ChatMode::AskBuddy, transport.clone());

        h.session.send_message("first message");
        pump_until_idle(&mut h).await;

        assert_eq!(h.session.conversation_id(), Some("ask-buddy-chat-1"));
        assert_eq!(
            h.router.query_param(HISTORY_PARAM),
            Some("ask-buddy-chat-1".to_string())
        );
        assert_eq!(
            h.store.get(ChatMode::AskBuddy),
            Some("ask-buddy-chat-1".to_string())
        );

        // The controller's own location update must not trigger hydration.
        h.session.sync_route();
        assert!(!h.session.is_loading_history());
        assert!(!transport.calls().iter().any(|c| c.starts_with("get:")));

        // The second turn reuses the conversation: no second create call.
        h.session.send_message("follow up");
        pump_until_idle(&mut h).await;
        let creates = transport
            .calls()
            .iter()
            .filter(|c| c.starts_with("create:"))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_query_error_replaces_placeholder_and_surfaces_notice() {
        let transport = Arc::new(MockTransport {
            fail_create: false,
            ..Default::default()
        });
        // Force the query to fail by pointing at a transport whose body is
        // fine but whose get path is irrelevant; use a dedicated mock.
        struct FailingQuery;
        #[async_trait]
        impl ChatTransport for FailingQuery {
            async fn create_chat(
                &self,
                _mode: ChatMode,
                _user_id: &str,
                _first_message: OutgoingMessage,
            ) -> Result<CreatedChat, TransportError> {
                Ok(CreatedChat {
                    chat_id: "c1".to_string(),
                    user_id: None,
                })
            }
            async fn run_query(
                &self,
                _mode: ChatMode,
                _request: QueryRequest,
            ) -> Result<String, TransportError> {
                Err(TransportError::Status { status: 500 })
            }
            async fn get_chat(
                &self,
                _mode: ChatMode,
                _chat_id: &str,
            ) -> Result<FetchedChat, TransportError> {
                Err(TransportError::NotFound)
            }
            async fn list_chats(
                &self,
                _mode: ChatMode,
                _user_id: &str,
            ) -> Result<Vec<crate::transport::ChatSummary>, TransportError> {
                Ok(Vec::new())
            }
        }
        drop(transport);

        let dir = TempDir::new().unwrap();
        let store = LastChatStore::with_path(dir.path().join("last_chats.json"));
        let router = Router::new("/ask-buddy");
        let (tx, rx) = mpsc::unbounded_channel();
        let session = ChatSession::new(
            ChatMode::AskBuddy,
            "agent-1".to_string(),
            Arc::new(FailingQuery),
            store.clone(),
            router.clone(),
            EventBus::new(),
            tx,
        );
        let mut h = Harness {
            session,
            rx,
            router,
            store,
            _dir: dir,
        };

        h.session.send_message("break please");
        pump_until_idle(&mut h).await;

        let answer = h.session.messages.last().unwrap();
        assert_eq!(answer.content, GENERIC_ERROR_TEXT);
        assert!(h.session.take_notice().is_some());
        // Conversation identity survives a failed turn.
        assert_eq!(h.session.conversation_id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_single_message_history_synthesizes_interrupted_note() {
        let transport = Arc::new(MockTransport::default());
        transport.insert_chat("c1", fetched(vec![("user", "only question")]));
        let mut h = harness(ChatMode::AskBuddy, transport);

        h.router.replace_query_param(HISTORY_PARAM, Some("c1"));
        h.session.sync_route();
        pump_until_idle(&mut h).await;

        assert_eq!(h.session.messages.len(), 2);
        assert_eq!(h.session.messages[0].content, "only question");
        let synthesized = &h.session.messages[1];
        assert_eq!(synthesized.role, crate::message::ChatRole::Assistant);
        assert!(synthesized.content.contains("only the first message was saved"));
        assert_eq!(h.session.conversation_id(), Some("c1"));
        assert_eq!(h.store.get(ChatMode::AskBuddy), Some("c1".to_string()));
    }

    #[tokio::test]
    async fn test_history_roles_and_images_are_normalized() {
        let transport = Arc::new(MockTransport::default());
        transport.insert_chat(
            "c1",
            fetched(vec![
                ("user", "show towers"),
                ("bot", "Sure:\nIMAGE_URL: https://a/t.png\nTwo towers"),
            ]),
        );
        let mut h = harness(ChatMode::AskBuddy, transport);

        h.router.replace_query_param(HISTORY_PARAM, Some("c1"));
        h.session.sync_route();
        pump_until_idle(&mut h).await;

        let reply = &h.session.messages[1];
        assert_eq!(reply.role, crate::message::ChatRole::Assistant);
        assert_eq!(reply.content, "Sure:\nTwo towers");
        assert_eq!(reply.images, vec!["https://a/t.png".to_string()]);
    }

    #[tokio::test]
    async fn test_not_found_history_cleans_url_and_identity() {
        let transport = Arc::new(MockTransport::default());
        let mut h = harness(ChatMode::AskBuddy, transport);

        h.router.replace_query_param("tab", Some("insights"));
        h.router.replace_query_param(HISTORY_PARAM, Some("missing"));
        h.session.sync_route();
        pump_until_idle(&mut h).await;

        assert!(h.session.messages.is_empty());
        assert!(h.session.conversation_id().is_none());
        assert_eq!(h.router.query_param(HISTORY_PARAM), None);
        assert_eq!(h.router.query_param("tab"), Some("insights".to_string()));
        assert_eq!(h.session.take_notice(), Some(NOT_FOUND_NOTICE.to_string()));
    }

    #[tokio::test]
    async fn test_new_chat_reset_clears_store_and_location() {
        let transport = Arc::new(MockTransport::with_reply("noted"));
        let mut h = harness(ChatMode::AskBuddy, transport);

        h.session.send_message("hello");
        pump_until_idle(&mut h).await;
        assert!(h.session.conversation_id().is_some());

        h.session.reset_new_chat();
        assert!(h.session.messages.is_empty());
        assert!(h.session.conversation_id().is_none());
        assert_eq!(h.store.get(ChatMode::AskBuddy), None);
        assert_eq!(h.router.query_param(HISTORY_PARAM), None);
    }

    #[tokio::test]
    async fn test_mode_isolation_of_store_slots() {
        let dir = TempDir::new().unwrap();
        let store = LastChatStore::with_path(dir.path().join("last_chats.json"));
        let transport = Arc::new(MockTransport::with_reply("ok"));
        let bus = EventBus::new();

        let (ask_tx, ask_rx) = mpsc::unbounded_channel();
        let ask = ChatSession::new(
            ChatMode::AskBuddy,
            "agent-1".to_string(),
            transport.clone(),
            store.clone(),
            Router::new("/ask-buddy"),
            bus.clone(),
            ask_tx,
        );
        let (mt_tx, mt_rx) = mpsc::unbounded_channel();
        let market = ChatSession::new(
            ChatMode::MarketTransaction,
            "agent-1".to_string(),
            transport.clone(),
            store.clone(),
            Router::new("/market-transaction"),
            bus,
            mt_tx,
        );

        let mut ask_h = Harness {
            session: ask,
            rx: ask_rx,
            router: Router::new("/unused"),
            store: store.clone(),
            _dir: dir,
        };
        ask_h.session.send_message("ask question");
        pump_until_idle(&mut ask_h).await;

        assert_eq!(
            store.get(ChatMode::AskBuddy),
            Some("ask-buddy-chat-1".to_string())
        );
        assert_eq!(store.get(ChatMode::MarketTransaction), None);

        let tmp = TempDir::new().unwrap();
        let mut mt_h = Harness {
            session: market,
            rx: mt_rx,
            router: Router::new("/unused"),
            store: store.clone(),
            _dir: tmp,
        };
        mt_h.session.send_message("market question");
        pump_until_idle(&mut mt_h).await;

        assert_eq!(
            store.get(ChatMode::MarketTransaction),
            Some("market-transaction-chat-1".to_string())
        );
        // The ask-buddy slot is untouched by market-transaction traffic.
        assert_eq!(
            store.get(ChatMode::AskBuddy),
            Some("ask-buddy-chat-1".to_string())
        );
        // And all market calls went to market endpoints.
        assert!(transport
            .calls()
            .iter()
            .filter(|c| c.contains("market-transaction"))
            .all(|c| c.ends_with("market-transaction")));
    }

    #[tokio::test]
    async fn test_stale_hydration_result_is_discarded() {
        let transport = Arc::new(MockTransport::default());
        transport.insert_chat("old", fetched(vec![("user", "old"), ("bot", "old reply")]));
        let mut h = harness(ChatMode::AskBuddy, transport);

        h.router.replace_query_param(HISTORY_PARAM, Some("old"));
        h.session.sync_route();
        // Before the fetch lands, the user starts a brand-new chat.
        h.session.reset_new_chat();

        // Deliver whatever the superseded fetch produced; it must not
        // resurrect the old conversation.
        while let Ok(event) = h.rx.try_recv() {
            h.session.apply(event);
        }
        assert!(h.session.messages.is_empty());
        assert!(h.session.conversation_id().is_none());
    }
}
