use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::ChatMode;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("chat not found")]
    NotFound,
    /// The request was aborted by the caller. Not a failure: callers unwind
    /// silently instead of surfacing it.
    #[error("request cancelled")]
    Cancelled,
    #[error("chat creation returned no chat id")]
    NoChatId,
    #[error("request failed with status {status}")]
    Status { status: u16 },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl TransportError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// First message sent when a conversation is created.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub role: String,
    pub text: String,
    pub timestamp: String,
}

/// Result of chat creation. The backend may hand back a corrected user id
/// alongside the new chat id; later queries must use it when present.
#[derive(Debug, Clone)]
pub struct CreatedChat {
    pub chat_id: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub chat_id: String,
    pub user_id: String,
    pub query: String,
    pub query_id: String,
    pub session_id: String,
    pub market_name: Option<String>,
    pub transaction_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRecordMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: String,
    #[serde(default, alias = "content")]
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchedChat {
    #[serde(default, alias = "_id")]
    pub id: Option<String>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatRecordMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatSummary {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatRecordMessage>,
}

impl ChatSummary {
    /// Short label for the history sidebar: explicit title, else the first
    /// message text, else the id.
    pub fn preview(&self) -> String {
        let text = self
            .title
            .clone()
            .or_else(|| {
                self.messages
                    .iter()
                    .find(|m| !m.text.trim().is_empty())
                    .map(|m| m.text.trim().to_string())
            })
            .unwrap_or_else(|| self.id.clone());

        let mut preview: String = text.chars().take(48).collect();
        if preview.len() < text.len() {
            preview.push('…');
        }
        preview
    }
}

/// HTTP calls the chat session controller depends on. Implementations are
/// cheap to clone behind an `Arc` and are called from spawned tasks.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn create_chat(
        &self,
        mode: ChatMode,
        user_id: &str,
        first_message: OutgoingMessage,
    ) -> Result<CreatedChat, TransportError>;

    async fn run_query(
        &self,
        mode: ChatMode,
        request: QueryRequest,
    ) -> Result<String, TransportError>;

    async fn get_chat(&self, mode: ChatMode, chat_id: &str) -> Result<FetchedChat, TransportError>;

    async fn list_chats(
        &self,
        mode: ChatMode,
        user_id: &str,
    ) -> Result<Vec<ChatSummary>, TransportError>;
}

#[derive(Debug, Clone, Serialize)]
struct CreateChatBody {
    project_id: String,
    channel: String,
    mode: String,
    messages: Vec<OutgoingMessage>,
}

pub struct HttpTransport {
    client: Client,
    base_url: String,
    project_id: String,
    channel: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, project_id: &str, channel: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            channel: channel.to_string(),
        }
    }

    fn chats_segment(mode: ChatMode) -> &'static str {
        match mode {
            ChatMode::AskBuddy => "chats",
            ChatMode::MarketTransaction => "mt_chats",
        }
    }

    fn query_path(mode: ChatMode) -> &'static str {
        match mode {
            ChatMode::AskBuddy => "/api/run_user_query/query",
            ChatMode::MarketTransaction => "/api/market_transaction/query",
        }
    }

    fn check_status(status: StatusCode) -> Result<(), TransportError> {
        if status == StatusCode::NOT_FOUND {
            return Err(TransportError::NotFound);
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// The create-chat endpoint answers with either the chat id as a bare string
/// or an object carrying `_id` (and sometimes a corrected `user_id`).
fn parse_created(raw: &Value) -> Result<CreatedChat, TransportError> {
    let chat_id = match raw {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("_id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };
    let user_id = raw
        .as_object()
        .and_then(|map| map.get("user_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    match chat_id {
        Some(chat_id) => Ok(CreatedChat { chat_id, user_id }),
        None => Err(TransportError::NoChatId),
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn create_chat(
        &self,
        mode: ChatMode,
        user_id: &str,
        first_message: OutgoingMessage,
    ) -> Result<CreatedChat, TransportError> {
        let url = format!(
            "{}/api/buddy/{}/{}",
            self.base_url,
            user_id,
            Self::chats_segment(mode)
        );
        let body = CreateChatBody {
            project_id: self.project_id.clone(),
            channel: self.channel.clone(),
            mode: mode.as_str().to_string(),
            messages: vec![first_message],
        };

        let response = self.client.post(&url).json(&body).send().await?;
        Self::check_status(response.status())?;

        let raw: Value = response.json().await?;
        parse_created(&raw)
    }

    async fn run_query(
        &self,
        mode: ChatMode,
        request: QueryRequest,
    ) -> Result<String, TransportError> {
        let url = format!("{}{}", self.base_url, Self::query_path(mode));

        let mut form: Vec<(&str, String)> = vec![
            ("chat_id", request.chat_id),
            ("user_id", request.user_id),
            ("query", request.query),
            ("query_id", request.query_id),
            ("sessionId", request.session_id),
        ];
        if mode == ChatMode::MarketTransaction {
            form.push(("market_name", request.market_name.unwrap_or_default()));
            form.push((
                "transaction_type",
                request.transaction_type.unwrap_or_default(),
            ));
        }

        let response = self.client.post(&url).form(&form).send().await?;
        Self::check_status(response.status())?;

        Ok(response.text().await?)
    }

    async fn get_chat(&self, mode: ChatMode, chat_id: &str) -> Result<FetchedChat, TransportError> {
        let url = format!(
            "{}/api/buddy/{}/{}",
            self.base_url,
            Self::chats_segment(mode),
            chat_id
        );

        let response = self.client.get(&url).send().await?;
        Self::check_status(response.status())?;

        Ok(response.json().await?)
    }

    async fn list_chats(
        &self,
        mode: ChatMode,
        user_id: &str,
    ) -> Result<Vec<ChatSummary>, TransportError> {
        let url = format!(
            "{}/api/buddy/{}/{}",
            self.base_url,
            user_id,
            Self::chats_segment(mode)
        );

        // Cache-busting timestamp, same as the web client.
        let response = self
            .client
            .get(&url)
            .query(&[("t", chrono::Utc::now().timestamp_millis())])
            .send()
            .await?;
        Self::check_status(response.status())?;

        Ok(response.json().await?)
    }
}
