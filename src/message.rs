use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde_json::Value;

/// Which conversation surface a session belongs to. Each mode has its own
/// backend endpoints and its own last-chat slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatMode {
    AskBuddy,
    MarketTransaction,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::AskBuddy => "ask-buddy",
            ChatMode::MarketTransaction => "market-transaction",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ChatMode::AskBuddy => "Ask Buddy",
            ChatMode::MarketTransaction => "Market Transaction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

/// One entry in the conversation thread.
///
/// At most one message in a thread may have `pending` or `typing` set:
/// a single turn is in flight per conversation.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    pub time: String,
    pub images: Vec<String>,
    /// Placeholder is showing staged "thinking" copy, no real answer yet.
    pub pending: bool,
    /// Real answer is being progressively revealed.
    pub typing: bool,
    /// Tiles to render while typing and images are not attached yet.
    pub image_placeholder_count: usize,
}

impl ChatMessage {
    pub fn user(id: String, content: String, time: String) -> Self {
        Self {
            id,
            role: ChatRole::User,
            content,
            time,
            images: Vec::new(),
            pending: false,
            typing: false,
            image_placeholder_count: 0,
        }
    }

    pub fn assistant(id: String, content: String, time: String) -> Self {
        Self {
            id,
            role: ChatRole::Assistant,
            content,
            time,
            images: Vec::new(),
            pending: false,
            typing: false,
            image_placeholder_count: 0,
        }
    }

    pub fn placeholder(id: String, intro: String, time: String) -> Self {
        let mut msg = Self::assistant(id, intro, time);
        msg.pending = true;
        msg
    }
}

/// Fold any role string meaning "assistant"/"bot" into assistant, anything
/// else into user.
pub fn normalize_role(raw: &str) -> ChatRole {
    match raw.to_lowercase().as_str() {
        "assistant" | "bot" => ChatRole::Assistant,
        _ => ChatRole::User,
    }
}

/// Extract `IMAGE_URL: <url>` lines (one per line, case-insensitive) from raw
/// text. Returns the display text with those lines stripped and the URLs in
/// their original order.
pub fn parse_image_urls(raw: &str) -> (String, Vec<String>) {
    static IMAGE_URL_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = IMAGE_URL_RE
        .get_or_init(|| Regex::new(r"(?i)^\s*IMAGE_URL:\s*(\S+)\s*$").expect("valid pattern"));

    let mut images = Vec::new();
    for line in raw.lines() {
        if let Some(caps) = re.captures(line) {
            images.push(caps[1].to_string());
        }
    }

    if images.is_empty() {
        return (raw.to_string(), images);
    }

    let cleaned = raw
        .lines()
        .filter(|line| !re.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();

    (cleaned, images)
}

/// A run-query payload decoded into text plus any explicit image list.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyPayload {
    pub text: String,
    pub images: Vec<String>,
}

/// Decode a run-query response body. The backend answers with either a raw
/// string, a JSON-encoded string, or a JSON object carrying the text under
/// `result`, `response`, or `message` and optionally an `images` array.
/// Anything that fails to decode as JSON is kept as the literal string; that
/// fallback is load-bearing compatibility behavior, not an error.
pub fn parse_reply_payload(body: &str) -> ReplyPayload {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::String(s)) => ReplyPayload {
            text: s,
            images: Vec::new(),
        },
        Ok(Value::Object(map)) => {
            let text = ["result", "response", "message"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .unwrap_or_default()
                .to_string();
            let images = map
                .get("images")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            ReplyPayload { text, images }
        }
        _ => ReplyPayload {
            text: body.to_string(),
            images: Vec::new(),
        },
    }
}

/// Split text into alternating word/whitespace tokens so a progressive
/// reveal can rejoin them without losing spacing.
pub fn reveal_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_whitespace: Option<bool> = None;

    for ch in text.chars() {
        let ws = ch.is_whitespace();
        if in_whitespace != Some(ws) && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        in_whitespace = Some(ws);
        current.push(ch);
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Locale-style hour:minute display time, e.g. "3:07 PM".
pub fn clock_now() -> String {
    Local::now().format("%-I:%M %p").to_string()
}

/// Display time for a server timestamp (RFC 3339). Falls back to the current
/// time when the timestamp is missing or unparseable.
pub fn clock_from_timestamp(timestamp: Option<&str>) -> String {
    timestamp
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.with_timezone(&Local).format("%-I:%M %p").to_string())
        .unwrap_or_else(clock_now)
}

/// RFC 3339 timestamp for outgoing messages.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_urls_round_trip() {
        let raw = "Here are results:\nIMAGE_URL: https://a/1.png\nMore text\nIMAGE_URL: https://a/2.png";
        let (text, images) = parse_image_urls(raw);
        assert_eq!(text, "Here are results:\nMore text");
        assert_eq!(
            images,
            vec!["https://a/1.png".to_string(), "https://a/2.png".to_string()]
        );
    }

    #[test]
    fn test_parse_image_urls_case_insensitive_and_padded() {
        let raw = "Top picks\n  image_url:   https://x/pic.jpg  \nDone";
        let (text, images) = parse_image_urls(raw);
        assert_eq!(text, "Top picks\nDone");
        assert_eq!(images, vec!["https://x/pic.jpg".to_string()]);
    }

    #[test]
    fn test_parse_image_urls_no_matches_keeps_text_verbatim() {
        let raw = "plain text\n\nwith blank lines\n";
        let (text, images) = parse_image_urls(raw);
        assert_eq!(text, raw);
        assert!(images.is_empty());
    }

    #[test]
    fn test_parse_reply_payload_object() {
        let body = r#"{"result": "two bedrooms available", "images": ["https://a/1.png"]}"#;
        let payload = parse_reply_payload(body);
        assert_eq!(payload.text, "two bedrooms available");
        assert_eq!(payload.images, vec!["https://a/1.png".to_string()]);
    }

    #[test]
    fn test_parse_reply_payload_object_fallback_keys() {
        let payload = parse_reply_payload(r#"{"response": "from response key"}"#);
        assert_eq!(payload.text, "from response key");
        let payload = parse_reply_payload(r#"{"message": "from message key"}"#);
        assert_eq!(payload.text, "from message key");
    }

    #[test]
    fn test_parse_reply_payload_json_string() {
        let payload = parse_reply_payload(r#""quoted answer""#);
        assert_eq!(payload.text, "quoted answer");
        assert!(payload.images.is_empty());
    }

    #[test]
    fn test_parse_reply_payload_literal_fallback() {
        let payload = parse_reply_payload("not json at all: {nope");
        assert_eq!(payload.text, "not json at all: {nope");
    }

    #[test]
    fn test_reveal_tokens_preserve_whitespace() {
        let text = "hello  world\nnext";
        let tokens = reveal_tokens(text);
        assert_eq!(tokens, vec!["hello", "  ", "world", "\n", "next"]);
        assert_eq!(tokens.concat(), text);
    }

    #[test]
    fn test_reveal_tokens_empty() {
        assert!(reveal_tokens("").is_empty());
    }

    #[test]
    fn test_normalize_role() {
        assert_eq!(normalize_role("assistant"), ChatRole::Assistant);
        assert_eq!(normalize_role("Bot"), ChatRole::Assistant);
        assert_eq!(normalize_role("user"), ChatRole::User);
        assert_eq!(normalize_role("anything"), ChatRole::User);
    }

    #[test]
    fn test_clock_from_timestamp_fallback() {
        // Unparseable timestamps fall back to the current clock, which always
        // renders a non-empty hour:minute string.
        let shown = clock_from_timestamp(Some("not-a-timestamp"));
        assert!(shown.contains(':'));
    }
}
