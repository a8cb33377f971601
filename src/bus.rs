use tokio::sync::broadcast;

use crate::message::ChatMode;

/// Cross-component signals. The session controller emits `ChatUpdated` when
/// a conversation is created or a turn completes, and both emits and reacts
/// to mode-tagged `NewChat` resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSignal {
    NewChat(ChatMode),
    ChatUpdated,
}

/// Fire-and-forget pub/sub between the chat sessions and sibling UI such as
/// the history sidebar.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChatSignal>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn emit(&self, signal: ChatSignal) {
        // No receivers is fine; signals are advisory.
        let _ = self.tx.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatSignal> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(ChatSignal::NewChat(ChatMode::AskBuddy));
        assert_eq!(rx.recv().await.unwrap(), ChatSignal::NewChat(ChatMode::AskBuddy));
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(ChatSignal::ChatUpdated);
    }
}
