use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::message::ChatMode;

/// Durable last-chat-id slots, one per chat mode. A weak back-reference used
/// only for "resume last chat" navigation; the session controller is the
/// authority on conversation identity.
#[derive(Debug, Clone)]
pub struct LastChatStore {
    path: PathBuf,
}

impl LastChatStore {
    pub fn new() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(Self {
            path: config_dir.join("buddy").join("last_chats.json"),
        })
    }

    /// Store backed by an explicit file, used by tests.
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn get(&self, mode: ChatMode) -> Option<String> {
        self.read_slots().remove(mode.as_str())
    }

    pub fn set(&self, mode: ChatMode, id: Option<&str>) -> Result<()> {
        let mut slots = self.read_slots();
        match id {
            Some(id) => {
                slots.insert(mode.as_str().to_string(), id.to_string());
            }
            None => {
                slots.remove(mode.as_str());
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&slots)?)?;
        Ok(())
    }

    fn read_slots(&self) -> BTreeMap<String, String> {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, LastChatStore) {
        let dir = TempDir::new().unwrap();
        let store = LastChatStore::with_path(dir.path().join("last_chats.json"));
        (dir, store)
    }

    #[test]
    fn test_round_trip() {
        let (_dir, store) = temp_store();
        assert_eq!(store.get(ChatMode::AskBuddy), None);

        store.set(ChatMode::AskBuddy, Some("chat-1")).unwrap();
        assert_eq!(store.get(ChatMode::AskBuddy), Some("chat-1".to_string()));

        store.set(ChatMode::AskBuddy, None).unwrap();
        assert_eq!(store.get(ChatMode::AskBuddy), None);
    }

    #[test]
    fn test_modes_are_namespaced() {
        let (_dir, store) = temp_store();
        store.set(ChatMode::AskBuddy, Some("ask-1")).unwrap();
        store.set(ChatMode::MarketTransaction, Some("mt-1")).unwrap();

        assert_eq!(store.get(ChatMode::AskBuddy), Some("ask-1".to_string()));
        assert_eq!(
            store.get(ChatMode::MarketTransaction),
            Some("mt-1".to_string())
        );

        store.set(ChatMode::MarketTransaction, None).unwrap();
        assert_eq!(store.get(ChatMode::AskBuddy), Some("ask-1".to_string()));
        assert_eq!(store.get(ChatMode::MarketTransaction), None);
    }

    #[test]
    fn test_survives_reopen() {
        let (dir, store) = temp_store();
        store.set(ChatMode::AskBuddy, Some("persisted")).unwrap();

        let reopened = LastChatStore::with_path(dir.path().join("last_chats.json"));
        assert_eq!(reopened.get(ChatMode::AskBuddy), Some("persisted".to_string()));
    }
}
