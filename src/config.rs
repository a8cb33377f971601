use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use anyhow::{Result, anyhow};

const DEFAULT_BASE_URL: &str = "https://localhost:5001";
const DEFAULT_PROJECT_ID: &str = "ea365bd5-afbb-48d3-a345-e9255655c841";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub api_base_url: Option<String>,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub channel: Option<String>,
}

impl Config {
    pub fn new() -> Self {
        Self {
            api_base_url: None,
            user_id: None,
            project_id: None,
            channel: None,
        }
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if !config_path.exists() {
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&config_content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(&config_path, config_content)?;
        Ok(())
    }

    /// Backend base URL. Environment variable wins over the config file.
    pub fn base_url(&self) -> String {
        std::env::var("BUDDY_API_URL")
            .ok()
            .or_else(|| self.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    /// Authenticated user id. Environment variable wins over the config file.
    pub fn user_id(&self) -> Option<String> {
        std::env::var("BUDDY_USER_ID")
            .ok()
            .or_else(|| self.user_id.clone())
    }

    pub fn project_id(&self) -> String {
        self.project_id
            .clone()
            .unwrap_or_else(|| DEFAULT_PROJECT_ID.to_string())
    }

    pub fn channel(&self) -> String {
        self.channel.clone().unwrap_or_else(|| "cli".to_string())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("buddy").join("config.json"))
    }
}
