//! Client settings stored in settings.toml

use crate::PathManager;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_API_BASE: &str = "http://localhost:8000";
pub const DEFAULT_MODEL: &str = "openrouter/x-ai/grok-4.1-fast";

/// Connection and generation defaults for the chat client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the chat backend, without trailing slash
    pub api_base: String,
    /// Project every conversation is created under
    pub project_code: Option<String>,
    /// Bearer token sent with every request
    pub token: Option<String>,
    pub model: String,
    /// Credential used to call the model provider
    pub credential_code: Option<String>,
    pub knowledge_codes: Vec<String>,
    pub temperature: f64,
    pub top_p: f64,
    /// Number of prior turns the backend keeps in context
    pub window_size: u32,
    pub streaming: bool,
    pub stateful: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            project_code: None,
            token: None,
            model: DEFAULT_MODEL.to_string(),
            credential_code: None,
            knowledge_codes: Vec::new(),
            temperature: 0.7,
            top_p: 1.0,
            window_size: 20,
            streaming: true,
            stateful: true,
        }
    }
}

impl Settings {
    /// Load settings from the settings file, or defaults if not found, then apply env overrides
    pub fn load() -> Self {
        let mut settings = PathManager::settings_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        settings.apply_env();
        settings
    }

    /// Settings stored at `path`; defaults when missing or unreadable
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        toml::from_str(&content).unwrap_or_default()
    }

    pub fn save(&self) -> Result<(), String> {
        let path = PathManager::settings_path().ok_or("Could not determine settings path")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config dir: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;
        fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))?;
        Ok(())
    }

    /// Override connection settings from `CHATSTREAM_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        if let Some(api_base) = var("CHATSTREAM_API_BASE") {
            self.api_base = api_base.trim_end_matches('/').to_string();
        }
        if let Some(project) = var("CHATSTREAM_PROJECT") {
            self.project_code = Some(project);
        }
        if let Some(token) = var("CHATSTREAM_TOKEN") {
            self.token = Some(token);
        }
        if let Some(model) = var("CHATSTREAM_MODEL") {
            self.model = model;
        }
    }
}
