use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const MIN_STREAM_DELAY: f64 = 0.001;
pub const MAX_STREAM_DELAY: f64 = 0.1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    Openai,
    Deepseek,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [ProviderKind::Ollama, ProviderKind::Openai, ProviderKind::Deepseek];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Openai => "openai",
            ProviderKind::Deepseek => "deepseek",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(ProviderKind::Ollama),
            "openai" => Some(ProviderKind::Openai),
            "deepseek" => Some(ProviderKind::Deepseek),
            _ => None,
        }
    }

    pub fn requires_api_key(self) -> bool {
        !matches!(self, ProviderKind::Ollama)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub default_model: String,
    pub api_key_env: String,
    pub api_key: Option<String>,
}

/// Provider section as written by the user. Missing fields fall back to the
/// defaults of the same provider.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProviderSection {
    base_url: Option<String>,
    default_model: Option<String>,
    api_key_env: Option<String>,
    api_key: Option<String>,
}

impl ProviderSection {
    fn over(self, defaults: ProviderConfig) -> ProviderConfig {
        ProviderConfig {
            base_url: self.base_url.unwrap_or(defaults.base_url),
            default_model: self.default_model.unwrap_or(defaults.default_model),
            api_key_env: self.api_key_env.unwrap_or(defaults.api_key_env),
            api_key: self.api_key.or(defaults.api_key),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProviderSections {
    ollama: ProviderSection,
    openai: ProviderSection,
    deepseek: ProviderSection,
}

impl From<ProviderSections> for Providers {
    fn from(sections: ProviderSections) -> Self {
        let defaults = Providers::default();
        Self {
            ollama: sections.ollama.over(defaults.ollama),
            openai: sections.openai.over(defaults.openai),
            deepseek: sections.deepseek.over(defaults.deepseek),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ProviderSections")]
pub struct Providers {
    pub ollama: ProviderConfig,
    pub openai: ProviderConfig,
    pub deepseek: ProviderConfig,
}

impl Default for Providers {
    fn default() -> Self {
        Self {
            ollama: ProviderConfig {
                base_url: "http://localhost:11434".to_string(),
                default_model: "llama3.1:8b".to_string(),
                api_key_env: String::new(),
                api_key: None,
            },
            openai: ProviderConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                default_model: "gpt-3.5-turbo".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                api_key: None,
            },
            deepseek: ProviderConfig {
                base_url: "https://api.deepseek.com/v1".to_string(),
                default_model: "deepseek-chat".to_string(),
                api_key_env: "DEEPSEEK_API_KEY".to_string(),
                api_key: None,
            },
        }
    }
}

impl Providers {
    pub fn get(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::Ollama => &self.ollama,
            ProviderKind::Openai => &self.openai,
            ProviderKind::Deepseek => &self.deepseek,
        }
    }

    pub fn get_mut(&mut self, kind: ProviderKind) -> &mut ProviderConfig {
        match kind {
            ProviderKind::Ollama => &mut self.ollama,
            ProviderKind::Openai => &mut self.openai,
            ProviderKind::Deepseek => &mut self.deepseek,
        }
    }
}

/// Runtime chat settings. Passed explicitly to the assistant and renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub streaming: bool,
    /// Seconds between printed characters when streaming.
    pub stream_delay: f64,
    pub temperature: f64,
    /// Previous exchanges included in each prompt.
    pub context_messages: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            streaming: true,
            stream_delay: 0.01,
            temperature: 0.3,
            context_messages: 3,
        }
    }
}

impl ChatSettings {
    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.stream_delay.clamp(0.0, MAX_STREAM_DELAY))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    pub max_file_size: u64,
    pub max_files_per_query: usize,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * 1024,
            max_files_per_query: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    /// Relative names are placed in the working root.
    pub file: String,
    pub max_entries: usize,
    pub autosave_every: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            file: ".codemate_history.json".to_string(),
            max_entries: 1000,
            autosave_every: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub timeout_secs: u64,
    pub stream_timeout_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            stream_timeout_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub active_provider: ProviderKind,
    /// Empty means the active provider's default model.
    #[serde(default)]
    pub active_model: String,
    pub system_prompt: String,
    pub chat: ChatSettings,
    pub files: FileSettings,
    pub history: HistorySettings,
    pub network: NetworkSettings,
    pub providers: Providers,
}

impl Default for Config {
    fn default() -> Self {
        let providers = Providers::default();
        Self {
            active_provider: ProviderKind::Ollama,
            active_model: providers.ollama.default_model.clone(),
            system_prompt: default_system_prompt(),
            chat: ChatSettings::default(),
            files: FileSettings::default(),
            history: HistorySettings::default(),
            network: NetworkSettings::default(),
            providers,
        }
    }
}

fn default_system_prompt() -> String {
    "You are an experienced programming assistant. Answer precisely, explain code \
     step by step when asked, and point out bugs, risks and concrete improvements \
     with short examples."
        .to_string()
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let mut cfg: Config =
            toml::from_str(&text).with_context(|| format!("Invalid config: {}", path.display()))?;
        cfg.normalize();
        Ok(cfg)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn history_path(&self, root: &Path) -> PathBuf {
        let file = Path::new(&self.history.file);
        if file.is_absolute() {
            file.to_path_buf()
        } else {
            root.join(file)
        }
    }

    fn normalize(&mut self) {
        if self.active_model.trim().is_empty() {
            self.active_model = self.providers.get(self.active_provider).default_model.clone();
        }
        if !(MIN_STREAM_DELAY..=MAX_STREAM_DELAY).contains(&self.chat.stream_delay) {
            self.chat.stream_delay = ChatSettings::default().stream_delay;
        }
        self.files.max_files_per_query = self.files.max_files_per_query.max(1);
    }
}

pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Cannot resolve home directory")?;
    Ok(home.join(".codemate"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn load_config_or_default() -> Result<Config> {
    let path = config_path()?;
    if !path.exists() {
        let cfg = Config::default();
        cfg.save_to_path(&path)?;
        return Ok(cfg);
    }
    Config::load_from_path(&path)
}

/// Environment variable first, then the stored key.
pub fn resolve_api_key(provider: &ProviderConfig) -> Option<String> {
    if !provider.api_key_env.is_empty()
        && let Ok(v) = env::var(&provider.api_key_env)
        && !v.trim().is_empty()
    {
        return Some(v);
    }
    provider
        .api_key
        .as_ref()
        .filter(|v| !v.trim().is_empty())
        .cloned()
}
