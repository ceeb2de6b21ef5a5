use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level flowforge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sandbox: Option<SandboxConfig>,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of finished runs kept in history, most recent first.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Delay applied by the fallback strategy for unknown node kinds.
    #[serde(default = "default_simulated_delay_ms")]
    pub simulated_delay_ms: u64,
    /// Default agent iteration bound when a node sets none.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Default memory window when a memory node sets none.
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            simulated_delay_ms: default_simulated_delay_ms(),
            max_iterations: default_max_iterations(),
            memory_window: default_memory_window(),
        }
    }
}

fn default_history_limit() -> usize { 50 }
fn default_simulated_delay_ms() -> u64 { 500 }
fn default_max_iterations() -> usize { 5 }
fn default_memory_window() -> usize { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Model used by embedding nodes that name none.
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// Model used by vision nodes that name none.
    #[serde(default)]
    pub vision_model: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.7 }

/// Retry configuration for model requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

impl ModelConfig {
    /// Base URL for the provider's OpenAI-compatible API.
    pub fn resolved_base_url(&self) -> &str {
        if let Some(url) = self.base_url.as_deref() {
            return url.trim_end_matches('/');
        }
        match self.provider.as_str() {
            "ollama" => "http://localhost:11434/v1",
            "groq" => "https://api.groq.com/openai/v1",
            "openrouter" => "https://openrouter.ai/api/v1",
            "mistral" => "https://api.mistral.ai/v1",
            _ => "https://api.openai.com/v1",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    /// Response bodies longer than this are truncated.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_http_timeout() -> u64 { 30 }
fn default_max_body_bytes() -> usize { 1_048_576 }

/// Subprocess runner for code-tool nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_command")]
    pub command: String,
    #[serde(default = "default_sandbox_args")]
    pub args: Vec<String>,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: default_sandbox_command(),
            args: default_sandbox_args(),
            timeout_secs: default_sandbox_timeout(),
        }
    }
}

fn default_sandbox_command() -> String { "node".to_string() }
fn default_sandbox_args() -> Vec<String> { vec!["-e".to_string()] }
fn default_sandbox_timeout() -> u64 { 10 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// SQLite database for agent session memory. In-memory when unset.
    #[serde(default)]
    pub db_path: Option<String>,
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.flowforge/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = + node status, 3 = + agent iterations (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        match self.log_dir.as_deref() {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.flowforge/logs"),
        }
    }
}

impl MemoryConfig {
    pub fn resolved_db_path(&self) -> Option<PathBuf> {
        self.db_path.as_deref().map(expand_home)
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns. Unset variables are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &after[..end];
        match std::env::var(name) {
            Ok(val) => out.push_str(&val),
            Err(_) => out.push_str(&rest[start..start + 3 + end]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
