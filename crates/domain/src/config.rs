use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from a TOML file with
/// `serde(default)` filling in every field left unspecified.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a TOML file, failing on malformed TOML but
    /// filling in defaults for any key the file omits.
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::error::OrchestratorError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Load from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &std::path::Path) -> Self {
        Self::load(path).unwrap_or_default()
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

// ── Server ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_port() -> u16 {
    8787
}
fn default_host() -> String {
    "127.0.0.1".into()
}

// ── Observability ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub json_logs: bool,
    /// OTLP collector endpoint. When unset, traces stay local.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            otlp_endpoint: None,
        }
    }
}

// ── Webhook delivery ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_webhook_max_attempts")]
    pub max_attempts: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_webhook_timeout_secs(),
            max_attempts: default_webhook_max_attempts(),
        }
    }
}

fn default_webhook_timeout_secs() -> u64 {
    30
}
fn default_webhook_max_attempts() -> u32 {
    3
}

// ── Agents ───────────────────────────────────────────────────────────

/// `type ∈ {chat, external}` from the component spec's provider-selection
/// table: only `chat` drives the model loop; `external` POSTs the user
/// text to an external HTTP endpoint and returns immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentConfig {
    Chat(ChatAgentConfig),
    External { url: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatAgentConfig {
    pub provider: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub reasoning_level: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub wrapper: Option<WrapperConfig>,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    #[serde(default)]
    pub tool_policy: ToolPolicy,
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_max_tool_iterations() -> u32 {
    100
}

/// An optional prefix command (e.g. a sandbox binary) that executes the
/// provider CLI in a constrained environment, contributing its own
/// `PATH`/env.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapperConfig {
    pub path: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    InProcess,
    CliA,
    CliB,
    CliC,
}

impl ProviderKind {
    pub fn is_cli(&self) -> bool {
        !matches!(self, Self::InProcess)
    }
}

/// Tool allow/deny policy — prefix-based matching. Deny always wins.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl ToolPolicy {
    /// Check whether the given tool name is permitted by this policy.
    /// Matching is case-insensitive; deny is evaluated before allow.
    pub fn allows(&self, tool_name: &str) -> bool {
        let name = tool_name.to_ascii_lowercase();

        for d in &self.deny {
            let d_lower = d.to_ascii_lowercase();
            if d_lower == "*" || name == d_lower || name.starts_with(&format!("{d_lower}.")) {
                return false;
            }
        }
        if self.allow.is_empty() || self.allow.iter().any(|a| a == "*") {
            return true;
        }
        for a in &self.allow {
            let a_lower = a.to_ascii_lowercase();
            if name == a_lower || name.starts_with(&format!("{a_lower}.")) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_policy_empty_allows_all() {
        let policy = ToolPolicy::default();
        assert!(policy.allows("exec"));
        assert!(policy.allows("shell.run"));
    }

    #[test]
    fn tool_policy_allow_restricts() {
        let policy = ToolPolicy {
            allow: vec!["exec".into()],
            deny: vec![],
        };
        assert!(policy.allows("exec"));
        assert!(!policy.allows("shell.run"));
    }

    #[test]
    fn tool_policy_deny_takes_precedence() {
        let policy = ToolPolicy {
            allow: vec!["*".into()],
            deny: vec!["exec".into()],
        };
        assert!(!policy.allows("exec"));
        assert!(policy.allows("shell.run"));
    }

    #[test]
    fn tool_policy_case_insensitive() {
        let policy = ToolPolicy {
            allow: vec!["Exec".into()],
            deny: vec![],
        };
        assert!(policy.allows("EXEC"));
        assert!(policy.allows("exec.run"));
    }

    #[test]
    fn config_defaults_without_file() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8787);
        assert_eq!(cfg.webhook.max_attempts, 3);
        assert!(cfg.agents.is_empty());
    }

    #[test]
    fn parses_minimal_toml() {
        let toml_src = r#"
            [server]
            port = 9000

            [agents.main]
            type = "chat"
            provider = "in_process"
            model = "gpt-4o"
        "#;
        let cfg: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(cfg.server.port, 9000);
        match cfg.agents.get("main").unwrap() {
            AgentConfig::Chat(c) => {
                assert_eq!(c.provider, ProviderKind::InProcess);
                assert_eq!(c.max_tool_iterations, 100);
            }
            _ => panic!("expected chat agent"),
        }
    }
}
