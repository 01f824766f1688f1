//! Provider registry.
//!
//! Constructs and holds the in-process `LlmProvider` instance for every
//! configured `chat` agent whose `provider` is `in_process`. CLI-flavor
//! agents are not represented here — their single-invocation contract is
//! driven directly by [`crate::cli`].

use std::collections::HashMap;
use std::sync::Arc;

use cro_domain::config::{AgentConfig, Config, ProviderKind};
use cro_domain::error::Result;

use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    /// Build the registry from the full application config, instantiating
    /// one adapter per `chat` agent configured with `provider = in_process`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();

        for (agent_id, agent) in &config.agents {
            if let AgentConfig::Chat(chat_cfg) = agent {
                if chat_cfg.provider == ProviderKind::InProcess {
                    let provider = OpenAiCompatProvider::from_config(agent_id.clone(), chat_cfg)?;
                    providers.insert(agent_id.clone(), Arc::new(provider));
                }
            }
        }

        Ok(Self { providers })
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(agent_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cro_domain::config::ChatAgentConfig;

    fn chat_agent(provider: ProviderKind) -> AgentConfig {
        AgentConfig::Chat(ChatAgentConfig {
            provider,
            model: Some("gpt-4o".into()),
            base_url: None,
            api_key: Some("sk-test".into()),
            extra_headers: Default::default(),
            timeout_secs: 30,
            reasoning_level: None,
            working_dir: None,
            extra_args: vec![],
            wrapper: None,
            max_tool_iterations: 100,
            tool_policy: Default::default(),
        })
    }

    #[test]
    fn builds_one_provider_per_in_process_chat_agent() {
        let mut agents = HashMap::new();
        agents.insert("main".to_string(), chat_agent(ProviderKind::InProcess));
        agents.insert("coder".to_string(), chat_agent(ProviderKind::CliA));
        let config = Config {
            agents,
            ..Default::default()
        };

        let registry = ProviderRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("main").is_some());
        assert!(registry.get("coder").is_none());
    }
}
