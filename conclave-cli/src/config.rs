// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! TOML-loadable wrapper around [`conclave_eval::RunConfig`] plus the
//! credentials and paths that only make sense at the batch-runner edge,
//! not in the orchestrator core. Load order is file, then environment
//! variables for anything the file left unset, matching the donor's
//! `ServerConfig::load`/`merge_with_env` split.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use conclave_eval::llm::ProviderCredentials;
use conclave_eval::RunConfig;

fn default_researcher_binary() -> String {
    "researcher".to_string()
}

/// API keys for the Template transport's provider families. Kept out of
/// `RunConfig` itself so a run definition can be committed to disk without
/// secrets.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProviderCredentialsConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
}

impl ProviderCredentialsConfig {
    pub fn to_credentials(&self) -> ProviderCredentials {
        let mut credentials = ProviderCredentials::default();
        if let Some(key) = &self.openai_api_key {
            credentials.api_keys.insert("openai".to_string(), key.clone());
        }
        if let Some(key) = &self.anthropic_api_key {
            credentials.api_keys.insert("anthropic".to_string(), key.clone());
        }
        if let Some(key) = &self.google_api_key {
            credentials.api_keys.insert("google".to_string(), key.clone());
        }
        if let Some(key) = &self.openrouter_api_key {
            credentials.api_keys.insert("openrouter".to_string(), key.clone());
        }
        credentials
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CliConfig {
    pub run: RunConfig,
    #[serde(default)]
    pub providers: ProviderCredentialsConfig,
    /// Path to the subprocess binary backing the Researcher/DeepResearcher
    /// generators. Only read if the run actually configures one of them.
    #[serde(default = "default_researcher_binary")]
    pub researcher_binary: String,
    /// Root directory for generated-document bodies, the timeline event
    /// log, and grounding/reasoning failure artifacts. `None` runs
    /// in-memory only.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl CliConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Reads the run definition from `config_file`, then fills in any
    /// provider credential the environment has that the file didn't.
    pub fn load(config_file: &Path) -> Result<Self> {
        tracing::info!(path = %config_file.display(), "loading run configuration");
        let config = Self::from_file(config_file)?;
        Ok(config.merge_with_env())
    }

    fn merge_with_env(mut self) -> Self {
        if self.providers.openai_api_key.is_none() {
            self.providers.openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        }
        if self.providers.anthropic_api_key.is_none() {
            self.providers.anthropic_api_key = std::env::var("ANTHROPIC_API_KEY").ok();
        }
        if self.providers.google_api_key.is_none() {
            self.providers.google_api_key = std::env::var("GOOGLE_API_KEY").ok();
        }
        if self.providers.openrouter_api_key.is_none() {
            self.providers.openrouter_api_key = std::env::var("OPENROUTER_API_KEY").ok();
        }
        self
    }
}
