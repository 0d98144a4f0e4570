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

//! The C2 capability-set (§9 design note): one shared `generate` contract
//! implemented by the Template, Researcher, and DeepResearcher transports
//! plus the judge transport, so the pipeline never branches on generator
//! kind beyond picking which `Arc<dyn GeneratorTransport>` to call.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EvalError;
use crate::model::RunContext;

#[derive(Debug, Clone)]
pub struct GenerateQuery {
    pub source_text: String,
    pub instructions: String,
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub provider: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub extra: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub run_context: RunContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerateStatus {
    Ok,
}

#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub content: String,
    pub cost_usd: f64,
    pub duration: Duration,
    pub status: GenerateStatus,
    pub metadata: serde_json::Value,
}

/// Same contract for all three generator backends and the judge transport:
/// `generate(query, config, options) -> Result<GenerateOutcome, EvalError>`.
#[async_trait]
pub trait GeneratorTransport: Send + Sync {
    async fn generate(
        &self,
        query: &GenerateQuery,
        config: &GeneratorConfig,
        options: &GenerateOptions,
    ) -> Result<GenerateOutcome, EvalError>;

    fn name(&self) -> &'static str;
}
