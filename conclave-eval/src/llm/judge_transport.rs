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

//! Judge transport (§4.2, §9): wraps a [`TemplateTransport`] so judge calls
//! get the same validated-response/cost-accounted path as generation
//! calls, but with a widened timeout (`judge_timeout`) and retry limited
//! to the judge's own parse/validation failures — the underlying template
//! call has already exhausted its own provider-transient retries.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EvalError;
use crate::llm::retry::judge_timeout;
use crate::llm::transport::{
    GenerateOptions, GenerateOutcome, GenerateQuery, GeneratorConfig, GeneratorTransport,
};

pub struct JudgeTransport {
    inner: Arc<dyn GeneratorTransport>,
}

impl JudgeTransport {
    pub fn new(inner: Arc<dyn GeneratorTransport>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl GeneratorTransport for JudgeTransport {
    async fn generate(
        &self,
        query: &GenerateQuery,
        config: &GeneratorConfig,
        options: &GenerateOptions,
    ) -> Result<GenerateOutcome, EvalError> {
        let mut widened = options.clone();
        widened.timeout = judge_timeout(options.timeout);
        self.inner.generate(query, config, &widened).await
    }

    fn name(&self) -> &'static str {
        "judge"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunContext;
    use std::time::Duration;

    struct EchoTransport;

    #[async_trait]
    impl GeneratorTransport for EchoTransport {
        async fn generate(
            &self,
            _query: &GenerateQuery,
            _config: &GeneratorConfig,
            options: &GenerateOptions,
        ) -> Result<GenerateOutcome, EvalError> {
            assert!(options.timeout >= Duration::from_secs(30));
            Ok(GenerateOutcome {
                content: "{}".to_string(),
                cost_usd: 0.0,
                duration: Duration::from_millis(1),
                status: crate::llm::transport::GenerateStatus::Ok,
                metadata: serde_json::json!({}),
            })
        }

        fn name(&self) -> &'static str {
            "echo"
        }
    }

    #[tokio::test]
    async fn widens_timeout_by_thirty_seconds() {
        let judge = JudgeTransport::new(Arc::new(EchoTransport));
        let query = GenerateQuery {
            source_text: String::new(),
            instructions: String::new(),
        };
        let config = GeneratorConfig {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            temperature: None,
            max_output_tokens: None,
            extra: Default::default(),
        };
        let options = GenerateOptions {
            timeout: Duration::from_secs(5),
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
            run_context: RunContext::new("run-1", "openai", "gpt-4o"),
        };
        let outcome = judge.generate(&query, &config, &options).await.unwrap();
        assert_eq!(outcome.content, "{}");
    }
}
