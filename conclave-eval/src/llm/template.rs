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

//! Template generator transport (§4.2): a direct JSON-POST call per
//! provider family. Per-provider auth header schemes mirror the three
//! families the donor's provider manager distinguishes: `x-goog-api-key`,
//! `x-api-key` + `anthropic-version`, and the default `Authorization:
//! Bearer`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use conclave_core::{PricingTable, RetryPolicy};
use serde_json::json;

use crate::error::EvalError;
use crate::llm::retry::with_retry;
use crate::llm::transport::{
    GenerateOptions, GenerateOutcome, GenerateQuery, GenerateStatus, GeneratorConfig,
    GeneratorTransport,
};
use crate::llm::validation::ResponseValidator;
use crate::model::FpfStats;

/// Credentials resolved by the (out-of-scope) secret store and handed to
/// the adapter layer; never read from the environment directly here.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub api_keys: HashMap<String, String>,
}

impl ProviderCredentials {
    pub fn key_for(&self, provider: &str) -> Option<&str> {
        self.api_keys.get(provider).map(String::as_str)
    }
}

pub struct TemplateTransport {
    http: reqwest::Client,
    pricing: Arc<PricingTable>,
    validator: Arc<ResponseValidator>,
    credentials: ProviderCredentials,
    retry_policy: RetryPolicy,
    stats: Option<Arc<FpfStats>>,
}

impl TemplateTransport {
    pub fn new(
        pricing: Arc<PricingTable>,
        validator: Arc<ResponseValidator>,
        credentials: ProviderCredentials,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            pricing,
            validator,
            credentials,
            retry_policy: RetryPolicy::exponential(),
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<FpfStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn build_request(
        &self,
        query: &GenerateQuery,
        config: &GeneratorConfig,
    ) -> Result<reqwest::RequestBuilder, EvalError> {
        let prompt = format!("{}\n\n{}", config_instructions(config, query), query.source_text);
        let key = self
            .credentials
            .key_for(&config.provider)
            .ok_or_else(|| EvalError::ProviderFatal(format!("no credentials for provider {}", config.provider)))?;

        let (url, builder) = match config.provider.as_str() {
            "google" => {
                let url = format!(
                    "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
                    config.model
                );
                let body = json!({
                    "contents": [{"parts": [{"text": prompt}]}],
                    "tools": [{"googleSearch": {}}],
                });
                (url.clone(), self.http.post(url).header("x-goog-api-key", key).json(&body))
            }
            "anthropic" => {
                let url = "https://api.anthropic.com/v1/messages".to_string();
                let body = json!({
                    "model": config.model,
                    "max_tokens": config.max_output_tokens.unwrap_or(4096),
                    "messages": [{"role": "user", "content": prompt}],
                });
                (
                    url.clone(),
                    self.http
                        .post(url)
                        .header("x-api-key", key)
                        .header("anthropic-version", "2023-06-01")
                        .json(&body),
                )
            }
            _ => {
                let url = "https://api.openai.com/v1/chat/completions".to_string();
                let body = json!({
                    "model": config.model,
                    "temperature": config.temperature,
                    "messages": [{"role": "user", "content": prompt}],
                });
                (url.clone(), self.http.post(url).bearer_auth(key).json(&body))
            }
        };
        let _ = url;
        Ok(builder)
    }

    fn extract_usage(&self, config: &GeneratorConfig, raw: &serde_json::Value) -> (u32, u32) {
        let input = raw
            .pointer("/usage/prompt_tokens")
            .or_else(|| raw.pointer("/usage/input_tokens"))
            .or_else(|| raw.pointer("/usageMetadata/promptTokenCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        let output = raw
            .pointer("/usage/completion_tokens")
            .or_else(|| raw.pointer("/usage/output_tokens"))
            .or_else(|| raw.pointer("/usageMetadata/candidatesTokenCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        let _ = config;
        (input, output)
    }

    fn extract_content(&self, config: &GeneratorConfig, raw: &serde_json::Value) -> String {
        match config.provider.as_str() {
            "google" => raw
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            "anthropic" => raw
                .pointer("/content/0/text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            _ => raw
                .pointer("/choices/0/message/content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        }
    }
}

fn config_instructions(config: &GeneratorConfig, query: &GenerateQuery) -> String {
    let _ = config;
    query.instructions.clone()
}

#[async_trait]
impl GeneratorTransport for TemplateTransport {
    async fn generate(
        &self,
        query: &GenerateQuery,
        config: &GeneratorConfig,
        options: &GenerateOptions,
    ) -> Result<GenerateOutcome, EvalError> {
        let stats = self.stats.clone();
        with_retry(&self.retry_policy, options.max_retries.max(1), stats.as_deref(), |_attempt| {
            let started = Instant::now();
            async move {
                let request = self.build_request(query, config)?;
                let response = tokio::time::timeout(options.timeout, request.send())
                    .await
                    .map_err(|_| EvalError::Timeout)?
                    .map_err(|e| classify_reqwest_error(&e))?;

                let status = response.status();
                let body_text = response
                    .text()
                    .await
                    .map_err(|e| EvalError::ProviderTransient(e.to_string()))?;

                if !status.is_success() {
                    let message = format!("{} {}", status.as_u16(), body_text);
                    return Err(if status.as_u16() == 429 || status.is_server_error() {
                        EvalError::ProviderTransient(message)
                    } else {
                        EvalError::ProviderFatal(message)
                    });
                }

                let raw: serde_json::Value = serde_json::from_str(&body_text)
                    .map_err(|e| EvalError::ProviderFatal(format!("non-JSON response body: {e}")))?;

                self.validator.validate(&raw, &options.run_context)?;

                let content = self.extract_content(config, &raw);
                if content.trim().is_empty() {
                    return Err(EvalError::GenerationEmpty);
                }

                let (input_tokens, output_tokens) = self.extract_usage(config, &raw);
                let cost_usd = self
                    .pricing
                    .cost_usd(&config.provider, &config.model, input_tokens, output_tokens);

                Ok(GenerateOutcome {
                    content,
                    cost_usd,
                    duration: started.elapsed(),
                    status: GenerateStatus::Ok,
                    metadata: raw,
                })
            }
        })
        .await
    }

    fn name(&self) -> &'static str {
        "template"
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> EvalError {
    if err.is_timeout() {
        EvalError::Timeout
    } else if err.is_connect() {
        EvalError::ProviderTransient(err.to_string())
    } else {
        EvalError::ProviderFatal(err.to_string())
    }
}
