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

//! Researcher generator transport (§4.2): shells out to an external
//! report-generation subprocess rather than calling a provider API
//! directly. Configuration is passed via environment variables, progress
//! and the final result arrive as JSON lines on stdout, and a timed-out
//! child is given a grace period to exit before being force-killed.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::EvalError;
use crate::llm::retry::with_retry;
use crate::llm::transport::{
    GenerateOptions, GenerateOutcome, GenerateQuery, GenerateStatus, GeneratorConfig,
    GeneratorTransport,
};
use crate::model::FpfStats;
use conclave_core::RetryPolicy;

const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ProgressLine {
    #[allow(dead_code)]
    stage: Option<String>,
    #[allow(dead_code)]
    progress: Option<f64>,
    #[allow(dead_code)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResearcherResult {
    status: String,
    content: Option<String>,
    costs: Option<f64>,
    #[allow(dead_code)]
    context: Option<serde_json::Value>,
    #[allow(dead_code)]
    visited_urls: Option<Vec<String>>,
    error: Option<String>,
    #[allow(dead_code)]
    traceback: Option<String>,
}

/// Which report flavor to ask the subprocess for; the deep variant widens
/// breadth/depth and gets a longer default timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportType {
    Research,
    Deep,
}

impl ReportType {
    fn as_str(self) -> &'static str {
        match self {
            ReportType::Research => "research_report",
            ReportType::Deep => "deep",
        }
    }
}

pub struct ResearcherTransport {
    binary: String,
    report_type: ReportType,
    tone: String,
    breadth: Option<u32>,
    depth: Option<u32>,
    retriever: String,
    subprocess_timeout: Duration,
    retry_policy: RetryPolicy,
    stats: Option<Arc<FpfStats>>,
}

impl ResearcherTransport {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            report_type: ReportType::Research,
            tone: "objective".to_string(),
            breadth: None,
            depth: None,
            retriever: "tavily".to_string(),
            subprocess_timeout: Duration::from_secs(600),
            retry_policy: RetryPolicy::exponential(),
            stats: None,
        }
    }

    pub fn deep(mut self) -> Self {
        self.report_type = ReportType::Deep;
        self.breadth = self.breadth.or(Some(4));
        self.depth = self.depth.or(Some(2));
        self.subprocess_timeout = Duration::from_secs(1800);
        self
    }

    pub fn with_stats(mut self, stats: Arc<FpfStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_subprocess_timeout(mut self, timeout: Duration) -> Self {
        self.subprocess_timeout = timeout;
        self
    }

    fn spawn(&self, query: &GenerateQuery, config: &GeneratorConfig) -> Result<Child, EvalError> {
        let model_key = format!("{}:{}", config.provider, config.model);
        let mut command = Command::new(&self.binary);
        command
            .env("SMART_LLM", &model_key)
            .env("FAST_LLM", &model_key)
            .env("STRATEGIC_LLM", &model_key)
            .env("RETRIEVER", &self.retriever)
            .env("REPORT_TYPE", self.report_type.as_str())
            .env("TONE", &self.tone)
            .env("PROMPT", &query.instructions)
            .env("SOURCE_TEXT", &query.source_text)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(max_tokens) = config.max_output_tokens {
            command.env("MAX_TOKENS", max_tokens.to_string());
        }
        if let Some(breadth) = self.breadth {
            command.env("BREADTH", breadth.to_string());
        }
        if let Some(depth) = self.depth {
            command.env("DEPTH", depth.to_string());
        }
        for (key, value) in &config.extra {
            command.env(key, value);
        }

        command
            .spawn()
            .map_err(|e| EvalError::ProviderFatal(format!("failed to spawn researcher subprocess: {e}")))
    }

    async fn run_once(&self, query: &GenerateQuery, config: &GeneratorConfig) -> Result<(String, f64), EvalError> {
        let mut child = self.spawn(query, config)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EvalError::ProviderFatal("researcher subprocess had no stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let run = async {
            let mut final_line: Option<String> = None;
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if serde_json::from_str::<ProgressLine>(&line).is_ok() {
                    tracing::debug!(provider = %config.provider, "researcher progress: {line}");
                    continue;
                }
                final_line = Some(line);
            }
            final_line
        };

        let outcome = tokio::time::timeout(self.subprocess_timeout, run).await;

        match outcome {
            Ok(Some(final_line)) => {
                let _ = child.wait().await;
                parse_final_line(&final_line)
            }
            Ok(None) => {
                let _ = child.wait().await;
                Err(EvalError::ProviderFatal("researcher subprocess produced no result line".into()))
            }
            Err(_) => {
                kill_gracefully(&mut child).await;
                Err(EvalError::Timeout)
            }
        }
    }
}

fn parse_final_line(line: &str) -> Result<(String, f64), EvalError> {
    let result: ResearcherResult = serde_json::from_str(line)
        .map_err(|e| EvalError::ParseError(format!("malformed researcher result line: {e}")))?;

    if result.status != "ok" && result.status != "success" {
        let message = result
            .error
            .unwrap_or_else(|| format!("researcher reported status {:?}", result.status));
        return Err(EvalError::ProviderFatal(message));
    }

    let content = result
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or(EvalError::GenerationEmpty)?;
    Ok((content, result.costs.unwrap_or(0.0)))
}

async fn kill_gracefully(child: &mut Child) {
    if let Some(id) = child.id() {
        tracing::warn!(pid = id, "researcher subprocess timed out, terminating");
    }
    #[cfg(unix)]
    {
        if let Some(id) = child.id() {
            unsafe {
                libc::kill(id as libc::pid_t, libc::SIGTERM);
            }
        }
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
}

#[async_trait]
impl GeneratorTransport for ResearcherTransport {
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
                let (content, cost_usd) = self.run_once(query, config).await?;
                Ok(GenerateOutcome {
                    content,
                    cost_usd,
                    duration: started.elapsed(),
                    status: GenerateStatus::Ok,
                    metadata: serde_json::json!({}),
                })
            }
        })
        .await
    }

    fn name(&self) -> &'static str {
        match self.report_type {
            ReportType::Research => "researcher",
            ReportType::Deep => "deep_researcher",
        }
    }
}

