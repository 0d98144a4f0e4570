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

mod config;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use conclave_core::PricingTable;
use conclave_eval::llm::{
    transport_for, GeneratorTransport, JudgeTransport, ResponseValidator, TemplateTransport,
};
use conclave_eval::{GeneratorKind, RunExecutor};

use crate::config::CliConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the run configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Root directory for generated documents, timeline logs, and failure
    /// artifacts (overrides the config file)
    #[arg(long, env = "CONCLAVE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Path to the researcher subprocess binary (overrides the config file)
    #[arg(long, env = "CONCLAVE_RESEARCHER_BINARY")]
    researcher_binary: Option<String>,
}

fn build_transports(
    config: &CliConfig,
) -> (HashMap<GeneratorKind, Arc<dyn GeneratorTransport>>, Arc<dyn GeneratorTransport>) {
    let pricing = Arc::new(PricingTable::with_defaults());
    let mut validator = ResponseValidator::with_default_checks();
    if let Some(dir) = &config.log_dir {
        validator = validator.with_failure_log_root(dir.clone());
    }
    let credentials = config.providers.to_credentials();
    let template: Arc<dyn GeneratorTransport> =
        Arc::new(TemplateTransport::new(pricing, Arc::new(validator), credentials));

    let mut generator_transports: HashMap<GeneratorKind, Arc<dyn GeneratorTransport>> = HashMap::new();
    for generator in &config.run.generators {
        let transport = match generator {
            GeneratorKind::Template => Arc::clone(&template),
            GeneratorKind::Researcher | GeneratorKind::DeepResearcher => {
                transport_for(*generator, &config.researcher_binary)
            }
        };
        generator_transports.insert(*generator, transport);
    }

    let judge_transport: Arc<dyn GeneratorTransport> = Arc::new(JudgeTransport::new(Arc::clone(&template)));
    (generator_transports, judge_transport)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = CliConfig::load(&args.config)?;
    if let Some(log_dir) = args.log_dir {
        config.log_dir = Some(log_dir);
    }
    if let Some(researcher_binary) = args.researcher_binary {
        config.researcher_binary = researcher_binary;
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let (generator_transports, judge_transport) = build_transports(&config);

    let executor = RunExecutor::new(
        config.run,
        run_id.clone(),
        generator_transports,
        judge_transport,
        config.log_dir.clone(),
    )?;

    let cancellation = executor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt, requesting run cancellation");
            cancellation.cancel();
        }
    });

    let outcome = executor.run().await;
    tracing::info!(
        run_id = %run_id,
        status = ?outcome.run.status,
        cost_usd = outcome.run.cumulative_cost_usd,
        calls_total = outcome.stats.total,
        calls_failed = outcome.stats.failed,
        "run finished"
    );

    let rendered = serde_json::to_string_pretty(&outcome.run)?;
    if let Some(dir) = &config.log_dir {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("run.json"), &rendered)?;
    }
    println!("{rendered}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_require_a_config_path() {
        let result = Args::try_parse_from(["conclave"]);
        assert!(result.is_err());
    }
}
