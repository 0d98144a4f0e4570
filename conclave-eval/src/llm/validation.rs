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

//! Strict grounding+reasoning response validator (§4.2). Each signal is an
//! OR over provider-family checks (§9 open question #1), not one universal
//! predicate, so both signals are modeled as a list of independent checks.

use chrono::Utc;
use serde_json::Value;
use std::path::Path;

use crate::error::EvalError;
use crate::model::RunContext;

pub trait GroundingCheck: Send + Sync {
    fn check(&self, raw: &Value) -> bool;
}

pub trait ReasoningCheck: Send + Sync {
    fn check(&self, raw: &Value) -> bool;
}

/// Non-empty tool-call list anywhere in the payload.
pub struct ToolCallsPresent;
impl GroundingCheck for ToolCallsPresent {
    fn check(&self, raw: &Value) -> bool {
        find_array(raw, "tool_calls").map(|a| !a.is_empty()).unwrap_or(false)
    }
}

/// A content block containing a URL, a `citation`/`source` marker.
pub struct UrlOrCitationInContent;
impl GroundingCheck for UrlOrCitationInContent {
    fn check(&self, raw: &Value) -> bool {
        let text = raw.to_string();
        text.contains("http://")
            || text.contains("https://")
            || text.contains("\"citation")
            || text.contains("\"source")
    }
}

/// Gemini-family `groundingMetadata` (web-search queries, supports,
/// confidence, or search entry point) or `citationMetadata` on a part.
pub struct GroundingMetadataPresent;
impl GroundingCheck for GroundingMetadataPresent {
    fn check(&self, raw: &Value) -> bool {
        find_value(raw, "groundingMetadata")
            .map(|v| !v.is_null() && v != &Value::Object(Default::default()))
            .unwrap_or(false)
            || find_value(raw, "citationMetadata").map(|v| !v.is_null()).unwrap_or(false)
    }
}

/// Search-tool provider: a `sources` array with URL/title entries.
pub struct SourcesArrayPresent;
impl GroundingCheck for SourcesArrayPresent {
    fn check(&self, raw: &Value) -> bool {
        find_array(raw, "sources")
            .map(|a| a.iter().any(|s| s.get("url").is_some() || s.get("title").is_some()))
            .unwrap_or(false)
    }
}

/// Explicit `reasoning` field or reasoning-typed content blocks.
pub struct ReasoningFieldPresent;
impl ReasoningCheck for ReasoningFieldPresent {
    fn check(&self, raw: &Value) -> bool {
        find_value(raw, "reasoning")
            .map(|v| v.as_str().map(|s| !s.trim().is_empty()).unwrap_or(!v.is_null()))
            .unwrap_or(false)
    }
}

pub struct ReasoningContentBlockPresent;
impl ReasoningCheck for ReasoningContentBlockPresent {
    fn check(&self, raw: &Value) -> bool {
        find_array(raw, "content")
            .map(|blocks| {
                blocks.iter().any(|b| {
                    matches!(
                        b.get("type").and_then(Value::as_str),
                        Some("reasoning") | Some("thinking")
                    )
                })
            })
            .unwrap_or(false)
    }
}

/// For the Gemini family, grounding-metadata signals double as the
/// reasoning carrier (§4.2: "for one family, grounding-metadata signals...
/// carry rationale").
pub struct GroundingMetadataImpliesReasoning;
impl ReasoningCheck for GroundingMetadataImpliesReasoning {
    fn check(&self, raw: &Value) -> bool {
        GroundingMetadataPresent.check(raw)
    }
}

fn find_value<'a>(raw: &'a Value, key: &str) -> Option<&'a Value> {
    match raw {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                return Some(v);
            }
            map.values().find_map(|v| find_value(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_value(v, key)),
        _ => None,
    }
}

fn find_array<'a>(raw: &'a Value, key: &str) -> Option<&'a Vec<Value>> {
    find_value(raw, key).and_then(Value::as_array)
}

pub struct ResponseValidator {
    grounding_checks: Vec<Box<dyn GroundingCheck>>,
    reasoning_checks: Vec<Box<dyn ReasoningCheck>>,
    failure_log_root: Option<std::path::PathBuf>,
}

impl ResponseValidator {
    pub fn with_default_checks() -> Self {
        Self {
            grounding_checks: vec![
                Box::new(ToolCallsPresent),
                Box::new(UrlOrCitationInContent),
                Box::new(GroundingMetadataPresent),
                Box::new(SourcesArrayPresent),
            ],
            reasoning_checks: vec![
                Box::new(ReasoningFieldPresent),
                Box::new(ReasoningContentBlockPresent),
                Box::new(GroundingMetadataImpliesReasoning),
            ],
            failure_log_root: None,
        }
    }

    pub fn with_failure_log_root(mut self, root: std::path::PathBuf) -> Self {
        self.failure_log_root = Some(root);
        self
    }

    fn is_grounded(&self, raw: &Value) -> bool {
        self.grounding_checks.iter().any(|c| c.check(raw))
    }

    fn has_reasoning(&self, raw: &Value) -> bool {
        self.reasoning_checks.iter().any(|c| c.check(raw))
    }

    /// Validates `raw` for `ctx`, writing a failure artifact (§6, §8
    /// invariant 8) whenever either signal is missing.
    pub fn validate(&self, raw: &Value, ctx: &RunContext) -> Result<(), EvalError> {
        let grounded = self.is_grounded(raw);
        let reasoned = self.has_reasoning(raw);

        let err = match (grounded, reasoned) {
            (true, true) => return Ok(()),
            (false, true) => EvalError::ResponseMissingGrounding,
            (true, false) => EvalError::ResponseMissingReasoning,
            (false, false) => EvalError::ResponseMissingBoth,
        };

        if let Some(root) = &self.failure_log_root {
            write_failure_artifact(root, ctx, raw, &err, grounded, reasoned);
        }
        Err(err)
    }
}

fn write_failure_artifact(
    root: &Path,
    ctx: &RunContext,
    raw: &Value,
    err: &EvalError,
    missing_grounding_checked: bool,
    missing_reasoning_checked: bool,
) {
    let logs_dir = root.join("logs");
    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        tracing::warn!(error = %e, "failed to create failure-artifact directory");
        return;
    }
    let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let path = logs_dir.join(format!("failure-{timestamp}-{}-grounding.json", ctx.provider));
    let artifact = serde_json::json!({
        "provider": ctx.provider,
        "model": ctx.model,
        "run_id": &*ctx.run_id,
        "timestamp": Utc::now().to_rfc3339(),
        "error": err.to_string(),
        "validation_category": match err {
            EvalError::ResponseMissingGrounding => "missing_grounding",
            EvalError::ResponseMissingReasoning => "missing_reasoning",
            EvalError::ResponseMissingBoth => "missing_both",
            _ => "other",
        },
        "missing_grounding": !missing_grounding_checked,
        "missing_reasoning": !missing_reasoning_checked,
        "response_shape_summary": summarize_shape(raw),
    });
    if let Err(e) = std::fs::write(&path, artifact.to_string()) {
        tracing::warn!(error = %e, path = %path.display(), "failed to write failure artifact");
    }
}

fn summarize_shape(raw: &Value) -> Value {
    match raw {
        Value::Object(map) => {
            Value::Array(map.keys().map(|k| Value::String(k.clone())).collect())
        }
        other => Value::String(format!("{other:?}").chars().take(120).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RunContext {
        RunContext::new("run-1", "openai", "gpt-4o")
    }

    #[test]
    fn passes_with_tool_calls_and_reasoning_field() {
        let validator = ResponseValidator::with_default_checks();
        let raw = json!({"tool_calls": [{"name": "search"}], "reasoning": "because X"});
        assert!(validator.validate(&raw, &ctx()).is_ok());
    }

    #[test]
    fn rejects_missing_grounding() {
        let validator = ResponseValidator::with_default_checks();
        let raw = json!({"reasoning": "because X"});
        let err = validator.validate(&raw, &ctx()).unwrap_err();
        assert!(matches!(err, EvalError::ResponseMissingGrounding));
    }

    #[test]
    fn rejects_missing_reasoning() {
        let validator = ResponseValidator::with_default_checks();
        let raw = json!({"sources": [{"url": "https://example.com", "title": "X"}]});
        let err = validator.validate(&raw, &ctx()).unwrap_err();
        assert!(matches!(err, EvalError::ResponseMissingReasoning));
    }

    #[test]
    fn rejects_missing_both() {
        let validator = ResponseValidator::with_default_checks();
        let raw = json!({"content": "plain text answer"});
        let err = validator.validate(&raw, &ctx()).unwrap_err();
        assert!(matches!(err, EvalError::ResponseMissingBoth));
    }

    #[test]
    fn grounding_metadata_satisfies_both_signals() {
        let validator = ResponseValidator::with_default_checks();
        let raw = json!({"groundingMetadata": {"webSearchQueries": ["q"]}});
        assert!(validator.validate(&raw, &ctx()).is_ok());
    }

    #[test]
    fn writes_failure_artifact_on_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let validator = ResponseValidator::with_default_checks()
            .with_failure_log_root(dir.path().to_path_buf());
        let raw = json!({"content": "plain text"});
        assert!(validator.validate(&raw, &ctx()).is_err());
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("logs")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
