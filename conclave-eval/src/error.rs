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

//! Error taxonomy shared by C2-C5. Kinds, not type names: every variant maps
//! to one row of the taxonomy table rather than to a single call site.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum EvalError {
    #[error("invalid run configuration: {0}")]
    ConfigInvalid(String),

    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    #[error("fatal provider error: {0}")]
    ProviderFatal(String),

    #[error("response missing grounding signal")]
    ResponseMissingGrounding,

    #[error("response missing reasoning signal")]
    ResponseMissingReasoning,

    #[error("response missing both grounding and reasoning signals")]
    ResponseMissingBoth,

    #[error("failed to parse judge response: {0}")]
    ParseError(String),

    #[error("call exceeded its wall-clock deadline")]
    Timeout,

    #[error("generator returned empty content")]
    GenerationEmpty,

    #[error("run was cancelled")]
    Cancelled,
}

impl EvalError {
    /// True for the taxonomy rows C2 retries internally (§7, §4.2's
    /// transient classifier). `Timeout` is included: a timed-out call is
    /// classified transient and handled by the same retry loop.
    pub fn is_transient(&self) -> bool {
        matches!(self, EvalError::ProviderTransient(_) | EvalError::Timeout)
    }

    pub fn is_missing_grounding(&self) -> bool {
        matches!(
            self,
            EvalError::ResponseMissingGrounding | EvalError::ResponseMissingBoth
        )
    }

    pub fn is_missing_reasoning(&self) -> bool {
        matches!(
            self,
            EvalError::ResponseMissingReasoning | EvalError::ResponseMissingBoth
        )
    }
}
