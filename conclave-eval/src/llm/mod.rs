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

//! C2: the LLM adapter layer. One transport per generator kind plus a
//! judge wrapper, all behind the shared [`transport::GeneratorTransport`]
//! contract; parsing, validation and retry are free functions any
//! transport can call.

pub mod judge_transport;
pub mod parser;
pub mod researcher;
pub mod retry;
pub mod template;
pub mod transport;
pub mod validation;

pub use judge_transport::JudgeTransport;
pub use parser::parse_json_response;
pub use researcher::{ReportType, ResearcherTransport};
pub use retry::{is_transient_message, judge_timeout, with_retry};
pub use template::{ProviderCredentials, TemplateTransport};
pub use transport::{
    GenerateOptions, GenerateOutcome, GenerateQuery, GenerateStatus, GeneratorConfig,
    GeneratorTransport,
};
pub use validation::ResponseValidator;

use std::sync::Arc;

use crate::model::GeneratorKind;

/// Resolves the transport for a configured generator kind. The deep
/// researcher is the same subprocess transport with widened breadth/depth
/// (§4.2), not a separate binary.
pub fn transport_for(kind: GeneratorKind, researcher_binary: &str) -> Arc<dyn GeneratorTransport> {
    match kind {
        GeneratorKind::Researcher => Arc::new(ResearcherTransport::new(researcher_binary)),
        GeneratorKind::DeepResearcher => Arc::new(ResearcherTransport::new(researcher_binary).deep()),
        GeneratorKind::Template => {
            unreachable!("template transport requires credentials; construct it directly")
        }
    }
}
