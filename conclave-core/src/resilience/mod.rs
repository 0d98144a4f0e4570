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

//! Resilience primitives. Only the retry/back-off policy survives here —
//! §4.2/§9 specify full-jitter exponential back-off for transient provider
//! errors, consumed by `conclave_eval::llm::retry`. C1's rate gating and
//! C5's semaphores cover concurrency control directly, so no circuit
//! breaker or bulkhead sits in the live call path.

use rand::random;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Full-jitter backoff: delay = min(base * multiplier^attempt, max_delay),
    /// actual sleep = Uniform(0, delay). `jitter` is unused by this formula;
    /// it is kept on the struct only because callers build `RetryPolicy`
    /// values with struct-literal syntax that expects the field.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let sleep = random::<f64>() * capped;
        Duration::from_secs_f64(sleep)
    }
}
