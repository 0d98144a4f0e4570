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

//! Transient-error classification and C2's exponential-backoff-with-full-
//! jitter retry loop (§4.2, §7). Stratified: this is the *only* layer that
//! retries provider-level failures; C3 retries parse errors, C5 never
//! retries (§9).

use std::future::Future;
use std::time::Duration;

use conclave_core::RetryPolicy;

use crate::error::EvalError;
use crate::model::FpfStats;

const TRANSIENT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "timeout",
    "timed out",
    "502",
    "503",
    "504",
    "connection",
    "network",
    "temporarily unavailable",
    "grounding",
    "validation",
];

/// Classifies a raw error message the way §4.2 specifies: substring match
/// against a fixed marker list, case-insensitively.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub fn classify(err: &EvalError) -> EvalError {
    match err {
        EvalError::ProviderFatal(msg) if is_transient_message(msg) => {
            EvalError::ProviderTransient(msg.clone())
        }
        other => other.clone(),
    }
}

/// Runs `operation` until it succeeds, a non-transient error is returned, or
/// `max_attempts` is exhausted. Sleeps `RetryPolicy::delay_for_attempt`
/// (full jitter) between attempts and increments `stats.retries` for each
/// retry taken.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    max_attempts: u32,
    stats: Option<&FpfStats>,
    mut operation: F,
) -> Result<T, EvalError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EvalError>>,
{
    let mut last_err = EvalError::ProviderFatal("no attempts made".into());
    for attempt in 0..max_attempts.max(1) {
        if let Some(stats) = stats {
            stats.total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        match operation(attempt).await {
            Ok(value) => {
                if let Some(stats) = stats {
                    stats.success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                return Ok(value);
            }
            Err(err) => {
                let classified = classify(&err);
                if let Some(stats) = stats {
                    stats.failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                if !classified.is_transient() || attempt + 1 >= max_attempts {
                    return Err(classified);
                }
                if let Some(stats) = stats {
                    stats.retries.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                let delay = policy.delay_for_attempt(attempt);
                tokio::time::sleep(delay).await;
                last_err = classified;
            }
        }
    }
    Err(last_err)
}

pub fn judge_timeout(internal_timeout: Duration) -> Duration {
    internal_timeout + Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classifies_known_markers() {
        assert!(is_transient_message("HTTP 503 Service Unavailable"));
        assert!(is_transient_message("connection reset by peer"));
        assert!(is_transient_message("Rate Limit exceeded"));
        assert!(!is_transient_message("invalid api key"));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: 0.1,
        };
        let calls = AtomicU32::new(0);
        let stats = FpfStats::default();
        let result = with_retry(&policy, 3, Some(&stats), |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(EvalError::ProviderTransient("503".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.retries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_errors_fail_fast() {
        let policy = RetryPolicy::exponential();
        let stats = FpfStats::default();
        let result: Result<(), EvalError> = with_retry(&policy, 3, Some(&stats), |_| async {
            Err(EvalError::ProviderFatal("401 unauthorized".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(stats.retries.load(Ordering::SeqCst), 0);
    }
}
