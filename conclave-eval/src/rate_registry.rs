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

//! C1: per-provider request pacing (§4.1). Deliberately not a token
//! bucket: each provider gets a serialized minimum-delay gate, grounded
//! directly in the donor's rate limiter service — lock, compute the wait,
//! unlock, sleep, relock to stamp the admit time, so the sleep never holds
//! the lock other callers are waiting on.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};

const DEFAULT_MIN_DELAY_MILLIS: u64 = 1000;

fn default_min_delay_for(provider: &str) -> u64 {
    match provider {
        "anthropic" => 1000,
        "openai" => 500,
        "google" => 500,
        "openrouter" => 500,
        _ => DEFAULT_MIN_DELAY_MILLIS,
    }
}

/// A held slot for one provider call; releases its concurrency permit (if
/// any) on drop.
pub struct AdmitGuard {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
    gate: Arc<ProviderGate>,
}

impl Drop for AdmitGuard {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

struct ProviderGate {
    min_delay_millis: AtomicU64,
    last_admit: Mutex<Option<Instant>>,
    concurrency: tokio::sync::RwLock<Option<Arc<Semaphore>>>,
    in_flight: AtomicU32,
}

impl ProviderGate {
    fn new(min_delay_millis: u64) -> Self {
        Self {
            min_delay_millis: AtomicU64::new(min_delay_millis),
            last_admit: Mutex::new(None),
            concurrency: tokio::sync::RwLock::new(None),
            in_flight: AtomicU32::new(0),
        }
    }

    async fn acquire(self: &Arc<Self>) -> AdmitGuard {
        let permit = {
            let guard = self.concurrency.read().await;
            match guard.as_ref() {
                Some(sem) => Some(sem.clone().acquire_owned().await.expect("semaphore closed")),
                None => None,
            }
        };

        loop {
            let wait = {
                let mut last_admit = self.last_admit.lock().await;
                let min_delay = Duration::from_millis(self.min_delay_millis.load(Ordering::Relaxed));
                let now = Instant::now();
                let wait = match *last_admit {
                    Some(previous) => min_delay.saturating_sub(now.duration_since(previous)),
                    None => Duration::ZERO,
                };
                if wait.is_zero() {
                    *last_admit = Some(now);
                }
                wait
            };

            if wait.is_zero() {
                break;
            }
            tokio::time::sleep(wait).await;
        }

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        AdmitGuard {
            _permit: permit,
            gate: Arc::clone(self),
        }
    }
}

/// Keyed by provider name; lazily creates a gate with the default min
/// delay the first time a provider is seen.
pub struct ProviderRateRegistry {
    gates: DashMap<String, Arc<ProviderGate>>,
}

impl Default for ProviderRateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRateRegistry {
    pub fn new() -> Self {
        let gates = DashMap::new();
        for provider in ["anthropic", "openai", "google", "openrouter"] {
            gates.insert(
                provider.to_string(),
                Arc::new(ProviderGate::new(default_min_delay_for(provider))),
            );
        }
        Self { gates }
    }

    fn gate_for(&self, provider: &str) -> Arc<ProviderGate> {
        self.gates
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderGate::new(default_min_delay_for(provider))))
            .clone()
    }

    /// Blocks until the provider's minimum delay (and, if configured, a
    /// concurrency permit) admits this caller.
    pub async fn acquire(&self, provider: &str) -> AdmitGuard {
        let gate = self.gate_for(provider);
        gate.acquire().await
    }

    /// Updates a provider's pacing at runtime. `max_concurrent` of `None`
    /// leaves concurrency unbounded; `Some(0)` is rejected by callers
    /// upstream (never constructed here).
    pub async fn update_limits(&self, provider: &str, min_delay: Option<Duration>, max_concurrent: Option<usize>) {
        let gate = self.gate_for(provider);
        if let Some(delay) = min_delay {
            gate.min_delay_millis.store(delay.as_millis() as u64, Ordering::Relaxed);
        }
        if let Some(limit) = max_concurrent {
            let mut guard = gate.concurrency.write().await;
            *guard = Some(Arc::new(Semaphore::new(limit)));
        }
    }

    pub fn in_flight(&self, provider: &str) -> u32 {
        self.gates
            .get(provider)
            .map(|g| g.in_flight.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn serializes_calls_to_the_same_provider() {
        let registry = ProviderRateRegistry::new();
        registry.update_limits("testprov", Some(Duration::from_millis(20)), None).await;

        let started = Instant::now();
        let _g1 = registry.acquire("testprov").await;
        drop(_g1);
        let _g2 = registry.acquire("testprov").await;
        drop(_g2);
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn unknown_provider_gets_default_gate() {
        let registry = ProviderRateRegistry::new();
        let _guard = registry.acquire("some-new-provider").await;
        assert_eq!(registry.in_flight("some-new-provider"), 1);
    }

    #[tokio::test]
    async fn concurrency_limit_blocks_excess_callers() {
        let registry = ProviderRateRegistry::new();
        registry.update_limits("capped", Some(Duration::ZERO), Some(1)).await;
        let guard = registry.acquire("capped").await;
        assert_eq!(registry.in_flight("capped"), 1);
        drop(guard);
    }
}
