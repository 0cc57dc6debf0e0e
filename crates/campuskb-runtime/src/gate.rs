//! Availability gate: a cached health verdict in front of the pipeline.
//!
//! States: `Unknown` (initial), `Available`, `Unavailable`. A probe runs only
//! when there is no verdict or the verdict is at least `validity` old; both
//! outcomes stamp the clock. While an `Unavailable` verdict is fresh, callers
//! short-circuit without touching retrieval or generation.
//!
//! Concurrent callers that find the verdict stale share one probe: the first
//! takes the probe lock, the rest wait for it and then read its verdict.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use campuskb_chat::providers;
use campuskb_chat::LLMConfig;
use campuskb_core::GateConfig;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateState {
    Unknown,
    Available,
    Unavailable,
}

/// Backend health check. `Err` carries a reason for the logs.
pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> BoxFuture<'_, Result<(), String>>;
}

#[derive(Debug, Clone)]
struct Verdict {
    state: GateState,
    checked_at: Option<Instant>,
}

/// Read-only view for the health and status interfaces.
#[derive(Debug, Clone, Serialize)]
pub struct GateSnapshot {
    pub state: GateState,
    pub available: bool,
    /// Whether the verdict is still inside its validity window.
    pub fresh: bool,
    pub checked_at_age_secs: Option<f64>,
    pub probes: u64,
}

pub struct AvailabilityGate {
    probe: Arc<dyn HealthProbe>,
    clock: Arc<dyn Clock>,
    config: GateConfig,
    verdict: Mutex<Verdict>,
    probing: tokio::sync::Mutex<()>,
    probes: AtomicU64,
}

impl AvailabilityGate {
    pub fn new(probe: Arc<dyn HealthProbe>, clock: Arc<dyn Clock>, config: GateConfig) -> Self {
        Self {
            probe,
            clock,
            config,
            verdict: Mutex::new(Verdict {
                state: GateState::Unknown,
                checked_at: None,
            }),
            probing: tokio::sync::Mutex::new(()),
            probes: AtomicU64::new(0),
        }
    }

    /// Current verdict, probing first if it is missing or expired.
    pub async fn check(&self) -> GateState {
        if let Some(state) = self.fresh_state() {
            return state;
        }

        let _probing = self.probing.lock().await;
        // Another caller may have probed while we waited.
        if let Some(state) = self.fresh_state() {
            return state;
        }

        self.probes.fetch_add(1, Ordering::Relaxed);
        let outcome = tokio::time::timeout(self.config.probe_timeout, self.probe.probe()).await;
        let state = match outcome {
            Ok(Ok(())) => GateState::Available,
            Ok(Err(reason)) => {
                warn!("Health probe failed: {}", reason);
                GateState::Unavailable
            }
            Err(_) => {
                warn!("Health probe timed out after {:?}", self.config.probe_timeout);
                GateState::Unavailable
            }
        };
        self.record(state);
        state
    }

    /// Record a failure observed on the query path (index or generation).
    pub fn mark_unavailable(&self, reason: &str) {
        warn!("Marking backend unavailable: {}", reason);
        self.record(GateState::Unavailable);
    }

    /// Cached verdict only; never probes and never waits on a probe.
    pub fn snapshot(&self) -> GateSnapshot {
        let verdict = self.verdict.lock().clone();
        let age = verdict
            .checked_at
            .map(|t| self.clock.now().saturating_duration_since(t));
        GateSnapshot {
            state: verdict.state,
            available: verdict.state == GateState::Available,
            fresh: age.is_some_and(|a| a < self.config.validity),
            checked_at_age_secs: age.map(|a| a.as_secs_f64()),
            probes: self.probe_count(),
        }
    }

    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn validity(&self) -> Duration {
        self.config.validity
    }

    fn fresh_state(&self) -> Option<GateState> {
        let verdict = self.verdict.lock();
        let checked_at = verdict.checked_at?;
        let age = self.clock.now().saturating_duration_since(checked_at);
        (age < self.config.validity).then_some(verdict.state)
    }

    fn record(&self, state: GateState) {
        let mut verdict = self.verdict.lock();
        if verdict.state != state {
            info!("Availability gate: {:?} -> {:?}", verdict.state, state);
        } else {
            debug!("Availability gate verdict refreshed: {:?}", state);
        }
        verdict.state = state;
        verdict.checked_at = Some(self.clock.now());
    }
}

/// Probes the configured LLM provider.
///
/// With no provider configured the service answers extractively, which has
/// no remote dependency, so the probe succeeds.
pub struct LlmHealthProbe {
    client: Client,
    config: Arc<RwLock<LLMConfig>>,
}

impl LlmHealthProbe {
    pub fn new(config: Arc<RwLock<LLMConfig>>) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

impl HealthProbe for LlmHealthProbe {
    fn probe(&self) -> BoxFuture<'_, Result<(), String>> {
        let target = self.config.read().resolve_provider();
        Box::pin(async move {
            match target {
                Some(target) => providers::check_health(&self.client, &target).await,
                None => Ok(()),
            }
        })
    }
}
