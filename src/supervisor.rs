//! Relay reconnection supervision.
//!
//! Relays drop connections all the time; the supervisor owns getting them
//! back. One retry task per unhealthy relay redials on a fixed schedule,
//! escalating to a slower cadence once a relay has failed long enough to
//! look dead. The supervisor never reports failure upward; a relay that
//! stays dead forever simply stays in `Reconnecting` until the caller stops
//! routing requests to it.

use crate::registry::{normalize_relay_url, ConnectionRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type RecoveryCallback = Box<dyn FnOnce() + Send + 'static>;

/// Health status of a supervised relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Connection is open
    Healthy,
    /// Connection is down and a retry task is treating it
    Reconnecting,
}

/// Per-relay health record.
#[derive(Debug, Clone)]
pub struct RelayHealth {
    /// Current status
    pub status: HealthStatus,
    /// Failed redial attempts since the last recovery
    pub consecutive_failed_attempts: u32,
    /// When the relay last came back
    pub last_recovered_at: Option<Instant>,
}

impl Default for RelayHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failed_attempts: 0,
            last_recovered_at: None,
        }
    }
}

/// Retry schedule for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    /// Delay between attempts while the relay still looks recoverable
    pub short_interval: Duration,
    /// Delay once the failure count passes the escalation threshold
    pub long_interval: Duration,
    /// Failed-attempt count at which the cadence escalates
    pub escalation_threshold: u32,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            short_interval: Duration::from_secs(10),
            long_interval: Duration::from_secs(120),
            escalation_threshold: 100,
        }
    }
}

impl SupervisorPolicy {
    /// Delay before the next attempt, given the failures so far.
    pub fn retry_delay(&self, consecutive_failed_attempts: u32) -> Duration {
        if consecutive_failed_attempts < self.escalation_threshold {
            self.short_interval
        } else {
            self.long_interval
        }
    }
}

struct RelayState {
    health: RelayHealth,
    callbacks: Vec<RecoveryCallback>,
    treating: bool,
}

impl Default for RelayState {
    fn default() -> Self {
        Self {
            health: RelayHealth::default(),
            callbacks: Vec::new(),
            treating: false,
        }
    }
}

/// Watches relay connections and redials the ones that drop.
pub struct ReconnectionSupervisor {
    registry: Arc<ConnectionRegistry>,
    policy: SupervisorPolicy,
    states: Arc<Mutex<HashMap<String, RelayState>>>,
}

impl ReconnectionSupervisor {
    /// Create a supervisor over the given registry.
    pub fn new(registry: Arc<ConnectionRegistry>, policy: SupervisorPolicy) -> Self {
        Self {
            registry,
            policy,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Make sure a relay is being brought back, and run `on_recovered` once
    /// it is.
    ///
    /// If the connection is already open the callback fires immediately.
    /// Otherwise it is queued, and a retry task is started unless one is
    /// already treating this relay. Callbacks from repeated calls accumulate
    /// and all fire on the next recovery.
    pub async fn ensure_healthy<F>(&self, url: &str, on_recovered: F) -> crate::error::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let url = normalize_relay_url(url)?;
        let conn = self.registry.get(&url).await?;

        if conn.is_open().await {
            let mut states = self.states.lock().await;
            let state = states.entry(url).or_default();
            state.health.status = HealthStatus::Healthy;
            drop(states);
            on_recovered();
            return Ok(());
        }

        let start_task = {
            let mut states = self.states.lock().await;
            let state = states.entry(url.clone()).or_default();
            state.health.status = HealthStatus::Reconnecting;
            state.callbacks.push(Box::new(on_recovered));
            if state.treating {
                false
            } else {
                state.treating = true;
                true
            }
        };

        if start_task {
            debug!("starting reconnection treatment for {}", url);
            tokio::spawn(Self::treat(
                Arc::clone(&self.registry),
                Arc::clone(&self.states),
                self.policy.clone(),
                url,
            ));
        }
        Ok(())
    }

    /// Health record for a relay. Relays never seen by the supervisor report
    /// the default healthy record.
    pub async fn health(&self, url: &str) -> crate::error::Result<RelayHealth> {
        let url = normalize_relay_url(url)?;
        let states = self.states.lock().await;
        Ok(states.get(&url).map(|s| s.health.clone()).unwrap_or_default())
    }

    async fn treat(
        registry: Arc<ConnectionRegistry>,
        states: Arc<Mutex<HashMap<String, RelayState>>>,
        policy: SupervisorPolicy,
        url: String,
    ) {
        loop {
            // The connection may have healed out-of-band (another request
            // dialed it) since the last tick.
            let already_open = match registry.get(&url).await {
                Ok(conn) => conn.is_open().await,
                Err(_) => false,
            };
            let recovered = already_open || registry.connect(&url).await.is_ok();

            if recovered {
                Self::mark_recovered(&states, &url).await;
                return;
            }

            let delay = {
                let mut guard = states.lock().await;
                let state = guard.entry(url.clone()).or_default();
                state.health.consecutive_failed_attempts += 1;
                let attempts = state.health.consecutive_failed_attempts;
                if attempts == policy.escalation_threshold {
                    warn!(
                        "relay {} still down after {} attempts, slowing retries",
                        url, attempts
                    );
                }
                policy.retry_delay(attempts)
            };
            tokio::time::sleep(delay).await;
        }
    }

    async fn mark_recovered(states: &Mutex<HashMap<String, RelayState>>, url: &str) {
        let callbacks = {
            let mut guard = states.lock().await;
            let state = guard.entry(url.to_string()).or_default();
            state.health.status = HealthStatus::Healthy;
            state.health.consecutive_failed_attempts = 0;
            state.health.last_recovered_at = Some(Instant::now());
            state.treating = false;
            std::mem::take(&mut state.callbacks)
        };
        info!("relay {} recovered ({} waiters)", url, callbacks.len());
        for callback in callbacks {
            callback();
        }
    }
}
