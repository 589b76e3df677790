use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::Client;
use kube::runtime::events::{Recorder, Reporter};
use tokio::time::Instant;

use crate::controller::error::BackoffConfig;
use crate::credentials::{KubeSecretStore, SecretStore};
use crate::crd::ResourceKey;
use crate::health::HealthState;
use crate::postgres::PoolRegistry;

/// Name reported on published events
pub const REPORTER: &str = "postgres-access-operator";

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Connection pools for the managed PostgreSQL instance
    pub pools: Arc<PoolRegistry>,
    /// Storage for role passwords
    pub secrets: Arc<dyn SecretStore>,
    /// Health state for metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
    /// Event recorder
    pub recorder: Recorder,
    /// Restrict related-resource listing to one namespace
    pub watch_namespace: Option<String>,
    /// Backoff for failed cycles
    pub backoff: BackoffConfig,
    /// Backoff for cycles waiting on a dependency
    pub pending_backoff: BackoffConfig,
    /// Earliest time each resource may run again
    pub retry_gate: Arc<RetryGate>,
}

impl Context {
    pub fn new(
        client: Client,
        pools: Arc<PoolRegistry>,
        watch_namespace: Option<String>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let secrets = Arc::new(KubeSecretStore::new(
            client.clone(),
            pools.operation_timeout(),
        ));
        let reporter: Reporter = REPORTER.into();
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            pools,
            secrets,
            health_state,
            watch_namespace,
            backoff: BackoffConfig::default(),
            pending_backoff: BackoffConfig::pending(),
            retry_gate: Arc::new(RetryGate::default()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Hold {
    generation: Option<i64>,
    deleting: bool,
    until: Instant,
}

/// Per-resource retry deadlines
///
/// A failed cycle writes status, and that write comes back as a watch event.
/// Without a gate the event would start the next attempt immediately instead
/// of after the backoff. A hold only applies to the generation and the
/// lifecycle stage it was set for, so a spec change or a deletion always runs
/// at once.
#[derive(Debug, Default)]
pub struct RetryGate {
    holds: Mutex<HashMap<ResourceKey, Hold>>,
}

impl RetryGate {
    /// Block `key` at `generation` for `delay`
    pub fn hold(
        &self,
        key: &ResourceKey,
        generation: Option<i64>,
        deleting: bool,
        delay: Duration,
    ) {
        let mut holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
        holds.insert(
            key.clone(),
            Hold {
                generation,
                deleting,
                until: Instant::now() + delay,
            },
        );
    }

    /// Time left before `key` may run again, if it is held
    pub fn remaining(
        &self,
        key: &ResourceKey,
        generation: Option<i64>,
        deleting: bool,
    ) -> Option<Duration> {
        let mut holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
        let hold = *holds.get(key)?;
        let now = Instant::now();
        if hold.generation != generation || hold.deleting != deleting || hold.until <= now {
            holds.remove(key);
            return None;
        }
        Some(hold.until - now)
    }

    pub fn clear(&self, key: &ResourceKey) {
        let mut holds = self.holds.lock().unwrap_or_else(|e| e.into_inner());
        holds.remove(key);
    }
}
