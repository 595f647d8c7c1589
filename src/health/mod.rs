//! Per-domain health registry.
//!
//! Subsystems push their state with [`HealthRegistry::set_status`]; readers
//! (status indicators, feature gates) call [`HealthRegistry::get`] or take an
//! owned [`HealthSnapshot`]. Issues are replaced wholesale, never patched.
//!
//! Change notification happens after the write lock is released, so an
//! observer may call back into the registry.

pub mod probe;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use ts_rs::TS;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
    /// Never reported.
    Unknown,
}

impl HealthLevel {
    /// Ordering used when folding several outcomes into one: higher is worse.
    /// `Unknown` ranks between degraded and unhealthy since nothing was proven.
    pub fn severity(self) -> u8 {
        match self {
            HealthLevel::Healthy => 0,
            HealthLevel::Degraded => 1,
            HealthLevel::Unknown => 2,
            HealthLevel::Unhealthy => 3,
        }
    }

    pub fn worst(self, other: HealthLevel) -> HealthLevel {
        self.max(other)
    }
}

/// Levels order by severity, so `max` picks the worse one.
impl Ord for HealthLevel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.severity().cmp(&other.severity())
    }
}

impl PartialOrd for HealthLevel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A monitorable subsystem. The set is fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum HealthDomain {
    /// Reachability of the local inference backend.
    Inference,
    /// Composite over every vector collection.
    VectorStore,
    /// Persistent chat-session store.
    Database,
}

impl HealthDomain {
    pub const ALL: [HealthDomain; 3] = [
        HealthDomain::Inference,
        HealthDomain::VectorStore,
        HealthDomain::Database,
    ];

    pub fn key(self) -> &'static str {
        match self {
            HealthDomain::Inference => "inference",
            HealthDomain::VectorStore => "vector_store",
            HealthDomain::Database => "database",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HealthDomain::Inference => "Inference backend",
            HealthDomain::VectorStore => "Vector store",
            HealthDomain::Database => "Session database",
        }
    }
}

impl fmt::Display for HealthDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Current reported status of one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HealthIssue {
    pub level: HealthLevel,
    pub error: Option<String>,
    pub detail: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl HealthIssue {
    pub fn new(
        level: HealthLevel,
        error: Option<String>,
        detail: Option<String>,
        metadata: Option<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            level,
            error,
            detail,
            observed_at: Utc::now(),
            metadata,
        }
    }

    /// Default for a domain nobody has reported on yet.
    pub fn unknown() -> Self {
        Self::new(HealthLevel::Unknown, None, None, None)
    }

    pub fn healthy(detail: impl Into<String>) -> Self {
        Self::new(HealthLevel::Healthy, None, Some(detail.into()), None)
    }

    pub fn degraded(error: impl Into<String>) -> Self {
        Self::new(HealthLevel::Degraded, Some(error.into()), None, None)
    }

    pub fn unhealthy(error: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(HealthLevel::Unhealthy, Some(error.into()), Some(detail.into()), None)
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.level == HealthLevel::Healthy
    }
}

/// Owned point-in-time copy of every reported domain.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HealthSnapshot {
    /// Incremented on every write; lets observers drop stale notifications.
    pub version: u64,
    pub issues: BTreeMap<HealthDomain, HealthIssue>,
}

impl HealthSnapshot {
    pub fn get(&self, domain: HealthDomain) -> HealthIssue {
        self.issues.get(&domain).cloned().unwrap_or_else(HealthIssue::unknown)
    }

    /// Worst level across all domains. Unreported domains count as unknown.
    pub fn overall(&self) -> HealthLevel {
        HealthDomain::ALL
            .iter()
            .map(|d| self.issues.get(d).map(|i| i.level).unwrap_or(HealthLevel::Unknown))
            .fold(HealthLevel::Healthy, HealthLevel::worst)
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Synchronous change callback. Invoked after every write, outside the lock.
pub trait HealthObserver: Send + Sync {
    fn on_health_changed(&self, domain: HealthDomain, snapshot: &HealthSnapshot);
}

impl<F> HealthObserver for F
where
    F: Fn(HealthDomain, &HealthSnapshot) + Send + Sync,
{
    fn on_health_changed(&self, domain: HealthDomain, snapshot: &HealthSnapshot) {
        self(domain, snapshot)
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct RegistryState {
    issues: HashMap<HealthDomain, HealthIssue>,
    version: u64,
}

impl RegistryState {
    fn to_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            version: self.version,
            issues: self.issues.iter().map(|(d, i)| (*d, i.clone())).collect(),
        }
    }
}

pub struct HealthRegistry {
    state: RwLock<RegistryState>,
    observers: RwLock<Vec<Arc<dyn HealthObserver>>>,
    watch_tx: watch::Sender<HealthSnapshot>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(HealthSnapshot::default());
        Self {
            state: RwLock::new(RegistryState::default()),
            observers: RwLock::new(Vec::new()),
            watch_tx,
        }
    }

    /// Replace the issue for `domain` and notify observers.
    pub fn set_status(
        &self,
        domain: HealthDomain,
        level: HealthLevel,
        error: Option<String>,
        detail: Option<String>,
        metadata: Option<BTreeMap<String, String>>,
    ) {
        self.set_issue(domain, HealthIssue::new(level, error, detail, metadata));
    }

    pub fn set_issue(&self, domain: HealthDomain, issue: HealthIssue) {
        tracing::debug!(
            domain = %domain,
            level = ?issue.level,
            error = issue.error.as_deref().unwrap_or(""),
            "Health status updated"
        );

        // Entries are replaced wholesale, so a poisoned map is still consistent.
        let snapshot = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.issues.insert(domain, issue);
            state.version += 1;
            state.to_snapshot()
        };

        self.watch_tx.send_if_modified(|current| {
            if snapshot.version > current.version {
                *current = snapshot.clone();
                true
            } else {
                false
            }
        });

        let observers: Vec<Arc<dyn HealthObserver>> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_health_changed(domain, &snapshot);
        }
    }

    /// Current issue for `domain`, or the unknown default.
    pub fn get(&self, domain: HealthDomain) -> HealthIssue {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .issues
            .get(&domain)
            .cloned()
            .unwrap_or_else(HealthIssue::unknown)
    }

    pub fn is_healthy(&self, domain: HealthDomain) -> bool {
        self.get(domain).is_healthy()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .to_snapshot()
    }

    pub fn add_observer(&self, observer: Arc<dyn HealthObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Async-friendly change feed; the receiver always holds the newest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.watch_tx.subscribe()
    }
}
