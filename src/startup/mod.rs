//! One-time startup bring-up of auxiliary subsystems.
//!
//! [`StartupOrchestrator::run_once`] runs the sequence at most once per
//! orchestrator instance (one per process, owned by the service graph):
//!   1. read the prerequisite domain's health
//!   2. healthy: ensure every dependent subsystem in declared order, each
//!      step isolated from the others; otherwise skip them (circuit breaker)
//!   3. initialize the session store
//!   4. mark the run as done
//!
//! Every outcome is published to the [`HealthRegistry`]. Callers that just
//! want startup to happen use [`StartupOrchestrator::spawn_detached`], which
//! never surfaces an error.
//!
//! A panic inside one subsystem step is recorded as that step's failure. A
//! run abandoned through cancellation leaves the flag unset, so a later call
//! can retry. That is the only way the body can complete more than once.

pub mod subsystem;

pub use subsystem::DependentSubsystem;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::health::{HealthDomain, HealthIssue, HealthLevel, HealthRegistry};
use crate::session::SessionStore;

/// Domain that must be healthy before dependent subsystems are touched.
pub const PREREQUISITE: HealthDomain = HealthDomain::Inference;

pub const COLLECTIONS_READY_DETAIL: &str = "Collections ensured.";
pub const COLLECTIONS_FAILED_DETAIL: &str = "Failed to ensure vector collections.";
pub const COLLECTIONS_SKIPPED_DETAIL: &str = "Skipped vector collection bring-up.";
pub const STORE_READY_DETAIL: &str = "Session store initialized.";
pub const STORE_FAILED_DETAIL: &str = "Failed to initialize session store.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOutcome {
    /// This call executed the sequence.
    Completed,
    /// A previous call already did.
    AlreadyRan,
}

/// Per-domain accumulation of one bring-up pass.
#[derive(Debug, Default)]
struct DomainTally {
    ensured: Vec<String>,
    failed: Vec<String>,
    /// First failure wins; later successes never overwrite it.
    first_error: Option<String>,
}

impl DomainTally {
    fn into_issue(self) -> HealthIssue {
        let mut meta = BTreeMap::new();
        meta.insert("ensured".to_string(), self.ensured.join(","));
        meta.insert("ensured_count".to_string(), self.ensured.len().to_string());
        meta.insert("failed_count".to_string(), self.failed.len().to_string());

        match self.first_error {
            None => HealthIssue::healthy(COLLECTIONS_READY_DETAIL).with_metadata(meta),
            Some(error) => {
                meta.insert("failed".to_string(), self.failed.join(","));
                HealthIssue::unhealthy(error, COLLECTIONS_FAILED_DETAIL).with_metadata(meta)
            }
        }
    }
}

pub struct StartupOrchestrator {
    registry: Arc<HealthRegistry>,
    subsystems: Vec<Arc<dyn DependentSubsystem>>,
    store: Arc<dyn SessionStore>,
    has_run: AtomicBool,
    gate: Mutex<()>,
}

impl StartupOrchestrator {
    /// `subsystems` are brought up in the given order.
    pub fn new(
        registry: Arc<HealthRegistry>,
        subsystems: Vec<Arc<dyn DependentSubsystem>>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            registry,
            subsystems,
            store,
            has_run: AtomicBool::new(false),
            gate: Mutex::new(()),
        }
    }

    pub fn has_run(&self) -> bool {
        self.has_run.load(Ordering::Acquire)
    }

    /// Run the startup sequence if no earlier call has. Safe to call from
    /// many tasks at once; all but one observe [`StartupOutcome::AlreadyRan`].
    ///
    /// Returns `Err(Cancelled)` when `cancel` fires while waiting for the gate
    /// or between steps; in that case nothing marks the run as done.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<StartupOutcome, AppError> {
        if self.has_run.load(Ordering::Acquire) {
            return Ok(StartupOutcome::AlreadyRan);
        }

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Startup cancelled while waiting for gate");
                return Err(AppError::Cancelled);
            }
            guard = self.gate.lock() => guard,
        };

        if self.has_run.load(Ordering::Acquire) {
            return Ok(StartupOutcome::AlreadyRan);
        }

        let started = Instant::now();
        tracing::info!(subsystems = self.subsystems.len(), "Startup sequence begin");

        let prerequisite = self.registry.get(PREREQUISITE);
        if prerequisite.level == HealthLevel::Healthy {
            self.ensure_subsystems(cancel).await?;
        } else {
            self.skip_subsystems(&prerequisite);
        }

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        self.initialize_store().await;

        self.has_run.store(true, Ordering::Release);
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Startup sequence complete"
        );
        Ok(StartupOutcome::Completed)
    }

    /// Domains the subsystems report into, in first-seen order. The vector
    /// store domain is always reported even with no collections configured.
    fn composite_domains(&self) -> Vec<HealthDomain> {
        let mut domains = Vec::new();
        for s in &self.subsystems {
            if !domains.contains(&s.domain()) {
                domains.push(s.domain());
            }
        }
        if domains.is_empty() {
            domains.push(HealthDomain::VectorStore);
        }
        domains
    }

    async fn ensure_subsystems(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        let mut tallies: BTreeMap<HealthDomain, DomainTally> = self
            .composite_domains()
            .into_iter()
            .map(|d| (d, DomainTally::default()))
            .collect();

        for subsystem in &self.subsystems {
            if cancel.is_cancelled() {
                tracing::info!("Startup cancelled between subsystem steps");
                return Err(AppError::Cancelled);
            }

            let name = subsystem.name().to_string();
            let tally = tallies.entry(subsystem.domain()).or_default();
            // A panicking step counts as that step's failure only.
            let result = AssertUnwindSafe(subsystem.ensure_ready(cancel))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(AppError::Subsystem {
                        name: name.clone(),
                        message: format!("panicked: {}", panic_message(payload.as_ref())),
                    })
                });

            match result {
                Ok(()) => {
                    tracing::debug!(subsystem = %name, "Subsystem ready");
                    tally.ensured.push(name);
                }
                Err(AppError::Cancelled) if cancel.is_cancelled() => return Err(AppError::Cancelled),
                Err(e) => {
                    tracing::error!(subsystem = %name, "Failed to ensure subsystem: {}", e);
                    tally.first_error.get_or_insert_with(|| e.to_string());
                    tally.failed.push(name);
                }
            }
        }

        for (domain, tally) in tallies {
            self.registry.set_issue(domain, tally.into_issue());
        }
        Ok(())
    }

    fn skip_subsystems(&self, prerequisite: &HealthIssue) {
        let error = format!("{} not connected.", PREREQUISITE.label());
        tracing::warn!(
            prerequisite = %PREREQUISITE,
            level = ?prerequisite.level,
            cause = prerequisite.error.as_deref().unwrap_or(""),
            "Skipping subsystem bring-up: {}",
            error
        );

        let mut meta = BTreeMap::new();
        meta.insert("prerequisite".to_string(), PREREQUISITE.key().to_string());
        if let Some(cause) = &prerequisite.error {
            meta.insert("prerequisite_error".to_string(), cause.clone());
        }

        for domain in self.composite_domains() {
            self.registry.set_status(
                domain,
                HealthLevel::Degraded,
                Some(error.clone()),
                Some(COLLECTIONS_SKIPPED_DETAIL.to_string()),
                Some(meta.clone()),
            );
        }
    }

    /// Store failures become a health entry like every other step.
    async fn initialize_store(&self) {
        let result = async {
            self.store.initialize().await?;
            self.store.list_session_ids().await
        }
        .await;

        match result {
            Ok(ids) => {
                tracing::info!(count = ids.len(), "Found sessions: {}", ids.join(", "));
                let mut meta = BTreeMap::new();
                meta.insert("session_count".to_string(), ids.len().to_string());
                self.registry.set_issue(
                    HealthDomain::Database,
                    HealthIssue::healthy(STORE_READY_DETAIL).with_metadata(meta),
                );
            }
            Err(e) => {
                tracing::error!("Session store initialization failed: {}", e);
                self.registry.set_issue(
                    HealthDomain::Database,
                    HealthIssue::unhealthy(e.to_string(), STORE_FAILED_DETAIL),
                );
            }
        }
    }

    /// Run the sequence on a background task. Errors and panics are logged and
    /// discarded; the outcome is visible only through the health registry.
    pub fn spawn_detached(self: Arc<Self>, cancel: CancellationToken) -> StartupHandle {
        StartupHandle::spawn(async move { self.run_detached(cancel).await })
    }

    /// Body of the detached wrapper, usable from a task the caller already owns.
    pub async fn run_detached(&self, cancel: CancellationToken) {
        match AssertUnwindSafe(self.run_once(&cancel)).catch_unwind().await {
            Ok(Ok(outcome)) => tracing::debug!(?outcome, "Detached startup finished"),
            Ok(Err(AppError::Cancelled)) => tracing::info!("Detached startup cancelled"),
            Ok(Err(e)) => tracing::error!("Detached startup failed: {}", e),
            Err(_) => tracing::error!("Detached startup panicked"),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "<unknown payload>"
    }
}

/// Handle to a detached startup run. It carries no result; read the registry.
pub struct StartupHandle {
    handle: JoinHandle<()>,
}

impl StartupHandle {
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(fut),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the background run to end, however it ended.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }
}
