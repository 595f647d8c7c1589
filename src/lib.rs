pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod logging;
pub mod session;
pub mod startup;
pub mod vector;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use config::AppConfig;
use db::DbPool;
use error::AppError;
use health::probe::ConnectivityProbe;
use health::{HealthDomain, HealthLevel, HealthObserver, HealthRegistry, HealthSnapshot};
use session::SqliteSessionStore;
use startup::{StartupHandle, StartupOrchestrator};

/// How long shutdown waits for an in-flight startup run.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The process-wide service graph. Built once, shared by every surface.
pub struct AppServices {
    pub config: AppConfig,
    pub db: DbPool,
    pub health: Arc<HealthRegistry>,
    pub sessions: Arc<SqliteSessionStore>,
    pub startup: Arc<StartupOrchestrator>,
    probe: Arc<ConnectivityProbe>,
    /// Cancelled on shutdown; startup runs use a child token.
    pub shutdown: CancellationToken,
}

impl AppServices {
    pub fn build(config: AppConfig) -> Result<Self, AppError> {
        let pool = db::open_pool(&config.db_path(), config.db_connection_timeout)?;
        let health = Arc::new(HealthRegistry::new());
        health.add_observer(Arc::new(TransitionLogger::default()));

        let sessions = Arc::new(SqliteSessionStore::new(pool.clone()));
        let collections = vector::build_collections(&pool, &config.collections);
        let startup = Arc::new(StartupOrchestrator::new(
            health.clone(),
            collections,
            sessions.clone(),
        ));
        let probe = Arc::new(ConnectivityProbe::new(&config.inference_url, config.probe_timeout)?);

        tracing::info!(
            data_dir = %config.data_dir.display(),
            collections = config.collections.len(),
            "Service graph ready"
        );

        Ok(Self {
            config,
            db: pool,
            health,
            sessions,
            startup,
            probe,
            shutdown: CancellationToken::new(),
        })
    }

    /// Probe the inference backend, then run the startup sequence, all on a
    /// background task. Returns immediately; results land in `health`.
    pub fn launch_startup(&self) -> StartupHandle {
        let probe = self.probe.clone();
        let health = self.health.clone();
        let startup = self.startup.clone();
        let cancel = self.shutdown.child_token();

        StartupHandle::spawn(async move {
            probe.run(&health).await;
            startup.run_detached(cancel).await;
        })
    }

    /// Retrieval features need every vector collection in place.
    pub fn retrieval_enabled(&self) -> bool {
        self.health.is_healthy(HealthDomain::VectorStore)
    }
}

/// Logs each domain's level transitions.
#[derive(Default)]
struct TransitionLogger {
    last: std::sync::Mutex<std::collections::HashMap<HealthDomain, HealthLevel>>,
}

impl HealthObserver for TransitionLogger {
    fn on_health_changed(&self, domain: HealthDomain, snapshot: &HealthSnapshot) {
        let issue = snapshot.get(domain);
        let previous = self
            .last
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(domain, issue.level);
        if previous == Some(issue.level) {
            return;
        }
        match issue.level {
            HealthLevel::Healthy => tracing::info!(domain = %domain, "{} is healthy", domain.label()),
            level => tracing::warn!(
                domain = %domain,
                ?level,
                error = issue.error.as_deref().unwrap_or(""),
                "{} is not healthy",
                domain.label()
            ),
        }
    }
}

/// Entry point for the binary: boot the service graph, start subsystems in
/// the background, and print health snapshots until Ctrl-C.
pub fn run() -> Result<(), AppError> {
    let config = AppConfig::load()?;
    logging::init(config.log_json);
    logging::install_crash_hook(&config.data_dir);

    tracing::info!("Starting Assistant v{}", env!("CARGO_PKG_VERSION"));

    // Opening the pool does blocking I/O, so it happens before any runtime
    // worker exists.
    let services = AppServices::build(config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut status = services.health.subscribe();
        let startup = services.launch_startup();

        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = status.borrow_and_update().clone();
                    tracing::debug!(
                        version = snapshot.version,
                        overall = ?snapshot.overall(),
                        "Health changed"
                    );
                    println!("{}", serde_json::to_string(&snapshot)?);
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
            }
        }

        services.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, startup.wait()).await.is_err() {
            tracing::warn!("Startup still running at shutdown");
        }
        Ok::<(), AppError>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::CollectionCategory;

    fn offline_config(dir: &std::path::Path) -> AppConfig {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = AppConfig::with_data_dir(dir.to_path_buf());
        config.inference_url = format!("http://127.0.0.1:{port}");
        config.probe_timeout = Duration::from_millis(500);
        config
    }

    #[test]
    fn test_build_needs_no_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let services = AppServices::build(offline_config(dir.path())).unwrap();

        assert!(services.db.get().is_ok());
        assert_eq!(services.health.snapshot().overall(), HealthLevel::Unknown);
        assert!(!services.startup.has_run());
    }

    #[tokio::test]
    async fn test_offline_backend_degrades_vector_store_only() {
        let dir = tempfile::tempdir().unwrap();
        let services = AppServices::build(offline_config(dir.path())).unwrap();

        services.launch_startup().wait().await;

        let snap = services.health.snapshot();
        assert_eq!(snap.get(HealthDomain::Inference).level, HealthLevel::Unhealthy);
        let vector = snap.get(HealthDomain::VectorStore);
        assert_eq!(vector.level, HealthLevel::Degraded);
        assert_eq!(vector.error.as_deref(), Some("Inference backend not connected."));
        assert_eq!(snap.get(HealthDomain::Database).level, HealthLevel::Healthy);
        assert!(services.startup.has_run());
        assert!(!services.retrieval_enabled());
    }

    #[tokio::test]
    async fn test_collections_created_when_backend_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = offline_config(dir.path());
        config.collections = vec![CollectionCategory::Documents, CollectionCategory::Tools];
        let services = AppServices::build(config).unwrap();

        // Stand in for a successful probe.
        services
            .health
            .set_issue(HealthDomain::Inference, health::HealthIssue::healthy("up"));
        services
            .startup
            .clone()
            .spawn_detached(services.shutdown.child_token())
            .wait()
            .await;

        assert!(services.retrieval_enabled());
        let names: Vec<String> = db::repos::vector_collections::get_all(&services.db)
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["documents", "tools"]);
    }

    #[tokio::test]
    async fn test_shutdown_before_startup_cancels_run() {
        let dir = tempfile::tempdir().unwrap();
        let services = AppServices::build(offline_config(dir.path())).unwrap();
        services.shutdown.cancel();

        services.launch_startup().wait().await;

        assert!(!services.startup.has_run());
    }
}
