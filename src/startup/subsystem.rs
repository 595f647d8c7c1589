use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::health::HealthDomain;

/// A subsystem that must be brought to a ready state once before use.
///
/// `ensure_ready` must be idempotent (a no-op when the target already exists)
/// and must fail fast when the backing resource is unreachable.
#[async_trait]
pub trait DependentSubsystem: Send + Sync {
    /// Stable name used in logs and health metadata.
    fn name(&self) -> &str;

    /// Domain whose health summarizes this subsystem.
    fn domain(&self) -> HealthDomain;

    async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<(), AppError>;
}
