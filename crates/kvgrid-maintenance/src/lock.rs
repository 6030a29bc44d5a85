//! Cluster-wide named mutexes over store documents
//!
//! One lock document per job kind, taken with a single atomic conditional
//! update. A lease older than the owning job's interval counts as free, so
//! a holder that crashed without releasing never wedges the fleet. Acquire
//! fails closed on store errors (never run duplicate work); release fails
//! open (a stuck lock heals itself through staleness).

use crate::scheduler::JobKind;
use kvgrid_common::{JobConfig, epoch_millis};
use kvgrid_store::{ConditionalUpdate, DocStore, UpdateOutcome};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lease-based distributed lock manager
pub struct LockManager {
    store: Arc<dyn DocStore>,
    lock_index: String,
    config: JobConfig,
}

impl LockManager {
    /// Create a manager over the given lock index
    pub fn new(store: Arc<dyn DocStore>, lock_index: impl Into<String>, config: JobConfig) -> Self {
        Self {
            store,
            lock_index: lock_index.into(),
            config,
        }
    }

    /// Try to take the lock for a job kind
    ///
    /// True means this instance holds the lease until it releases or the
    /// lease goes stale. Any store error reads as "not acquired".
    pub async fn acquire(&self, job: JobKind) -> bool {
        let now_ms = epoch_millis();
        let stale_after_ms =
            i64::try_from(job.interval(&self.config).as_millis()).unwrap_or(i64::MAX);

        let update = ConditionalUpdate::AcquireLease { now_ms, stale_after_ms };
        match self
            .store
            .conditional_update(&self.lock_index, job.lock_id(), update)
            .await
        {
            Ok(UpdateOutcome::Applied) => true,
            Ok(UpdateOutcome::Noop) => {
                debug!(job = %job, "lock held elsewhere and still fresh");
                false
            }
            Err(e) => {
                warn!(job = %job, error = %e, "lock acquisition failed, treating as not acquired");
                false
            }
        }
    }

    /// Release the lock for a job kind
    ///
    /// Failures are logged and swallowed; the lease goes stale after the
    /// job's interval anyway.
    pub async fn release(&self, job: JobKind) {
        let update = ConditionalUpdate::ReleaseLease { now_ms: epoch_millis() };
        if let Err(e) = self
            .store
            .conditional_update(&self.lock_index, job.lock_id(), update)
            .await
        {
            warn!(job = %job, error = %e, "lock release failed, lease will expire as stale");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvgrid_store::MemoryDocStore;
    use std::time::Duration;

    const LOCKS: &str = "kvgrid-lock";

    fn manager(store: &Arc<MemoryDocStore>, config: JobConfig) -> LockManager {
        LockManager::new(store.clone(), LOCKS, config)
    }

    #[tokio::test]
    async fn test_acquire_deny_release_acquire() {
        let store = Arc::new(MemoryDocStore::new());
        // Two control-plane instances sharing one store.
        let ours = manager(&store, JobConfig::default());
        let theirs = manager(&store, JobConfig::default());

        assert!(ours.acquire(JobKind::StorageCleanup).await);
        assert!(!theirs.acquire(JobKind::StorageCleanup).await);

        ours.release(JobKind::StorageCleanup).await;
        assert!(theirs.acquire(JobKind::StorageCleanup).await);
    }

    #[tokio::test]
    async fn test_job_kinds_lock_independently() {
        let store = Arc::new(MemoryDocStore::new());
        let locks = manager(&store, JobConfig::default());

        assert!(locks.acquire(JobKind::StorageCleanup).await);
        assert!(locks.acquire(JobKind::TempStorageExpiry).await);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_admit_one() {
        let store = Arc::new(MemoryDocStore::new());
        let locks = Arc::new(manager(&store, JobConfig::default()));

        let attempts = futures::future::join_all(
            (0..20).map(|_| {
                let locks = locks.clone();
                async move { locks.acquire(JobKind::VmStorageCleanup).await }
            }),
        )
        .await;

        assert_eq!(attempts.into_iter().filter(|won| *won).count(), 1);
    }

    #[tokio::test]
    async fn test_stale_lease_is_acquirable_without_release() {
        let store = Arc::new(MemoryDocStore::new());
        let config = JobConfig {
            temp_expiry_interval_secs: 0,
            ..JobConfig::default()
        };
        let crashed = manager(&store, config.clone());
        let survivor = manager(&store, config);

        assert!(crashed.acquire(JobKind::TempStorageExpiry).await);
        // The holder never releases; its lease outlives the job interval.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(survivor.acquire(JobKind::TempStorageExpiry).await);
    }

    #[tokio::test]
    async fn test_acquire_fails_closed_on_store_errors() {
        let store = Arc::new(MemoryDocStore::new());
        let locks = manager(&store, JobConfig::default());

        store.set_failing("conditional-update", true);
        assert!(!locks.acquire(JobKind::StorageCleanup).await);

        store.set_failing("conditional-update", false);
        assert!(locks.acquire(JobKind::StorageCleanup).await);
    }

    #[tokio::test]
    async fn test_release_swallows_store_errors() {
        let store = Arc::new(MemoryDocStore::new());
        let locks = manager(&store, JobConfig::default());
        assert!(locks.acquire(JobKind::StorageCleanup).await);

        store.set_failing("conditional-update", true);
        // Must not propagate; staleness recovers the lease later.
        locks.release(JobKind::StorageCleanup).await;
    }
}
