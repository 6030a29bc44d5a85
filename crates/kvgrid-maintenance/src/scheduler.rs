//! Scheduled job framework
//!
//! A fixed set of named periodic jobs, each ticking on its own interval
//! and guarded by the distributed lock, so every maintenance task runs on
//! exactly one control-plane instance per cycle. Job bodies come from a
//! dispatch table built once at startup; a denied lock makes the cycle a
//! no-op, and a failing or panicking body is logged without ever leaking
//! the lock or stopping the scheduler.

use crate::lock::LockManager;
use futures::future::BoxFuture;
use kvgrid_common::{JobConfig, Result};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// The maintenance tasks this control plane runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Soft-delete TEMP storages past their TTL
    TempStorageExpiry,
    /// Purge soft-deleted storages after the grace window
    StorageCleanup,
    /// Soft-delete storages of machines that no longer exist
    VmStorageCleanup,
    /// Soft-delete storages of recently removed accounts
    AccountStorageCleanup,
}

impl JobKind {
    /// Every job kind, in dispatch-table order
    pub const ALL: [Self; 4] = [
        Self::TempStorageExpiry,
        Self::StorageCleanup,
        Self::VmStorageCleanup,
        Self::AccountStorageCleanup,
    ];

    /// Stable id of this job's lock document
    #[must_use]
    pub const fn lock_id(self) -> &'static str {
        match self {
            Self::TempStorageExpiry => "temp-storage-expiry",
            Self::StorageCleanup => "storage-cleanup",
            Self::VmStorageCleanup => "vm-storage-cleanup",
            Self::AccountStorageCleanup => "account-storage-cleanup",
        }
    }

    /// Execution interval; doubles as the staleness bound of this job's
    /// lock lease
    #[must_use]
    pub const fn interval(self, config: &JobConfig) -> Duration {
        let secs = match self {
            Self::TempStorageExpiry => config.temp_expiry_interval_secs,
            Self::StorageCleanup => config.storage_cleanup_interval_secs,
            Self::VmStorageCleanup => config.vm_cleanup_interval_secs,
            Self::AccountStorageCleanup => config.account_cleanup_interval_secs,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lock_id())
    }
}

type JobBody = Arc<dyn Fn() -> BoxFuture<'static, Result<usize>> + Send + Sync>;

/// Periodic job runner guarded by the distributed lock
pub struct JobScheduler {
    locks: Arc<LockManager>,
    config: JobConfig,
    bodies: HashMap<JobKind, JobBody>,
}

impl JobScheduler {
    /// Create a scheduler with an empty dispatch table
    pub fn new(locks: Arc<LockManager>, config: JobConfig) -> Self {
        Self {
            locks,
            config,
            bodies: HashMap::new(),
        }
    }

    /// Register the body for a job kind
    ///
    /// Bodies are idempotent maintenance passes returning how many
    /// storages they touched.
    pub fn register<F, Fut>(&mut self, kind: JobKind, body: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<usize>> + Send + 'static,
    {
        self.bodies.insert(kind, Arc::new(move || Box::pin(body())));
    }

    /// Spawn one independent tick loop per registered job kind
    pub fn spawn_all(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.bodies
            .keys()
            .copied()
            .map(|kind| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move { scheduler.run_loop(kind).await })
            })
            .collect()
    }

    async fn run_loop(&self, kind: JobKind) {
        // A zero interval would make the ticker spin.
        let period = kind.interval(&self.config).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick(kind).await;
        }
    }

    /// One scheduling cycle for a job kind: acquire, run, always release
    pub async fn tick(&self, kind: JobKind) {
        let Some(body) = self.bodies.get(&kind) else {
            return;
        };

        if !self.locks.acquire(kind).await {
            debug!(job = %kind, "another instance runs this job, skipping cycle");
            return;
        }

        // The body runs in its own task so a panic is contained and the
        // release below always happens.
        match tokio::spawn(body()).await {
            Ok(Ok(affected)) if affected > 0 => {
                info!(job = %kind, affected, "maintenance pass complete");
            }
            Ok(Ok(_)) => debug!(job = %kind, "maintenance pass complete, nothing to do"),
            Ok(Err(e)) => error!(job = %kind, error = %e, "maintenance job failed"),
            Err(e) => error!(job = %kind, error = %e, "maintenance job panicked"),
        }

        self.locks.release(kind).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvgrid_common::Error;
    use kvgrid_store::MemoryDocStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LOCKS: &str = "kvgrid-lock";

    fn harness() -> (Arc<MemoryDocStore>, Arc<LockManager>, JobScheduler) {
        let store = Arc::new(MemoryDocStore::new());
        let locks = Arc::new(LockManager::new(
            store.clone(),
            LOCKS,
            JobConfig::default(),
        ));
        let scheduler = JobScheduler::new(locks.clone(), JobConfig::default());
        (store, locks, scheduler)
    }

    #[tokio::test]
    async fn test_tick_runs_body_and_releases() {
        let (_, locks, mut scheduler) = harness();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler.register(JobKind::TempStorageExpiry, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(3)
            }
        });

        scheduler.tick(JobKind::TempStorageExpiry).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The lock came back: an immediate acquire succeeds.
        assert!(locks.acquire(JobKind::TempStorageExpiry).await);
    }

    #[tokio::test]
    async fn test_denied_lock_skips_the_cycle() {
        let (_, locks, mut scheduler) = harness();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler.register(JobKind::StorageCleanup, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            }
        });

        // Another instance already holds the lease.
        assert!(locks.acquire(JobKind::StorageCleanup).await);

        scheduler.tick(JobKind::StorageCleanup).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_body_still_releases() {
        let (_, locks, mut scheduler) = harness();
        scheduler.register(JobKind::VmStorageCleanup, || async {
            Err(Error::RequestFailed { op: "search" })
        });

        scheduler.tick(JobKind::VmStorageCleanup).await;
        assert!(locks.acquire(JobKind::VmStorageCleanup).await);
    }

    fn explode() -> usize {
        panic!("job exploded")
    }

    #[tokio::test]
    async fn test_panicking_body_still_releases() {
        let (_, locks, mut scheduler) = harness();
        scheduler.register(JobKind::AccountStorageCleanup, || async { Ok(explode()) });

        scheduler.tick(JobKind::AccountStorageCleanup).await;
        assert!(locks.acquire(JobKind::AccountStorageCleanup).await);
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_a_noop() {
        let (_, locks, scheduler) = harness();
        scheduler.tick(JobKind::TempStorageExpiry).await;
        // Nothing acquired the lock.
        assert!(locks.acquire(JobKind::TempStorageExpiry).await);
    }
}
