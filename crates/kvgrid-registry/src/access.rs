//! Access-check seam
//!
//! Ownership and permissions live in the host platform, not in this crate;
//! the cache and the manager consult them through this narrow trait on
//! every read. Existence is deliberately never cached — owners come and go
//! independently of the storage documents.

use async_trait::async_trait;
use kvgrid_common::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Identity a read or mutation is performed as
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    /// Account the caller acts for
    pub account_id: String,
}

impl Caller {
    /// Create a caller identity
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
        }
    }
}

/// Directory and permission checks provided by the host platform
#[async_trait]
pub trait AccessResolver: Send + Sync {
    /// Whether the account currently exists
    async fn account_exists(&self, account_id: &str) -> Result<bool>;

    /// Whether the virtual machine currently exists
    async fn vm_exists(&self, vm_id: &str) -> Result<bool>;

    /// Whether the caller may touch storages of the given account
    async fn can_access_account(&self, caller: &Caller, account_id: &str) -> Result<bool>;

    /// Whether the caller may touch the given machine's storage
    async fn can_access_vm(&self, caller: &Caller, vm_id: &str) -> Result<bool>;

    /// Accounts removed at or after the given instant, for the
    /// removed-owner cleanup sweep
    async fn accounts_removed_since(&self, since_epoch_ms: i64) -> Result<Vec<String>>;
}

/// Fixed in-process directory
///
/// Stands in for the host platform in development setups and tests; an
/// empty one denies everything. Accounts own their storages and the
/// machines registered to them.
#[derive(Default)]
pub struct StaticResolver {
    accounts: RwLock<HashSet<String>>,
    /// vm id -> owning account
    vms: RwLock<HashMap<String, String>>,
    /// (account id, removed at)
    removed: RwLock<Vec<(String, i64)>>,
}

impl StaticResolver {
    /// Create an empty directory (denies everything)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account
    pub fn add_account(&self, account_id: impl Into<String>) {
        self.accounts.write().insert(account_id.into());
    }

    /// Drop an account, recording when it was removed
    pub fn remove_account(&self, account_id: &str, removed_at_ms: i64) {
        self.accounts.write().remove(account_id);
        self.removed
            .write()
            .push((account_id.to_string(), removed_at_ms));
    }

    /// Register a machine under its owning account
    pub fn add_vm(&self, vm_id: impl Into<String>, owner: impl Into<String>) {
        self.vms.write().insert(vm_id.into(), owner.into());
    }

    /// Drop a machine
    pub fn remove_vm(&self, vm_id: &str) {
        self.vms.write().remove(vm_id);
    }
}

#[async_trait]
impl AccessResolver for StaticResolver {
    async fn account_exists(&self, account_id: &str) -> Result<bool> {
        Ok(self.accounts.read().contains(account_id))
    }

    async fn vm_exists(&self, vm_id: &str) -> Result<bool> {
        Ok(self.vms.read().contains_key(vm_id))
    }

    async fn can_access_account(&self, caller: &Caller, account_id: &str) -> Result<bool> {
        Ok(caller.account_id == account_id)
    }

    async fn can_access_vm(&self, caller: &Caller, vm_id: &str) -> Result<bool> {
        Ok(self.vms.read().get(vm_id) == Some(&caller.account_id))
    }

    async fn accounts_removed_since(&self, since_epoch_ms: i64) -> Result<Vec<String>> {
        Ok(self
            .removed
            .read()
            .iter()
            .filter(|(_, at)| *at >= since_epoch_ms)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_directory() {
        let resolver = StaticResolver::new();
        resolver.add_account("acct-1");
        resolver.add_vm("vm-1", "acct-1");

        assert!(resolver.account_exists("acct-1").await.unwrap());
        assert!(!resolver.account_exists("acct-2").await.unwrap());
        assert!(resolver.vm_exists("vm-1").await.unwrap());

        let owner = Caller::new("acct-1");
        let stranger = Caller::new("acct-2");
        assert!(resolver.can_access_vm(&owner, "vm-1").await.unwrap());
        assert!(!resolver.can_access_vm(&stranger, "vm-1").await.unwrap());
        assert!(resolver.can_access_account(&owner, "acct-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_removed_accounts_window() {
        let resolver = StaticResolver::new();
        resolver.add_account("old");
        resolver.add_account("recent");
        resolver.remove_account("old", 1_000);
        resolver.remove_account("recent", 5_000);

        let removed = resolver.accounts_removed_since(2_000).await.unwrap();
        assert_eq!(removed, vec!["recent".to_string()]);
    }
}
