//! KVGrid Control Daemon
//!
//! Runs the coordination core of the storage control plane: the metadata
//! cache with its invalidation updater, and the lock-guarded maintenance
//! jobs. The management API command layer and the platform's account/VM
//! directory live in the host process; the daemon wires an empty directory
//! behind the access seam until the host plugs in its own.

use anyhow::Result;
use clap::Parser;
use kvgrid_common::Config;
use kvgrid_maintenance::{JobKind, JobScheduler, LockManager};
use kvgrid_registry::{AccessResolver, CacheUpdater, StaticResolver, StorageCache, StorageManager};
use kvgrid_store::{DocStore, HttpDocStore, ValueClient};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kvgrid-controld")]
#[command(about = "KVGrid storage control-plane daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/kvgrid/controld.toml")]
    config: String,

    /// Document store endpoints (overrides the config file)
    #[arg(long)]
    store_endpoint: Vec<String>,

    /// Value backend base URL (overrides the config file)
    #[arg(long)]
    value_backend: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = config::Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(config::Environment::with_prefix("KVGRID").separator("__"))
        .build()?
        .try_deserialize()?;

    if !args.store_endpoint.is_empty() {
        config.store.endpoints = args.store_endpoint.clone();
    }
    if let Some(url) = &args.value_backend {
        config.value_backend.base_url.clone_from(url);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    info!(
        endpoints = ?config.store.endpoints,
        registry = %config.store.registry_index,
        "starting kvgrid control daemon"
    );

    let store: Arc<dyn DocStore> = Arc::new(HttpDocStore::new(&config.store)?);
    let values = Arc::new(ValueClient::new(&config.value_backend)?);
    // Integration point for the host platform's directory; empty means
    // every ownership check denies.
    let resolver: Arc<dyn AccessResolver> = Arc::new(StaticResolver::new());

    let cache = Arc::new(StorageCache::new(
        store.clone(),
        resolver.clone(),
        config.store.registry_index.clone(),
        config.cache.clone(),
    ));
    let manager = Arc::new(StorageManager::new(
        store.clone(),
        cache.clone(),
        resolver.clone(),
        values,
        &config,
    ));
    let updater = Arc::new(CacheUpdater::new(
        store.clone(),
        cache.clone(),
        &config.store,
        &config.cache,
    ));
    let locks = Arc::new(LockManager::new(
        store.clone(),
        config.store.lock_index.clone(),
        config.jobs.clone(),
    ));

    let mut scheduler = JobScheduler::new(locks, config.jobs.clone());
    {
        let m = manager.clone();
        scheduler.register(JobKind::TempStorageExpiry, move || {
            let m = m.clone();
            async move { m.expire_temp_storages().await }
        });
    }
    {
        let m = manager.clone();
        scheduler.register(JobKind::StorageCleanup, move || {
            let m = m.clone();
            async move { m.purge_deleted_storages().await }
        });
    }
    {
        let m = manager.clone();
        scheduler.register(JobKind::VmStorageCleanup, move || {
            let m = m.clone();
            async move { m.cleanup_vm_storages().await }
        });
    }
    {
        let m = manager.clone();
        scheduler.register(JobKind::AccountStorageCleanup, move || {
            let m = m.clone();
            async move { m.cleanup_removed_account_storages().await }
        });
    }
    let scheduler = Arc::new(scheduler);

    tokio::spawn(cache.clone().sweep_loop());
    tokio::spawn(updater.run_loop());
    let job_handles = scheduler.spawn_all();
    info!(jobs = job_handles.len(), "maintenance jobs scheduled");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
