//! Scheduler daemon: owns the provider pool manager and the dispatch loop
//! that feeds it pending tasks (§2 item 9, §4.5). The sibling `fleetctl-sweeper`
//! binary owns the maintenance sweeps (reservations, contexts, timeouts).

mod dispatch;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use fleetctl::config::FleetConfig;
use fleetctl::context::TaskContextManager;
use fleetctl::driver::registry::DriverRegistry;
use fleetctl::pool::ProviderPoolManager;
use fleetctl::scheduler_trigger::{PoolDispatchTrigger, SchedulerTrigger};
use fleetctl::task_service::TaskService;
use tokio::sync::OnceCell;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fleetctl-scheduler")]
#[command(about = "Dispatches pending tasks onto per-provider worker pools")]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "FLEETCTL_LOG_DIR", default_value = "/var/log/fleetctl")]
    log_dir: String,
}

/// Forwards to a `PoolDispatchTrigger` once the pool manager it wraps
/// exists. `TaskService` needs a trigger at construction time, but the pool
/// manager needs the handler (which needs the `TaskService`) before it can
/// be built — this cell breaks that cycle. Before `set` is called, `notify`
/// is a harmless no-op (nothing could have been dispatched yet anyway).
struct DeferredTrigger {
    inner: OnceCell<PoolDispatchTrigger>,
}

impl DeferredTrigger {
    fn new() -> Self {
        DeferredTrigger { inner: OnceCell::new() }
    }

    fn set(&self, pool_manager: Arc<ProviderPoolManager>, db: sqlx::MySqlPool) {
        let _ = self.inner.set(PoolDispatchTrigger::new(pool_manager, db));
    }
}

#[async_trait]
impl SchedulerTrigger for DeferredTrigger {
    async fn notify(&self, provider_id: Option<&str>) {
        if let Some(trigger) = self.inner.get() {
            trigger.notify(provider_id).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _ = fleetctl::logging::init_service_logging(&args.log_dir, "fleetctl_scheduler");

    let (config, config_path) = FleetConfig::load_default()?;
    info!("loaded config from {}", config_path.display());
    let config = Arc::new(config);

    let db = fleetctl::init_database(&args.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("database init failed: {e}"))?;
    let db_pool = (*db).clone();

    let context_manager = TaskContextManager::new();
    let registry = Arc::new(DriverRegistry::new(config.ssh.clone()));

    let deferred_trigger = Arc::new(DeferredTrigger::new());
    let task_service = TaskService::new(
        db_pool.clone(),
        config.clone(),
        context_manager.clone(),
        deferred_trigger.clone(),
    );
    let handler = dispatch::build_handler(db_pool.clone(), task_service, registry);
    let pool_manager = Arc::new(ProviderPoolManager::new(
        config.pool.clone(),
        handler,
        context_manager.clone(),
    ));
    deferred_trigger.set(pool_manager.clone(), db_pool.clone());

    let startup_trigger = PoolDispatchTrigger::new(pool_manager.clone(), db_pool.clone());
    notify_all_pending(&db_pool, &startup_trigger).await;

    let shutdown_manager = pool_manager.clone();
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        let manager = shutdown_manager.clone();
        tokio::spawn(async move {
            manager.shutdown().await;
            std::process::exit(0);
        });
    })?;

    run_dispatch_loop(db_pool, pool_manager, context_manager).await
}

/// Dispatches every provider with at least one pending task. Covers both
/// the startup catch-up pass and the regular poll tick (§4 "idempotent to
/// tolerate worker crash-restart").
async fn notify_all_pending(db: &sqlx::MySqlPool, trigger: &PoolDispatchTrigger) {
    let providers: std::result::Result<Vec<String>, sqlx::Error> = sqlx::query_scalar(
        "SELECT DISTINCT provider_id FROM tasks WHERE status = 'pending' AND provider_id IS NOT NULL",
    )
    .fetch_all(db)
    .await;

    match providers {
        Ok(providers) => {
            for provider_id in providers {
                trigger.notify(Some(&provider_id)).await;
            }
        }
        Err(e) => error!("failed to list providers with pending tasks: {}", e),
    }
}

/// Polls for pending tasks every second, reaps idle/missing pools every 5
/// minutes, and sweeps stale cancellation contexts every 30s (§4.6) using
/// separate `Instant` trackers per cadence. The context sweep lives here
/// rather than in `fleetctl-sweeper` because the registry it operates on
/// only exists in this process.
async fn run_dispatch_loop(
    db: sqlx::MySqlPool,
    pool_manager: Arc<ProviderPoolManager>,
    context_manager: TaskContextManager,
) -> Result<()> {
    let trigger = PoolDispatchTrigger::new(pool_manager.clone(), db.clone());
    let mut last_reap = Instant::now();
    let mut last_context_sweep = Instant::now();

    loop {
        notify_all_pending(&db, &trigger).await;

        if last_reap.elapsed() >= Duration::from_secs(300) {
            pool_manager.reap_idle().await;
            if let Err(e) = pool_manager.reap_missing_providers(&db).await {
                error!("reap_missing_providers failed: {}", e);
            }
            last_reap = Instant::now();
        }

        if last_context_sweep.elapsed() >= Duration::from_secs(30) {
            context_manager.sweep().await;
            last_context_sweep = Instant::now();
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
