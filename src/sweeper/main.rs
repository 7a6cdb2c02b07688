//! Sweeper daemon: the maintenance half of the scheduler split (§2
//! supplemented features, §4.4 "Timeouts"). Runs independently of
//! `fleetctl-scheduler` on its own multi-cadence loop, mirroring the
//! teacher's `SandboxManager::run` `Instant`-tracker style
//! (`last_auto_stop`/`last_health`/`last_task_timeout`).
//!
//! `TaskContextManager` lives in-process only, so this binary cannot share
//! the scheduler's registry across the process boundary; it runs with its
//! own (always-empty) one purely to satisfy `TaskService`'s constructor.
//! `Task::force_fail`'s cancellation signal is a courtesy for any worker in
//! this same process, which never happens here — the cleanup it drives
//! (instance status revert, quota/reservation release, DB row update) does
//! not depend on it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use fleetctl::config::FleetConfig;
use fleetctl::context::TaskContextManager;
use fleetctl::model::{Task, User};
use fleetctl::quota;
use fleetctl::reservation_store;
use fleetctl::scheduler_trigger::SchedulerTrigger;
use fleetctl::task_service::TaskService;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fleetctl-sweeper")]
#[command(about = "Reclaims expired reservations, timed-out tasks, and stale quota counters")]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "FLEETCTL_LOG_DIR", default_value = "/var/log/fleetctl")]
    log_dir: String,
}

/// The sweeper has no pool manager to wake; the scheduler's own 1s poll
/// loop picks up whatever this process changes within a second anyway.
struct NoopTrigger;

#[async_trait]
impl SchedulerTrigger for NoopTrigger {
    async fn notify(&self, _provider_id: Option<&str>) {}
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _ = fleetctl::logging::init_service_logging(&args.log_dir, "fleetctl_sweeper");

    let (config, config_path) = FleetConfig::load_default()?;
    info!("loaded config from {}", config_path.display());
    let config = Arc::new(config);

    let db = fleetctl::init_database(&args.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("database init failed: {e}"))?;
    let db_pool = (*db).clone();

    let task_service = TaskService::new(
        db_pool.clone(),
        config,
        TaskContextManager::new(),
        Arc::new(NoopTrigger),
    );

    run_sweep_loop(db_pool, task_service).await
}

const RESERVATION_SWEEP_SECS: u64 = 300;
const TIMEOUT_SWEEP_SECS: u64 = 60;
const QUOTA_RECALC_SECS: u64 = 300;

async fn run_sweep_loop(db: sqlx::MySqlPool, task_service: TaskService) -> Result<()> {
    let mut last_reservation_sweep = Instant::now();
    let mut last_timeout_sweep = Instant::now();
    let mut last_quota_recalc = Instant::now();

    loop {
        if last_reservation_sweep.elapsed() >= Duration::from_secs(RESERVATION_SWEEP_SECS) {
            sweep_reservations(&db).await;
            last_reservation_sweep = Instant::now();
        }

        if last_timeout_sweep.elapsed() >= Duration::from_secs(TIMEOUT_SWEEP_SECS) {
            sweep_timed_out_tasks(&db, &task_service).await;
            last_timeout_sweep = Instant::now();
        }

        if last_quota_recalc.elapsed() >= Duration::from_secs(QUOTA_RECALC_SECS) {
            recalculate_drifted_quotas(&db).await;
            last_quota_recalc = Instant::now();
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn sweep_reservations(db: &sqlx::MySqlPool) {
    if let Err(e) = reservation_store::sweep_expired(db).await {
        error!("reservation sweep failed: {}", e);
    }
}

async fn sweep_timed_out_tasks(db: &sqlx::MySqlPool, task_service: &TaskService) {
    let timed_out = match Task::fetch_timed_out(db).await {
        Ok(tasks) => tasks,
        Err(e) => {
            error!("failed to list timed-out tasks: {}", e);
            return;
        }
    };

    for task in timed_out {
        if let Err(e) = task_service.fail_timed_out_task(&task.id).await {
            error!("failed to reap timed-out task {}: {}", task.id, e);
        } else {
            info!("reaped timed-out task {} ({})", task.id, task.task_type);
        }
    }
}

async fn recalculate_drifted_quotas(db: &sqlx::MySqlPool) {
    let user_ids = match User::fetch_ids_with_pending_quota(db).await {
        Ok(ids) => ids,
        Err(e) => {
            error!("failed to list users for quota recalculation: {}", e);
            return;
        }
    };

    for user_id in user_ids {
        if let Err(e) = quota::recalculate(db, &user_id).await {
            error!("quota recalculation failed for user {}: {}", user_id, e);
        }
    }
}
