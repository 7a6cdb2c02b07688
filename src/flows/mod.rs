//! Long-running operation flows (§4.8): create, delete, reset, and
//! port-mapping apply/remove. Each flow owns its task's full lifecycle —
//! progress milestones, the remote driver calls, DB state transitions, and
//! calling back into `TaskService::complete_task` itself — so the pool
//! worker that invokes a flow only needs the task id and a cancellation
//! token.

pub mod create;
pub mod delete;
pub mod instance_ops;
pub mod port;
pub mod reset;

use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::driver::Driver;
use crate::error::{CoreError, Result};

/// Polls `driver.health_probe` every 10s up to `ceiling_secs` (§4.8.1 step 5,
/// §5 "status polls bound at 90s"). Returns `Ok(false)` on timeout,
/// `Err(Cancelled)` if the token fires first.
pub(crate) async fn wait_until_healthy(
    driver: &dyn Driver,
    backend_id: &str,
    ceiling_secs: u64,
    cancel: &CancellationToken,
) -> Result<bool> {
    let start = Instant::now();
    loop {
        if driver.health_probe(backend_id).await.unwrap_or(false) {
            return Ok(true);
        }
        if start.elapsed().as_secs() >= ceiling_secs {
            return Ok(false);
        }
        tokio::select! {
            _ = sleep(Duration::from_secs(10)) => {}
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        }
    }
}

/// Sleeps for `secs`, returning early with `Cancelled` if the token fires
/// first (the various "wait Ns, cancellable" steps in §4.8.1-§4.8.3).
pub(crate) async fn cancellable_sleep(secs: u64, cancel: &CancellationToken) -> Result<()> {
    if secs == 0 {
        return Ok(());
    }
    tokio::select! {
        _ = sleep(Duration::from_secs(secs)) => Ok(()),
        _ = cancel.cancelled() => Err(CoreError::Cancelled),
    }
}

/// Generates a fresh alphanumeric password to hand to `set_password` during
/// create/reset. There is no credential store in this core (out of scope);
/// the value is only ever pushed to the backend and persisted on the row.
pub(crate) fn generate_password() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
