//! Periodic cleanup of expired refresh tokens, denylist entries, and
//! sessions.
//!
//! Sweeps are idempotent deletes, so a skipped or overlapping run cannot
//! corrupt anything; a failed sweep is logged and retried on the next
//! tick.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::denylist::TokenDenylist;
use super::refresh::RefreshTokenStore;
use super::session::SessionRegistry;

/// Handle over the running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for it to finish.
    pub async fn shutdown(self) {
        // Receiver dropped means the task already exited.
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!("sweeper task did not shut down cleanly: {err}");
        }
    }
}

/// Start the sweeper loop, running one pass every `period`.
#[must_use]
pub fn spawn(
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    denylist: Arc<dyn TokenDenylist>,
    sessions: Arc<dyn SessionRegistry>,
    period: Duration,
) -> SweeperHandle {
    let (shutdown, mut stop) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is quiet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_once(&refresh_tokens, &denylist, &sessions).await;
                }
                _ = stop.changed() => {
                    info!("sweeper stopping");
                    return;
                }
            }
        }
    });
    SweeperHandle { shutdown, task }
}

async fn sweep_once(
    refresh_tokens: &Arc<dyn RefreshTokenStore>,
    denylist: &Arc<dyn TokenDenylist>,
    sessions: &Arc<dyn SessionRegistry>,
) {
    match refresh_tokens.sweep_expired().await {
        Ok(count) if count > 0 => info!(count, "swept expired refresh tokens"),
        Ok(_) => {}
        Err(err) => warn!("refresh token sweep failed: {err:#}"),
    }
    match denylist.sweep_expired().await {
        Ok(count) if count > 0 => info!(count, "swept expired denylist entries"),
        Ok(_) => {}
        Err(err) => warn!("denylist sweep failed: {err:#}"),
    }
    match sessions.sweep_expired().await {
        Ok(count) if count > 0 => info!(count, "swept expired sessions"),
        Ok(_) => {}
        Err(err) => warn!("session sweep failed: {err:#}"),
    }
}
