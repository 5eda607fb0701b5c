use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{DistributedLock, LockToken};
use crate::{Result, VaultError};

/// A held lease.
///
/// While alive, an optional keeper task renews the lease every
/// `renew_every`. If the keeper finds the lease gone it flags the guard as
/// lost; callers check [`LockGuard::ensure_held`] before every mutating
/// step. Dropping the guard without calling [`LockGuard::release`] (for
/// example when the owning future is cancelled) spawns a best-effort
/// release on the current runtime.
pub struct LockGuard {
    lock: DistributedLock,
    token: Arc<Mutex<LockToken>>,
    lost: Arc<AtomicBool>,
    keeper: Option<JoinHandle<()>>,
    released: bool,
}

impl LockGuard {
    pub(super) fn new(lock: DistributedLock, token: LockToken, renew_every: Option<Duration>) -> Self {
        let token = Arc::new(Mutex::new(token));
        let lost = Arc::new(AtomicBool::new(false));

        let keeper = renew_every.map(|every| {
            tokio::spawn(keep_alive(lock.clone(), token.clone(), lost.clone(), every))
        });

        Self {
            lock,
            token,
            lost,
            keeper,
            released: false,
        }
    }

    /// Snapshot of the current token (updated by renewals)
    pub fn token(&self) -> LockToken {
        self.token.lock().clone()
    }

    /// Whether renewal has failed
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst) || self.token.lock().lease_expiry() <= Utc::now()
    }

    /// Fails with [`VaultError::LeaseLost`] once the lease expired or was taken over
    pub fn ensure_held(&self) -> Result<()> {
        if self.is_lost() {
            let token = self.token();
            return Err(VaultError::LeaseLost {
                environment: token.environment().to_string(),
                holder_id: token.holder_id().to_string(),
            });
        }
        Ok(())
    }

    /// Stop renewing and release the lease
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if let Some(keeper) = self.keeper.take() {
            keeper.abort();
        }
        let token = self.token();
        self.lock.release(&token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(keeper) = self.keeper.take() {
            keeper.abort();
        }
        if self.released {
            return;
        }

        let token = self.token();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let lock = self.lock.clone();
                handle.spawn(async move {
                    if let Err(error) = lock.release(&token).await {
                        warn!(
                            environment = token.environment(),
                            error = %error,
                            "Release after drop failed; lease will expire on its own"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    environment = token.environment(),
                    lease_expiry = %token.lease_expiry(),
                    "Lock guard dropped outside a runtime; lease will expire on its own"
                );
            }
        }
    }
}

async fn keep_alive(
    lock: DistributedLock,
    token: Arc<Mutex<LockToken>>,
    lost: Arc<AtomicBool>,
    every: Duration,
) {
    loop {
        tokio::time::sleep(every).await;

        let current = token.lock().clone();
        match lock.renew(&current).await {
            Ok(renewed) => {
                *token.lock() = renewed;
            }
            Err(VaultError::LeaseLost { .. }) => {
                warn!(
                    environment = current.environment(),
                    holder_id = current.holder_id(),
                    "Lease lost while held"
                );
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(error) => {
                // Try again next tick; an expired lease shows up as LeaseLost then
                debug!(environment = current.environment(), error = %error, "Lease renewal failed");
            }
        }
    }
}
