//! Distributed lease lock.
//!
//! One live lock record per environment, written only through a
//! conditional compare-and-set on the lock store. Expired leases are
//! logically absent and may be taken over by any caller. There is no
//! manual unlock path: a crashed holder is recovered once its lease runs out.

mod guard;
mod memory;
mod redis;

pub use guard::LockGuard;
pub use memory::MemoryLockStore;
pub use redis::{RedisLockConfig, RedisLockStore};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::resilience::RetryConfig;
use crate::{Result, VaultError};

/// Persisted lock record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Environment the lock serializes
    pub environment: String,
    /// Process holding the lease
    pub holder_id: String,
    /// Fencing token, fresh for every acquisition
    pub lease_id: Uuid,
    /// When the lease was taken
    pub acquired_at: DateTime<Utc>,
    /// When the lease runs out unless renewed
    pub lease_expiry: DateTime<Utc>,
}

impl LockRecord {
    /// Whether the lease is still valid at `now`
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry > now
    }
}

/// Proof of holding the lock for one environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    record: LockRecord,
    lease: Duration,
}

impl LockToken {
    /// Locked environment
    pub fn environment(&self) -> &str {
        &self.record.environment
    }

    /// Holder of the lease
    pub fn holder_id(&self) -> &str {
        &self.record.holder_id
    }

    /// Fencing token of this acquisition
    pub fn lease_id(&self) -> Uuid {
        self.record.lease_id
    }

    /// Current expiry
    pub fn lease_expiry(&self) -> DateTime<Utc> {
        self.record.lease_expiry
    }

    /// Underlying lock record
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Lease length used for renewals
    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn lost(&self) -> VaultError {
        VaultError::LeaseLost {
            environment: self.record.environment.clone(),
            holder_id: self.record.holder_id.clone(),
        }
    }
}

/// Result of a single acquisition attempt
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// The lease is ours
    Acquired(LockToken),
    /// Someone else holds a live lease
    Busy(LockRecord),
}

/// Conditional-write store for lock records.
///
/// `compare_and_set` must be atomic: it replaces the record for
/// `environment` with `new` (or deletes it when `new` is `None`) only if
/// the stored record's lease id equals `expected_lease`, where `None`
/// means "no record stored".
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Current record, if any
    async fn get(&self, environment: &str) -> Result<Option<LockRecord>>;

    /// Replace the record only if the stored lease id equals `expected`
    async fn compare_and_set(
        &self,
        environment: &str,
        expected_lease: Option<Uuid>,
        new: Option<&LockRecord>,
    ) -> Result<bool>;
}

/// Lock settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease length for backup and restore operations
    pub lease_seconds: u64,
    /// Renew held leases in the background while an operation runs
    pub keep_alive: bool,
    /// Bounded retries with backoff while the lock is busy
    pub acquire_retry: RetryConfig,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 300,
            keep_alive: true,
            acquire_retry: RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
                backoff_multiplier: 2.0,
                jitter: true,
            },
        }
    }
}

impl LockConfig {
    /// Lease length as a [`Duration`]
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }
}

/// Exclusive, lease-based lock keyed by environment
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    config: LockConfig,
}

impl DistributedLock {
    /// Lock over `store`
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Lock settings
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Current live holder of the environment's lock, if any
    pub async fn holder(&self, environment: &str) -> Result<Option<LockRecord>> {
        let now = Utc::now();
        Ok(self
            .store
            .get(environment)
            .await?
            .filter(|record| record.is_live_at(now)))
    }

    /// One acquisition attempt: succeeds if no live record exists, stealing
    /// an expired one if necessary.
    pub async fn try_acquire(
        &self,
        environment: &str,
        holder_id: &str,
        lease: Duration,
    ) -> Result<AcquireOutcome> {
        let now = Utc::now();
        let current = self.store.get(environment).await?;

        if let Some(ref existing) = current {
            if existing.is_live_at(now) {
                return Ok(AcquireOutcome::Busy(existing.clone()));
            }
            info!(
                environment,
                previous_holder = %existing.holder_id,
                expired_at = %existing.lease_expiry,
                "Reclaiming expired lease"
            );
        }

        let record = LockRecord {
            environment: environment.to_string(),
            holder_id: holder_id.to_string(),
            lease_id: Uuid::new_v4(),
            acquired_at: now,
            lease_expiry: now + to_chrono(lease)?,
        };

        let expected = current.as_ref().map(|r| r.lease_id);
        if self.store.compare_and_set(environment, expected, Some(&record)).await? {
            debug!(environment, holder_id, lease_id = %record.lease_id, "Lock acquired");
            return Ok(AcquireOutcome::Acquired(LockToken { record, lease }));
        }

        // Lost the race; report whoever won
        match self.store.get(environment).await? {
            Some(winner) => Ok(AcquireOutcome::Busy(winner)),
            None => Ok(AcquireOutcome::Busy(record)),
        }
    }

    /// Acquire with bounded retries and exponential backoff.
    ///
    /// Surfaces [`VaultError::LockContention`] when every attempt finds
    /// the lock busy; never blocks indefinitely.
    #[instrument(skip(self))]
    pub async fn acquire(&self, environment: &str, holder_id: &str, lease: Duration) -> Result<LockToken> {
        let retry = &self.config.acquire_retry;
        let max_attempts = retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.try_acquire(environment, holder_id, lease).await {
                Ok(AcquireOutcome::Acquired(token)) => return Ok(token),
                Ok(AcquireOutcome::Busy(holder)) => {
                    debug!(
                        environment,
                        attempt,
                        current_holder = %holder.holder_id,
                        lease_expiry = %holder.lease_expiry,
                        "Lock busy"
                    );
                }
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    warn!(environment, attempt, error = %error, "Lock store unavailable");
                }
                Err(error) => return Err(error),
            }

            if attempt < max_attempts {
                tokio::time::sleep(retry.delay_after(attempt)).await;
            }
        }

        warn!(environment, holder_id, attempts = max_attempts, "Giving up on lock acquisition");
        Err(VaultError::LockContention {
            environment: environment.to_string(),
            attempts: max_attempts,
        })
    }

    /// Acquire and wrap the token in a guard that renews the lease in the
    /// background (when `keep_alive` is set) and releases on drop.
    pub async fn acquire_guard(&self, environment: &str, holder_id: &str) -> Result<LockGuard> {
        let lease = self.config.lease();
        let token = self.acquire(environment, holder_id, lease).await?;
        let renew_every = if self.config.keep_alive { Some(lease / 3) } else { None };
        Ok(LockGuard::new(self.clone(), token, renew_every))
    }

    /// Extend a held lease by its original length
    pub async fn renew(&self, token: &LockToken) -> Result<LockToken> {
        let now = Utc::now();
        let current = self.store.get(token.environment()).await?;

        match current {
            Some(ref record) if record.lease_id == token.lease_id() && record.is_live_at(now) => {}
            _ => return Err(token.lost()),
        }

        let renewed = LockRecord {
            lease_expiry: now + to_chrono(token.lease)?,
            ..token.record.clone()
        };

        if self
            .store
            .compare_and_set(token.environment(), Some(token.lease_id()), Some(&renewed))
            .await?
        {
            debug!(environment = token.environment(), lease_expiry = %renewed.lease_expiry, "Lease renewed");
            Ok(LockToken {
                record: renewed,
                lease: token.lease,
            })
        } else {
            Err(token.lost())
        }
    }

    /// Release a held lease
    pub async fn release(&self, token: &LockToken) -> Result<()> {
        if self
            .store
            .compare_and_set(token.environment(), Some(token.lease_id()), None)
            .await?
        {
            debug!(environment = token.environment(), lease_id = %token.lease_id(), "Lock released");
            Ok(())
        } else {
            Err(token.lost())
        }
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|_| VaultError::Validation(format!("lease of {:?} is out of range", duration)))
}
