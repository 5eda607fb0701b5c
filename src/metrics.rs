//! Prometheus counters for backups, restores and lock contention.
//!
//! Each [`VaultMetrics`] registers its collectors on its own [`Registry`],
//! so several managers (or tests) in one process never share counts. Hand
//! the registry to an exporter, or call [`VaultMetrics::encode`] for the
//! text exposition format.

use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::audit::AuditOutcome;
use crate::backup::BackendKind;
use crate::{Result, VaultError};

/// Backup, restore and lock-contention metrics
#[derive(Clone)]
pub struct VaultMetrics {
    registry: Registry,
    backups: IntCounterVec,
    restores: IntCounterVec,
    lock_contention: IntCounterVec,
    duration: HistogramVec,
}

impl VaultMetrics {
    /// Metrics on a fresh registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register the collectors on `registry`
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let backups = IntCounterVec::new(
            Opts::new("configvault_backups_total", "Backup requests by backend and outcome"),
            &["backend_kind", "outcome"],
        )?;
        let restores = IntCounterVec::new(
            Opts::new("configvault_restores_total", "Restore requests by backend, kind and outcome"),
            &["backend_kind", "dry_run", "outcome"],
        )?;
        let lock_contention = IntCounterVec::new(
            Opts::new(
                "configvault_lock_contention_total",
                "Operations aborted because the environment lock stayed busy",
            ),
            &["operation"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("configvault_operation_duration_seconds", "Backup and restore duration in seconds")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
            &["operation"],
        )?;

        registry.register(Box::new(backups.clone()))?;
        registry.register(Box::new(restores.clone()))?;
        registry.register(Box::new(lock_contention.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            backups,
            restores,
            lock_contention,
            duration,
        })
    }

    /// Registry holding every collector
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count one finished backup request
    pub fn record_backup(&self, backend_kind: BackendKind, result: &Result<impl Sized>, elapsed: Duration) {
        let outcome = outcome_label(result);
        self.backups
            .with_label_values(&[backend_kind.as_str(), outcome])
            .inc();
        self.duration.with_label_values(&["backup"]).observe(elapsed.as_secs_f64());
        if is_contention(result) {
            self.lock_contention.with_label_values(&["backup"]).inc();
        }
    }

    /// Count one finished restore request
    pub fn record_restore(
        &self,
        backend_kind: BackendKind,
        dry_run: bool,
        result: &Result<impl Sized>,
        elapsed: Duration,
    ) {
        let outcome = outcome_label(result);
        let dry_run = if dry_run { "true" } else { "false" };
        self.restores
            .with_label_values(&[backend_kind.as_str(), dry_run, outcome])
            .inc();
        self.duration.with_label_values(&["restore"]).observe(elapsed.as_secs_f64());
        if is_contention(result) {
            self.lock_contention.with_label_values(&["restore"]).inc();
        }
    }

    /// Backups counted so far for one backend and outcome
    pub fn backups(&self, backend_kind: BackendKind, outcome: AuditOutcome) -> u64 {
        self.backups
            .with_label_values(&[backend_kind.as_str(), outcome.as_str()])
            .get()
    }

    /// Restores counted so far for one backend and outcome, dry runs included
    pub fn restores(&self, backend_kind: BackendKind, outcome: AuditOutcome) -> u64 {
        ["true", "false"]
            .iter()
            .map(|dry_run| {
                self.restores
                    .with_label_values(&[backend_kind.as_str(), *dry_run, outcome.as_str()])
                    .get()
            })
            .sum()
    }

    /// Lock contentions counted for `operation` (`backup` or `restore`)
    pub fn lock_contention(&self, operation: &str) -> u64 {
        self.lock_contention.with_label_values(&[operation]).get()
    }

    /// Text exposition of every collector
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| VaultError::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}

fn outcome_label<T>(result: &Result<T>) -> &'static str {
    let outcome = match result {
        Ok(_) => AuditOutcome::Succeeded,
        Err(VaultError::PartialApplyFailure { .. }) => AuditOutcome::PartiallyApplied,
        Err(_) => AuditOutcome::Failed,
    };
    outcome.as_str()
}

fn is_contention<T>(result: &Result<T>) -> bool {
    matches!(result, Err(error) if matches!(error.root(), VaultError::LockContention { .. }))
}
