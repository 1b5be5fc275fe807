use std::time::Duration;

use chrono::{SubsecRound, Utc};
use humantime::format_duration;
use ocguard_common::config::OcguardConfig;
use ocguard_ocserv::VpnControl;
use ocguard_quota::{
    ConnectionStore, PackageStore, ReconciliationEngine, ReconciliationReport, UserStore,
    ingest_snapshot,
};
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, instrument};

use crate::{
    breaker::{BreakerAction, CircuitBreaker},
    error::ManagerError,
};

pub mod breaker;
pub mod error;

/// Control loop settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ManagerSettings {
    pub update_interval: Duration,
    pub update_timeout: Duration,
    pub max_failures: u32,
    pub shutdown_on_max_failures: bool,
}

impl From<&OcguardConfig> for ManagerSettings {
    fn from(config: &OcguardConfig) -> Self {
        Self {
            update_interval: *config.update_interval,
            update_timeout: *config.update_timeout,
            max_failures: config.max_failures,
            shutdown_on_max_failures: config.shutdown_on_max_failures,
        }
    }
}

/// Read the live sessions, store them and reconcile quotas, all within
/// `cycle_timeout`.
pub async fn run_cycle<S, V>(
    engine: &ReconciliationEngine<S, V>,
    cycle_timeout: Duration,
) -> Result<ReconciliationReport, ManagerError>
where
    S: ConnectionStore + PackageStore + UserStore + Sync,
    V: VpnControl + Sync,
{
    let cycle = async {
        let sessions = engine.vpn().list_sessions().await?;
        // postgres keeps microseconds, stored rows must compare equal to the cutoff
        let observed_at = Utc::now().naive_utc().trunc_subsecs(6);
        let cutoff = ingest_snapshot(engine.store(), &sessions, observed_at).await?;
        Ok::<_, ManagerError>(engine.reconcile(cutoff).await?)
    };

    timeout(cycle_timeout, cycle)
        .await
        .map_err(|_| ManagerError::CycleTimeout(cycle_timeout))?
}

/// Periodically enforce quotas until the failure limit is reached.
///
/// Returns only when the breaker trips: ocserv is stopped and an error is
/// returned so the caller can terminate. A zero update interval is rejected
/// before the first cycle.
#[instrument(skip_all)]
pub async fn run_quota_manager<S, V>(
    engine: ReconciliationEngine<S, V>,
    settings: ManagerSettings,
) -> Result<(), ManagerError>
where
    S: ConnectionStore + PackageStore + UserStore + Sync,
    V: VpnControl + Sync,
{
    if settings.update_interval.is_zero() {
        return Err(ManagerError::ZeroUpdateInterval);
    }
    info!(
        "Starting quota manager, reconciling every {} with {} timeout",
        format_duration(settings.update_interval),
        format_duration(settings.update_timeout)
    );
    let mut breaker = CircuitBreaker::new(
        settings.max_failures,
        settings.shutdown_on_max_failures,
    );
    let mut ticker = interval(settings.update_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match run_cycle(&engine, settings.update_timeout).await {
            Ok(report) => {
                breaker.record_success();
                debug!(
                    "Reconciled {} users, {} failed, {} sessions finalized",
                    report.outcomes.len(),
                    report.failed_users.len(),
                    report.finalized
                );
            }
            Err(err) => {
                let action = breaker.record_failure();
                error!(
                    "Reconciliation cycle failed ({}/{} consecutive failures): {err}",
                    breaker.failures(),
                    breaker.max_failures()
                );
                if action == BreakerAction::Shutdown {
                    let failures = breaker.failures();
                    error!("Too many consecutive failures, stopping ocserv");
                    engine
                        .vpn()
                        .stop_server()
                        .await
                        .map_err(|source| ManagerError::StopServerError { failures, source })?;
                    return Err(ManagerError::BreakerTripped(failures));
                }
            }
        }
    }
}
