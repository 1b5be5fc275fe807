use std::time::Duration;

use humantime::format_duration;
use ocguard_ocserv::OcservError;
use ocguard_quota::QuotaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Update interval must be greater than zero")]
    ZeroUpdateInterval,
    #[error("Reconciliation cycle timed out after {}", format_duration(*.0))]
    CycleTimeout(Duration),
    #[error("Failed to read ocserv sessions: {0}")]
    SnapshotError(#[from] OcservError),
    #[error("Reconciliation cycle failed: {0}")]
    CycleError(#[from] QuotaError),
    #[error("Stopped ocserv after {0} consecutive failed cycles")]
    BreakerTripped(u32),
    #[error("Failed to stop ocserv after {failures} consecutive failed cycles: {source}")]
    StopServerError { failures: u32, source: OcservError },
}
