//! Quota enforcement: snapshot ingestion, reconciliation of live sessions
//! against traffic packages and account management.

pub mod accounts;
pub mod error;
pub mod ingest;
pub mod reconcile;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod waterfall;

pub use crate::{
    error::QuotaError,
    ingest::ingest_snapshot,
    reconcile::{DisconnectReason, ReconciliationEngine, ReconciliationReport, UserOutcome},
    store::{ConnectionStore, PackageStore, PgStore, UserStore},
};
