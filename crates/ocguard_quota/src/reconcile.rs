use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
};

use chrono::NaiveDateTime;
use ocguard_common::{
    db::{Connection, ConnectionFilter, Id, User, UserPackages},
    units::format_bytes,
};
use ocguard_ocserv::VpnControl;
use tracing::{debug, error, info, warn};

use crate::{
    error::QuotaError,
    store::{ConnectionStore, PackageStore, UserStore},
    waterfall::{Debit, TrafficUsage, plan_cascade, remaining_traffic},
};

/// Why a user was disconnected and locked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    UnknownUser,
    Banned,
    NoPackage,
    /// Usage went over the active package.
    QuotaExhausted,
    /// Reserved packages could not absorb the overage.
    ReservedExhausted,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::UnknownUser => "unknown user",
            Self::Banned => "user is banned",
            Self::NoPackage => "no eligible package",
            Self::QuotaExhausted => "active package exhausted",
            Self::ReservedExhausted => "reserved packages exhausted",
        };
        f.write_str(reason)
    }
}

/// What happened to a single user during a reconciliation pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UserOutcome {
    WithinQuota { remaining: i64 },
    /// Overage charged to reserved packages, sessions stay up.
    Absorbed { debits: Vec<Debit> },
    Disconnected(DisconnectReason),
}

#[derive(Clone, Debug, Default)]
pub struct ReconciliationReport {
    pub outcomes: BTreeMap<String, UserOutcome>,
    // users whose reconciliation failed and was skipped
    pub failed_users: Vec<String>,
    // rows closed because they were missing from the latest snapshot
    pub finalized: usize,
}

impl ReconciliationReport {
    #[must_use]
    pub fn outcome(&self, username: &str) -> Option<&UserOutcome> {
        self.outcomes.get(username)
    }

    #[must_use]
    pub fn disconnected_users(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, UserOutcome::Disconnected(_)))
            .map(|(username, _)| username.as_str())
            .collect()
    }
}

/// Applies quota rules to connected users.
///
/// Sessions are grouped per username. Users which are unknown, banned, without
/// an eligible package or over their quota get all sessions dropped and their
/// account locked. Users without an active package have their usage charged to
/// reserved packages, shortest duration first.
pub struct ReconciliationEngine<S, V> {
    store: S,
    vpn: V,
}

impl<S, V> ReconciliationEngine<S, V>
where
    S: ConnectionStore + PackageStore + UserStore + Sync,
    V: VpnControl + Sync,
{
    #[must_use]
    pub fn new(store: S, vpn: V) -> Self {
        Self { store, vpn }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn vpn(&self) -> &V {
        &self.vpn
    }

    /// Run a single pass over all connected rows.
    ///
    /// `cutoff` is the timestamp of the latest ingested snapshot. Failures of
    /// the initial reads abort the pass, failures for a single user are logged
    /// and reported.
    pub async fn reconcile(
        &self,
        cutoff: NaiveDateTime,
    ) -> Result<ReconciliationReport, QuotaError> {
        let connected = self
            .store
            .list_connected(&ConnectionFilter::default())
            .await?;
        debug!("Reconciling {} connected sessions", connected.len());

        let mut by_user: BTreeMap<String, Vec<&Connection<Id>>> = BTreeMap::new();
        for connection in &connected {
            by_user
                .entry(connection.username.clone())
                .or_default()
                .push(connection);
        }

        let usernames: Vec<String> = by_user.keys().cloned().collect();
        let users: HashMap<String, User<Id>> = self
            .store
            .list_users_by_usernames(&usernames)
            .await?
            .into_iter()
            .map(|user| (user.username.clone(), user))
            .collect();

        let user_ids: Vec<Id> = users
            .values()
            .filter(|user| !user.is_banned())
            .map(|user| user.id)
            .collect();
        let mut packages = self.store.list_eligible_packages(&user_ids).await?;

        let mut report = ReconciliationReport::default();
        let mut closed: HashSet<Id> = HashSet::new();

        for (username, connections) in &by_user {
            let user_packages = users
                .get(username)
                .and_then(|user| packages.remove(&user.id));
            match self
                .reconcile_user(
                    username,
                    users.get(username),
                    user_packages,
                    connections,
                    &mut closed,
                )
                .await
            {
                Ok(outcome) => {
                    report.outcomes.insert(username.clone(), outcome);
                }
                Err(err) => {
                    error!("Failed to reconcile sessions of user {username}: {err}");
                    report.failed_users.push(username.clone());
                }
            }
        }

        report.finalized = self.finalize(&connected, cutoff, &closed).await;

        Ok(report)
    }

    async fn reconcile_user(
        &self,
        username: &str,
        user: Option<&User<Id>>,
        packages: Option<UserPackages>,
        connections: &[&Connection<Id>],
        closed: &mut HashSet<Id>,
    ) -> Result<UserOutcome, QuotaError> {
        let Some(user) = user else {
            return self
                .disconnect_and_lock(username, connections, DisconnectReason::UnknownUser, closed)
                .await;
        };
        if user.is_banned() {
            return self
                .disconnect_and_lock(username, connections, DisconnectReason::Banned, closed)
                .await;
        }
        let packages = match packages {
            Some(packages) if !packages.is_empty() => packages,
            _ => {
                return self
                    .disconnect_and_lock(username, connections, DisconnectReason::NoPackage, closed)
                    .await;
            }
        };

        let usage = TrafficUsage::from_connections(connections.iter().copied());
        let remaining = remaining_traffic(packages.active.as_ref(), usage.total());
        debug!(
            "User {username} used {} in {} sessions, remaining: {remaining} bytes",
            format_bytes(usage.total()),
            connections.len()
        );

        if remaining >= 0 {
            return Ok(UserOutcome::WithinQuota { remaining });
        }

        if packages.active.is_some() {
            return self
                .disconnect_and_lock(
                    username,
                    connections,
                    DisconnectReason::QuotaExhausted,
                    closed,
                )
                .await;
        }

        let plan = plan_cascade(&packages.reserved, -remaining, usage);
        for debit in &plan.debits {
            debug!(
                "Charging {} bytes of user {username} to reserved package {}",
                debit.total(),
                debit.package_id
            );
            self.store
                .debit_package(debit.package_id, debit.download, debit.upload)
                .await?;
        }

        if plan.is_fully_absorbed() {
            Ok(UserOutcome::Absorbed { debits: plan.debits })
        } else {
            warn!(
                "Reserved packages of user {username} could not absorb {} bytes",
                plan.unabsorbed
            );
            self.disconnect_and_lock(
                username,
                connections,
                DisconnectReason::ReservedExhausted,
                closed,
            )
            .await
        }
    }

    async fn disconnect_and_lock(
        &self,
        username: &str,
        connections: &[&Connection<Id>],
        reason: DisconnectReason,
        closed: &mut HashSet<Id>,
    ) -> Result<UserOutcome, QuotaError> {
        info!("Disconnecting and locking user {username}: {reason}");
        self.vpn.disconnect_user(username).await?;
        self.vpn.lock_user(username).await?;

        for connection in connections {
            self.store
                .mark_disconnected(
                    connection.id,
                    connection.download_traffic_usage,
                    connection.upload_traffic_usage,
                )
                .await?;
            closed.insert(connection.id);
        }

        Ok(UserOutcome::Disconnected(reason))
    }

    /// Close rows which were not refreshed by the snapshot taken at `cutoff`.
    async fn finalize(
        &self,
        connected: &[Connection<Id>],
        cutoff: NaiveDateTime,
        closed: &HashSet<Id>,
    ) -> usize {
        let mut finalized = 0;
        for connection in connected
            .iter()
            .filter(|connection| connection.updated_at < cutoff && !closed.contains(&connection.id))
        {
            debug!("Session {connection} ended, storing final usage");
            match self
                .store
                .mark_disconnected(
                    connection.id,
                    connection.download_traffic_usage,
                    connection.upload_traffic_usage,
                )
                .await
            {
                Ok(()) => finalized += 1,
                Err(err) => error!("Failed to finalize session {connection}: {err}"),
            }
        }
        finalized
    }
}

#[cfg(test)]
mod test {
    use chrono::{NaiveDate, TimeDelta, Utc};
    use claims::{assert_err, assert_ok};
    use ocguard_common::db::{ConnectionStatus, Package};

    use super::*;
    use crate::testing::{FakeVpn, MemoryStore, VpnCall};

    fn cutoff() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn user(id: Id, username: &str, banned: bool) -> User<Id> {
        User {
            id,
            username: username.into(),
            external_id: format!("tg-{id}"),
            banned_at: banned.then(cutoff),
            created_at: cutoff(),
        }
    }

    fn package(
        id: Id,
        user_id: Id,
        traffic_limit: i64,
        used: i64,
        duration_days: i32,
        active: bool,
    ) -> Package<Id> {
        Package {
            id,
            user_id,
            traffic_limit,
            download_traffic_usage: used,
            upload_traffic_usage: 0,
            max_connections: 2,
            is_trial: false,
            duration_days,
            expire_at: active.then(|| Utc::now().naive_utc() + TimeDelta::days(30)),
            created_at: cutoff(),
        }
    }

    fn session(
        store: &MemoryStore,
        external_id: &str,
        username: &str,
        download: i64,
        upload: i64,
        updated_at: NaiveDateTime,
    ) -> Id {
        store.add_connection(Connection::new(
            external_id.into(),
            username.into(),
            "203.0.113.7".into(),
            "unknown".into(),
            "AnyConnect".into(),
            "laptop".into(),
            download,
            upload,
            cutoff() - TimeDelta::hours(1),
            updated_at,
        ))
    }

    fn engine() -> (ReconciliationEngine<MemoryStore, FakeVpn>, MemoryStore, FakeVpn) {
        let store = MemoryStore::default();
        let vpn = FakeVpn::default();
        (
            ReconciliationEngine::new(store.clone(), vpn.clone()),
            store,
            vpn,
        )
    }

    fn disconnect_and_lock_calls(username: &str) -> Vec<VpnCall> {
        vec![
            VpnCall::DisconnectUser(username.into()),
            VpnCall::LockUser(username.into()),
        ]
    }

    #[tokio::test]
    async fn test_unknown_user_is_disconnected() {
        let (engine, store, vpn) = engine();
        let id = session(&store, "1", "ghost", 100, 50, cutoff());

        let report = assert_ok!(engine.reconcile(cutoff()).await);

        assert_eq!(
            report.outcome("ghost"),
            Some(&UserOutcome::Disconnected(DisconnectReason::UnknownUser))
        );
        assert_eq!(vpn.calls(), disconnect_and_lock_calls("ghost"));
        assert_eq!(store.disconnects(), vec![(id, 100, 50)]);
        assert!(store.debits().is_empty());
    }

    #[tokio::test]
    async fn test_banned_user_is_disconnected() {
        let (engine, store, vpn) = engine();
        store.add_user(user(1, "draco", true));
        store.add_package(package(1, 1, 1_000_000, 0, 30, true));
        session(&store, "1", "draco", 10, 10, cutoff());

        let report = assert_ok!(engine.reconcile(cutoff()).await);

        assert_eq!(
            report.outcome("draco"),
            Some(&UserOutcome::Disconnected(DisconnectReason::Banned))
        );
        assert_eq!(vpn.calls(), disconnect_and_lock_calls("draco"));
        assert!(store.debits().is_empty());
    }

    #[tokio::test]
    async fn test_user_without_package_is_disconnected() {
        let (engine, store, vpn) = engine();
        store.add_user(user(1, "hpotter", false));
        // exhausted packages are not eligible
        store.add_package(package(1, 1, 1_000, 1_000, 30, true));
        store.add_package(package(2, 1, 1_000, 1_000, 7, false));
        session(&store, "1", "hpotter", 10, 10, cutoff());

        let report = assert_ok!(engine.reconcile(cutoff()).await);

        assert_eq!(
            report.outcome("hpotter"),
            Some(&UserOutcome::Disconnected(DisconnectReason::NoPackage))
        );
        assert_eq!(vpn.calls(), disconnect_and_lock_calls("hpotter"));
        assert!(store.debits().is_empty());
    }

    #[tokio::test]
    async fn test_usage_within_active_package() {
        let (engine, store, vpn) = engine();
        store.add_user(user(1, "hpotter", false));
        store.add_package(package(1, 1, 1_000_000, 500_000, 30, true));
        session(&store, "1", "hpotter", 100_000, 50_000, cutoff());
        session(&store, "2", "hpotter", 30_000, 20_000, cutoff());

        let report = assert_ok!(engine.reconcile(cutoff()).await);

        assert_eq!(
            report.outcome("hpotter"),
            Some(&UserOutcome::WithinQuota { remaining: 300_000 })
        );
        assert!(vpn.calls().is_empty());
        assert!(store.debits().is_empty());
        assert!(store.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_active_package_does_not_cascade() {
        let (engine, store, vpn) = engine();
        store.add_user(user(1, "hpotter", false));
        store.add_package(package(1, 1, 1_000_000, 900_000, 30, true));
        store.add_package(package(2, 1, 5_000_000, 0, 7, false));
        let id = session(&store, "1", "hpotter", 100_000, 50_000, cutoff());

        let report = assert_ok!(engine.reconcile(cutoff()).await);

        assert_eq!(
            report.outcome("hpotter"),
            Some(&UserOutcome::Disconnected(DisconnectReason::QuotaExhausted))
        );
        assert_eq!(vpn.calls(), disconnect_and_lock_calls("hpotter"));
        assert!(store.debits().is_empty());
        assert_eq!(store.disconnects(), vec![(id, 100_000, 50_000)]);
    }

    #[tokio::test]
    async fn test_overage_absorbed_by_shortest_reserved_package() {
        let (engine, store, vpn) = engine();
        store.add_user(user(1, "hpotter", false));
        store.add_package(package(10, 1, 500_000, 0, 30, false));
        store.add_package(package(11, 1, 2_000_000, 0, 7, false));
        session(&store, "1", "hpotter", 400_000, 200_000, cutoff());

        let report = assert_ok!(engine.reconcile(cutoff()).await);

        assert_eq!(
            report.outcome("hpotter"),
            Some(&UserOutcome::Absorbed {
                debits: vec![Debit {
                    package_id: 11,
                    download: 400_000,
                    upload: 200_000,
                }]
            })
        );
        assert_eq!(store.debits(), vec![(11, 400_000, 200_000)]);
        assert_eq!(store.package(11).unwrap().used_traffic(), 600_000);
        assert_eq!(store.package(10).unwrap().used_traffic(), 0);
        assert!(vpn.calls().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_reserved_packages_lock_user() {
        let (engine, store, vpn) = engine();
        store.add_user(user(1, "hpotter", false));
        store.add_package(package(10, 1, 100_000, 0, 7, false));
        store.add_package(package(11, 1, 200_000, 0, 30, false));
        session(&store, "1", "hpotter", 300_000, 100_000, cutoff());

        let report = assert_ok!(engine.reconcile(cutoff()).await);

        assert_eq!(
            report.outcome("hpotter"),
            Some(&UserOutcome::Disconnected(DisconnectReason::ReservedExhausted))
        );
        // both packages are charged in full before the user is locked
        assert_eq!(
            store.debits(),
            vec![(10, 75_000, 25_000), (11, 150_000, 50_000)]
        );
        assert_eq!(vpn.calls(), disconnect_and_lock_calls("hpotter"));
    }

    #[tokio::test]
    async fn test_stale_sessions_are_finalized_once() {
        let (engine, store, _vpn) = engine();
        store.add_user(user(1, "hpotter", false));
        store.add_package(package(1, 1, 1_000_000, 0, 30, true));
        let live = session(&store, "1", "hpotter", 10, 10, cutoff());
        let stale = session(
            &store,
            "2",
            "hpotter",
            700,
            300,
            cutoff() - TimeDelta::seconds(5),
        );
        // stale session of a locked user is closed by the lock path only
        let stale_ghost = session(
            &store,
            "3",
            "ghost",
            5,
            5,
            cutoff() - TimeDelta::seconds(5),
        );

        let report = assert_ok!(engine.reconcile(cutoff()).await);

        assert_eq!(report.finalized, 1);
        assert_eq!(store.disconnects(), vec![(stale_ghost, 5, 5), (stale, 700, 300)]);
        assert_eq!(
            store.connection(stale).unwrap().status,
            ConnectionStatus::Disconnected
        );
        assert_eq!(
            store.connection(live).unwrap().status,
            ConnectionStatus::Connected
        );

        // nothing is left to finalize on the next pass
        let report = assert_ok!(engine.reconcile(cutoff()).await);
        assert_eq!(report.finalized, 0);
        assert_eq!(store.disconnects().len(), 2);
    }

    #[tokio::test]
    async fn test_user_failure_does_not_abort_pass() {
        let (engine, store, vpn) = engine();
        store.add_user(user(2, "ron", false));
        store.add_package(package(1, 2, 1_000_000, 0, 30, true));
        session(&store, "1", "ghost", 10, 10, cutoff());
        session(&store, "2", "ron", 10, 10, cutoff());
        vpn.fail_user("ghost");

        let report = assert_ok!(engine.reconcile(cutoff()).await);

        assert_eq!(report.failed_users, vec!["ghost".to_string()]);
        assert_eq!(
            report.outcome("ron"),
            Some(&UserOutcome::WithinQuota { remaining: 999_980 })
        );
        // the failed lock leaves the row connected
        assert!(store.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_failed_debit_is_isolated() {
        let (engine, store, _vpn) = engine();
        store.add_user(user(1, "hpotter", false));
        store.add_user(user(2, "ron", false));
        store.add_package(package(10, 1, 1_000_000, 0, 7, false));
        store.add_package(package(20, 2, 1_000_000, 0, 7, false));
        store.fail_debits_for(10);
        session(&store, "1", "hpotter", 100, 0, cutoff());
        session(&store, "2", "ron", 0, 100, cutoff());

        let report = assert_ok!(engine.reconcile(cutoff()).await);

        assert_eq!(report.failed_users, vec!["hpotter".to_string()]);
        assert_eq!(store.debits(), vec![(20, 0, 100)]);
    }

    #[tokio::test]
    async fn test_read_failures_abort_pass() {
        let (engine, store, vpn) = engine();
        session(&store, "1", "ghost", 10, 10, cutoff());

        store.fail_list_connected(true);
        assert_err!(engine.reconcile(cutoff()).await);
        store.fail_list_connected(false);

        store.fail_list_users(true);
        assert_err!(engine.reconcile(cutoff()).await);
        store.fail_list_users(false);

        store.fail_list_packages(true);
        assert_err!(engine.reconcile(cutoff()).await);

        assert!(vpn.calls().is_empty());
        assert!(store.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_users_listed_in_report() {
        let (engine, store, _vpn) = engine();
        store.add_user(user(1, "hpotter", false));
        store.add_package(package(1, 1, 1_000_000, 0, 30, true));
        session(&store, "1", "hpotter", 10, 10, cutoff());
        session(&store, "2", "ghost", 10, 10, cutoff());
        session(&store, "3", "draco", 10, 10, cutoff());

        let report = assert_ok!(engine.reconcile(cutoff()).await);

        assert_eq!(report.disconnected_users(), vec!["draco", "ghost"]);
    }
}
