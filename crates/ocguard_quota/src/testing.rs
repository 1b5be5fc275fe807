//! In-memory implementations of the store and VPN control traits.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use ocguard_common::db::{
    Connection, ConnectionFilter, ConnectionStatus, Id, Package, User, UserPackages,
};
use ocguard_ocserv::{OcservError, OcservSession, VpnAccounts, VpnControl};
use tokio::time::sleep;

use crate::store::{ConnectionStore, PackageStore, UserStore};

fn injected_db_error() -> sqlx::Error {
    sqlx::Error::PoolTimedOut
}

fn injected_vpn_error(command: &str) -> OcservError {
    OcservError::CommandFailed {
        command: command.to_string(),
        status: "exit status: 1".to_string(),
        stderr: "injected failure".to_string(),
    }
}

#[derive(Default)]
struct StoreState {
    users: Vec<User<Id>>,
    packages: Vec<Package<Id>>,
    connections: Vec<Connection<Id>>,
    next_connection_id: Id,
    debits: Vec<(Id, i64, i64)>,
    disconnects: Vec<(Id, i64, i64)>,
    fail_upserts: bool,
    fail_list_connected: bool,
    fail_list_users: bool,
    fail_list_packages: bool,
    failing_packages: HashSet<Id>,
}

/// Store keeping everything in shared memory, clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    pub fn add_user(&self, user: User<Id>) {
        self.state().users.push(user);
    }

    pub fn add_package(&self, package: Package<Id>) {
        self.state().packages.push(package);
    }

    /// Insert a row as is, returning its assigned id.
    pub fn add_connection<I>(&self, connection: Connection<I>) -> Id {
        let mut state = self.state();
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.push(Connection {
            id,
            external_id: connection.external_id,
            username: connection.username,
            status: connection.status,
            remote_ip: connection.remote_ip,
            location: connection.location,
            user_agent: connection.user_agent,
            hostname: connection.hostname,
            download_traffic_usage: connection.download_traffic_usage,
            upload_traffic_usage: connection.upload_traffic_usage,
            connected_at: connection.connected_at,
            updated_at: connection.updated_at,
        });
        id
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Connection<Id>> {
        self.state().connections.clone()
    }

    #[must_use]
    pub fn connection(&self, id: Id) -> Option<Connection<Id>> {
        self.state()
            .connections
            .iter()
            .find(|connection| connection.id == id)
            .cloned()
    }

    #[must_use]
    pub fn package(&self, id: Id) -> Option<Package<Id>> {
        self.state()
            .packages
            .iter()
            .find(|package| package.id == id)
            .cloned()
    }

    /// Every `debit_package` call as `(package id, download, upload)`.
    #[must_use]
    pub fn debits(&self) -> Vec<(Id, i64, i64)> {
        self.state().debits.clone()
    }

    /// Every `mark_disconnected` call as `(connection id, download, upload)`.
    #[must_use]
    pub fn disconnects(&self) -> Vec<(Id, i64, i64)> {
        self.state().disconnects.clone()
    }

    pub fn fail_upserts(&self, fail: bool) {
        self.state().fail_upserts = fail;
    }

    pub fn fail_list_connected(&self, fail: bool) {
        self.state().fail_list_connected = fail;
    }

    pub fn fail_list_users(&self, fail: bool) {
        self.state().fail_list_users = fail;
    }

    pub fn fail_list_packages(&self, fail: bool) {
        self.state().fail_list_packages = fail;
    }

    pub fn fail_debits_for(&self, package_id: Id) {
        self.state().failing_packages.insert(package_id);
    }
}

impl ConnectionStore for MemoryStore {
    async fn upsert_connections(&self, connections: &[Connection]) -> Result<(), sqlx::Error> {
        let mut state = self.state();
        if state.fail_upserts {
            return Err(injected_db_error());
        }
        for connection in connections {
            let existing = state.connections.iter_mut().find(|row| {
                row.external_id == connection.external_id
                    && row.status == ConnectionStatus::Connected
            });
            match existing {
                Some(row) => {
                    row.download_traffic_usage = connection.download_traffic_usage;
                    row.upload_traffic_usage = connection.upload_traffic_usage;
                    row.updated_at = connection.updated_at;
                }
                None => {
                    state.next_connection_id += 1;
                    let id = state.next_connection_id;
                    state.connections.push(Connection {
                        id,
                        external_id: connection.external_id.clone(),
                        username: connection.username.clone(),
                        status: ConnectionStatus::Connected,
                        remote_ip: connection.remote_ip.clone(),
                        location: connection.location.clone(),
                        user_agent: connection.user_agent.clone(),
                        hostname: connection.hostname.clone(),
                        download_traffic_usage: connection.download_traffic_usage,
                        upload_traffic_usage: connection.upload_traffic_usage,
                        connected_at: connection.connected_at,
                        updated_at: connection.updated_at,
                    });
                }
            }
        }
        Ok(())
    }

    async fn list_connected(
        &self,
        filter: &ConnectionFilter,
    ) -> Result<Vec<Connection<Id>>, sqlx::Error> {
        let state = self.state();
        if state.fail_list_connected {
            return Err(injected_db_error());
        }
        let mut connections: Vec<Connection<Id>> = state
            .connections
            .iter()
            .filter(|connection| connection.status == ConnectionStatus::Connected)
            .filter(|connection| {
                filter
                    .username
                    .as_ref()
                    .is_none_or(|username| &connection.username == username)
            })
            .cloned()
            .collect();
        connections.sort_by(|a, b| b.connected_at.cmp(&a.connected_at));
        Ok(connections)
    }

    async fn mark_disconnected(
        &self,
        id: Id,
        download_traffic_usage: i64,
        upload_traffic_usage: i64,
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state();
        state
            .disconnects
            .push((id, download_traffic_usage, upload_traffic_usage));
        if let Some(connection) = state.connections.iter_mut().find(|row| row.id == id) {
            connection.status = ConnectionStatus::Disconnected;
            connection.download_traffic_usage = download_traffic_usage;
            connection.upload_traffic_usage = upload_traffic_usage;
            connection.updated_at = Utc::now().naive_utc();
        }
        Ok(())
    }
}

impl PackageStore for MemoryStore {
    async fn list_eligible_packages(
        &self,
        user_ids: &[Id],
    ) -> Result<HashMap<Id, UserPackages>, sqlx::Error> {
        let state = self.state();
        if state.fail_list_packages {
            return Err(injected_db_error());
        }
        let packages = state
            .packages
            .iter()
            .filter(|package| user_ids.contains(&package.user_id))
            .cloned();
        Ok(UserPackages::partition(packages, Utc::now().naive_utc()))
    }

    async fn debit_package(&self, id: Id, download: i64, upload: i64) -> Result<(), sqlx::Error> {
        let mut state = self.state();
        if state.failing_packages.contains(&id) {
            return Err(injected_db_error());
        }
        state.debits.push((id, download, upload));
        if let Some(package) = state.packages.iter_mut().find(|package| package.id == id) {
            package.download_traffic_usage += download;
            package.upload_traffic_usage += upload;
        }
        Ok(())
    }
}

impl UserStore for MemoryStore {
    async fn list_users_by_usernames(
        &self,
        usernames: &[String],
    ) -> Result<Vec<User<Id>>, sqlx::Error> {
        let state = self.state();
        if state.fail_list_users {
            return Err(injected_db_error());
        }
        Ok(state
            .users
            .iter()
            .filter(|user| usernames.contains(&user.username))
            .cloned()
            .collect())
    }
}

/// Call received by [`FakeVpn`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VpnCall {
    ListSessions,
    DisconnectUser(String),
    DisconnectSession(String),
    LockUser(String),
    UnlockUser(String),
    StopServer,
    CreateUser(String, String),
    ChangePassword(String, String),
}

#[derive(Default)]
struct VpnState {
    sessions: Vec<OcservSession>,
    // scripted outcomes of upcoming `list_sessions` calls, `false` fails
    list_results: VecDeque<bool>,
    list_delay: Option<Duration>,
    calls: Vec<VpnCall>,
    failing_users: HashSet<String>,
    fail_stop: bool,
}

/// Scriptable VPN server recording every call.
#[derive(Clone, Default)]
pub struct FakeVpn {
    state: Arc<Mutex<VpnState>>,
}

impl FakeVpn {
    fn state(&self) -> MutexGuard<'_, VpnState> {
        self.state.lock().unwrap()
    }

    pub fn set_sessions(&self, sessions: Vec<OcservSession>) {
        self.state().sessions = sessions;
    }

    /// Queue outcomes for the next `list_sessions` calls. Once the queue is
    /// drained every call succeeds.
    pub fn script_list_results<I: IntoIterator<Item = bool>>(&self, results: I) {
        self.state().list_results.extend(results);
    }

    /// Make every `list_sessions` call take `delay`.
    pub fn set_list_delay(&self, delay: Duration) {
        self.state().list_delay = Some(delay);
    }

    pub fn fail_user(&self, username: &str) {
        self.state().failing_users.insert(username.to_string());
    }

    pub fn fail_stop(&self, fail: bool) {
        self.state().fail_stop = fail;
    }

    #[must_use]
    pub fn calls(&self) -> Vec<VpnCall> {
        self.state().calls.clone()
    }

    #[must_use]
    pub fn count(&self, call: &VpnCall) -> usize {
        self.state().calls.iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: VpnCall) {
        self.state().calls.push(call);
    }

    fn check_user(&self, command: &str, username: &str) -> Result<(), OcservError> {
        if self.state().failing_users.contains(username) {
            Err(injected_vpn_error(command))
        } else {
            Ok(())
        }
    }
}

impl VpnControl for FakeVpn {
    async fn list_sessions(&self) -> Result<Vec<OcservSession>, OcservError> {
        self.record(VpnCall::ListSessions);
        let delay = self.state().list_delay;
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        let mut state = self.state();
        match state.list_results.pop_front() {
            Some(false) => Err(injected_vpn_error("occtl -j show users")),
            _ => Ok(state.sessions.clone()),
        }
    }

    async fn disconnect_user(&self, username: &str) -> Result<(), OcservError> {
        self.record(VpnCall::DisconnectUser(username.to_string()));
        self.check_user("occtl disconnect user", username)
    }

    async fn disconnect_session(&self, session_id: &str) -> Result<(), OcservError> {
        self.record(VpnCall::DisconnectSession(session_id.to_string()));
        Ok(())
    }

    async fn lock_user(&self, username: &str) -> Result<(), OcservError> {
        self.record(VpnCall::LockUser(username.to_string()));
        self.check_user("ocpasswd -l", username)
    }

    async fn unlock_user(&self, username: &str) -> Result<(), OcservError> {
        self.record(VpnCall::UnlockUser(username.to_string()));
        self.check_user("ocpasswd -u", username)
    }

    async fn stop_server(&self) -> Result<(), OcservError> {
        self.record(VpnCall::StopServer);
        if self.state().fail_stop {
            Err(injected_vpn_error("occtl stop now"))
        } else {
            Ok(())
        }
    }
}

impl VpnAccounts for FakeVpn {
    async fn create_user(&self, username: &str, password: &str) -> Result<(), OcservError> {
        self.record(VpnCall::CreateUser(
            username.to_string(),
            password.to_string(),
        ));
        self.check_user("ocpasswd", username)
    }

    async fn change_password(&self, username: &str, password: &str) -> Result<(), OcservError> {
        self.record(VpnCall::ChangePassword(
            username.to_string(),
            password.to_string(),
        ));
        self.check_user("ocpasswd", username)
    }
}
