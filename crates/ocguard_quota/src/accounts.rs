//! Account and package management on top of the quota store.

use chrono::Utc;
use ocguard_common::{
    config::OcguardConfig,
    db::{Connection, ConnectionFilter, Id, Package, SystemStatus, User},
    units::{format_bytes, gigabytes},
};
use ocguard_ocserv::{VpnAccounts, VpnControl};
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use sqlx::PgPool;
use tracing::{debug, error, info};

use crate::error::QuotaError;

const PASSWORD_LENGTH: usize = 8;

/// Generate random alphanumeric password.
#[must_use]
pub fn generate_password(length: usize) -> String {
    thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Package handed out to every new account.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrialPackage {
    pub traffic_limit: i64,
    pub max_connections: i32,
    pub duration_days: i32,
}

impl TrialPackage {
    /// Trial package settings, `None` when trials are disabled.
    #[must_use]
    pub fn from_config(config: &OcguardConfig) -> Option<Self> {
        config.trial_package_enabled.then(|| Self {
            traffic_limit: gigabytes(config.trial_package_traffic_gb),
            max_connections: config.trial_package_max_connections,
            duration_days: config.trial_package_duration_days,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PackageGrant {
    pub user_id: Id,
    pub traffic_limit: i64,
    pub max_connections: i32,
    pub is_trial: bool,
    pub duration_days: i32,
}

impl From<(Id, TrialPackage)> for PackageGrant {
    fn from((user_id, trial): (Id, TrialPackage)) -> Self {
        Self {
            user_id,
            traffic_limit: trial.traffic_limit,
            max_connections: trial.max_connections,
            is_trial: true,
            duration_days: trial.duration_days,
        }
    }
}

/// Newly registered account together with its generated password.
#[derive(Debug)]
pub struct CreatedAccount {
    pub user: User<Id>,
    pub password: String,
}

/// Close a single connection and drop the matching ocserv session.
pub async fn disconnect_connection<V: VpnControl>(
    pool: &PgPool,
    vpn: &V,
    id: Id,
) -> Result<(), QuotaError> {
    let external_id = Connection::disconnect_by_id(pool, id)
        .await?
        .ok_or(QuotaError::ConnectionDoesNotExistError(id))?;
    debug!("Connection {id} marked as disconnected, dropping session {external_id}");
    vpn.disconnect_session(&external_id).await?;
    Ok(())
}

/// Connected sessions of a user, newest first.
pub async fn user_connections(
    pool: &PgPool,
    username: &str,
) -> Result<Vec<Connection<Id>>, QuotaError> {
    Ok(Connection::all_connected(pool, &ConnectionFilter::username(username)).await?)
}

pub async fn system_status(pool: &PgPool) -> Result<SystemStatus, QuotaError> {
    Ok(SystemStatus::fetch(pool).await?)
}

/// Lock the ocserv account and mark the user as banned.
pub async fn ban_user<V: VpnControl>(pool: &PgPool, vpn: &V, user_id: Id) -> Result<(), QuotaError> {
    let user = User::find_by_id(pool, user_id)
        .await?
        .ok_or(QuotaError::UserDoesNotExistError(user_id))?;
    vpn.lock_user(&user.username).await?;
    User::set_banned_at(pool, user_id, Some(Utc::now().naive_utc())).await?;
    info!("Banned user {user}");
    Ok(())
}

pub async fn unban_user<V: VpnControl>(
    pool: &PgPool,
    vpn: &V,
    user_id: Id,
) -> Result<(), QuotaError> {
    let user = User::find_by_id(pool, user_id)
        .await?
        .ok_or(QuotaError::UserDoesNotExistError(user_id))?;
    vpn.unlock_user(&user.username).await?;
    User::set_banned_at(pool, user_id, None).await?;
    info!("Unbanned user {user}");
    Ok(())
}

/// Create a package for a user.
///
/// The activation deadline is only assigned while the user still has an active
/// package; otherwise the new package is queued as reserved.
pub async fn grant_package(
    pool: &PgPool,
    grant: PackageGrant,
) -> Result<Package<Id>, QuotaError> {
    let now = Utc::now().naive_utc();
    let mut transaction = pool.begin().await?;

    if User::find_by_id(&mut *transaction, grant.user_id)
        .await?
        .is_none()
    {
        return Err(QuotaError::UserDoesNotExistError(grant.user_id));
    }

    let mut package = Package::new(
        grant.user_id,
        grant.traffic_limit,
        grant.max_connections,
        grant.is_trial,
        grant.duration_days,
        now,
    );
    // TODO: confirm whether packages granted without an active one should start immediately
    if Package::find_active_for_user(&mut *transaction, grant.user_id, now)
        .await?
        .is_some()
    {
        package = package.activate(now);
    }
    let package = package.save(&mut *transaction).await?;
    transaction.commit().await?;

    info!(
        "Granted package {} with {} to user {}",
        package.id,
        format_bytes(package.traffic_limit),
        package.user_id
    );
    Ok(package)
}

/// Register a user and its ocserv account.
///
/// The trial package is granted when configured; failing to grant it is logged
/// and does not fail account creation.
pub async fn create_account<V: VpnAccounts>(
    pool: &PgPool,
    vpn: &V,
    username: &str,
    external_id: &str,
    trial: Option<TrialPackage>,
) -> Result<CreatedAccount, QuotaError> {
    let password = generate_password(PASSWORD_LENGTH);

    let mut transaction = pool.begin().await?;
    let user = User::new(username, external_id, Utc::now().naive_utc())
        .save(&mut *transaction)
        .await?;
    vpn.create_user(username, &password).await?;
    transaction.commit().await?;
    info!("Created account {user}");

    if let Some(trial) = trial {
        if let Err(err) = grant_package(pool, PackageGrant::from((user.id, trial))).await {
            error!("Failed to grant trial package to user {user}: {err}");
        }
    }

    Ok(CreatedAccount { user, password })
}

/// Replace the ocserv password of an existing user, returning the new one.
pub async fn change_password<V: VpnAccounts>(
    pool: &PgPool,
    vpn: &V,
    username: &str,
) -> Result<String, QuotaError> {
    if User::find_by_username(pool, username).await?.is_none() {
        return Err(QuotaError::UsernameDoesNotExistError(username.to_string()));
    }
    let password = generate_password(PASSWORD_LENGTH);
    vpn.change_password(username, &password).await?;
    info!("Changed password of user {username}");
    Ok(password)
}
