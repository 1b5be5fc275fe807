//! Persistence capabilities used by the quota engine.
//!
//! Each consumer depends only on the traits it needs, `PgStore` implements
//! all of them on top of a PostgreSQL pool.

use std::collections::HashMap;

use chrono::Utc;
use ocguard_common::db::{Connection, ConnectionFilter, Id, Package, User, UserPackages};
use sqlx::PgPool;
use tracing::debug;

/// Connection rows mirrored from ocserv.
#[trait_variant::make(Send)]
pub trait ConnectionStore {
    /// Merge a snapshot of live sessions, all or nothing.
    async fn upsert_connections(&self, connections: &[Connection]) -> Result<(), sqlx::Error>;

    async fn list_connected(
        &self,
        filter: &ConnectionFilter,
    ) -> Result<Vec<Connection<Id>>, sqlx::Error>;

    /// Close a row, storing its last traffic reading as final.
    async fn mark_disconnected(
        &self,
        id: Id,
        download_traffic_usage: i64,
        upload_traffic_usage: i64,
    ) -> Result<(), sqlx::Error>;
}

/// Quota packages.
#[trait_variant::make(Send)]
pub trait PackageStore {
    /// Eligible packages of given users, keyed by user id.
    ///
    /// Users without any eligible package are absent from the result.
    async fn list_eligible_packages(
        &self,
        user_ids: &[Id],
    ) -> Result<HashMap<Id, UserPackages>, sqlx::Error>;

    /// Add traffic to package counters.
    async fn debit_package(&self, id: Id, download: i64, upload: i64) -> Result<(), sqlx::Error>;
}

#[trait_variant::make(Send)]
pub trait UserStore {
    async fn list_users_by_usernames(
        &self,
        usernames: &[String],
    ) -> Result<Vec<User<Id>>, sqlx::Error>;
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl ConnectionStore for PgStore {
    async fn upsert_connections(&self, connections: &[Connection]) -> Result<(), sqlx::Error> {
        debug!("Upserting {} connections", connections.len());
        let mut transaction = self.pool.begin().await?;
        for connection in connections {
            connection.upsert(&mut *transaction).await?;
        }
        transaction.commit().await
    }

    async fn list_connected(
        &self,
        filter: &ConnectionFilter,
    ) -> Result<Vec<Connection<Id>>, sqlx::Error> {
        Connection::all_connected(&self.pool, filter).await
    }

    async fn mark_disconnected(
        &self,
        id: Id,
        download_traffic_usage: i64,
        upload_traffic_usage: i64,
    ) -> Result<(), sqlx::Error> {
        Connection::mark_disconnected(&self.pool, id, download_traffic_usage, upload_traffic_usage)
            .await
    }
}

impl PackageStore for PgStore {
    async fn list_eligible_packages(
        &self,
        user_ids: &[Id],
    ) -> Result<HashMap<Id, UserPackages>, sqlx::Error> {
        let now = Utc::now().naive_utc();
        let packages = Package::all_eligible_for_users(&self.pool, user_ids, now).await?;
        Ok(UserPackages::partition(packages, now))
    }

    async fn debit_package(&self, id: Id, download: i64, upload: i64) -> Result<(), sqlx::Error> {
        Package::add_traffic_usage(&self.pool, id, download, upload).await
    }
}

impl UserStore for PgStore {
    async fn list_users_by_usernames(
        &self,
        usernames: &[String],
    ) -> Result<Vec<User<Id>>, sqlx::Error> {
        User::find_many_by_usernames(&self.pool, usernames).await
    }
}
