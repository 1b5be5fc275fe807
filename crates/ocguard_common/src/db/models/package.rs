use std::collections::HashMap;

use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, Row, postgres::PgRow, query, query_as};

use crate::db::{Id, NoId};

/// Traffic quota bucket granted to a user.
///
/// A package without `expire_at` is reserved: it waits in the queue and is not
/// charged as the active quota. Once `expire_at` is set the package is active
/// until that instant or until its traffic limit is used up.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Package<I = NoId> {
    pub id: I,
    pub user_id: Id,
    pub traffic_limit: i64,
    pub download_traffic_usage: i64,
    pub upload_traffic_usage: i64,
    pub max_connections: i32,
    pub is_trial: bool,
    // nominal lifetime, used to order reserved packages
    pub duration_days: i32,
    pub expire_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl<I> Package<I> {
    /// Bytes already charged to this package.
    #[must_use]
    pub fn used_traffic(&self) -> i64 {
        self.download_traffic_usage + self.upload_traffic_usage
    }

    /// Package still has traffic left and has not expired.
    #[must_use]
    pub fn is_eligible(&self, now: NaiveDateTime) -> bool {
        self.used_traffic() < self.traffic_limit
            && self.expire_at.is_none_or(|expire_at| expire_at > now)
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.expire_at.is_none()
    }
}

impl Package<NoId> {
    #[must_use]
    pub fn new(
        user_id: Id,
        traffic_limit: i64,
        max_connections: i32,
        is_trial: bool,
        duration_days: i32,
        created_at: NaiveDateTime,
    ) -> Self {
        Self {
            id: NoId,
            user_id,
            traffic_limit,
            download_traffic_usage: 0,
            upload_traffic_usage: 0,
            max_connections,
            is_trial,
            duration_days,
            expire_at: None,
            created_at,
        }
    }

    /// Start the package clock: it expires `duration_days` after `now`.
    #[must_use]
    pub fn activate(mut self, now: NaiveDateTime) -> Self {
        self.expire_at = Some(now + TimeDelta::days(i64::from(self.duration_days)));
        self
    }

    pub async fn save<'e, E>(self, executor: E) -> Result<Package<Id>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let id = sqlx::query_scalar::<_, Id>(
            "INSERT INTO package (user_id, traffic_limit, download_traffic_usage, \
            upload_traffic_usage, max_connections, is_trial, duration_days, expire_at, created_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
        )
        .bind(self.user_id)
        .bind(self.traffic_limit)
        .bind(self.download_traffic_usage)
        .bind(self.upload_traffic_usage)
        .bind(self.max_connections)
        .bind(self.is_trial)
        .bind(self.duration_days)
        .bind(self.expire_at)
        .bind(self.created_at)
        .fetch_one(executor)
        .await?;

        Ok(Package {
            id,
            user_id: self.user_id,
            traffic_limit: self.traffic_limit,
            download_traffic_usage: self.download_traffic_usage,
            upload_traffic_usage: self.upload_traffic_usage,
            max_connections: self.max_connections,
            is_trial: self.is_trial,
            duration_days: self.duration_days,
            expire_at: self.expire_at,
            created_at: self.created_at,
        })
    }
}

impl Package<Id> {
    /// Fetch eligible packages owned by any of given users.
    pub async fn all_eligible_for_users<'e, E>(
        executor: E,
        user_ids: &[Id],
        now: NaiveDateTime,
    ) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query_as::<_, Self>(
            "SELECT id, user_id, traffic_limit, download_traffic_usage, upload_traffic_usage, \
            max_connections, is_trial, duration_days, expire_at, created_at \
            FROM package \
            WHERE user_id = ANY($1) \
            AND download_traffic_usage + upload_traffic_usage < traffic_limit \
            AND (expire_at IS NULL OR expire_at > $2) \
            ORDER BY id",
        )
        .bind(user_ids)
        .bind(now)
        .fetch_all(executor)
        .await
    }

    /// Fetch the package currently charged for a user, if any.
    pub async fn find_active_for_user<'e, E>(
        executor: E,
        user_id: Id,
        now: NaiveDateTime,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query_as::<_, Self>(
            "SELECT id, user_id, traffic_limit, download_traffic_usage, upload_traffic_usage, \
            max_connections, is_trial, duration_days, expire_at, created_at \
            FROM package \
            WHERE user_id = $1 \
            AND download_traffic_usage + upload_traffic_usage < traffic_limit \
            AND expire_at > $2 \
            ORDER BY expire_at LIMIT 1",
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(executor)
        .await
    }

    /// Fetch all packages of a user regardless of state, newest first.
    pub async fn all_for_user<'e, E>(executor: E, user_id: Id) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query_as::<_, Self>(
            "SELECT id, user_id, traffic_limit, download_traffic_usage, upload_traffic_usage, \
            max_connections, is_trial, duration_days, expire_at, created_at \
            FROM package WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(executor)
        .await
    }

    /// Charge traffic to a package.
    ///
    /// Counters are incremented in a single statement so concurrent writers never
    /// lose an update.
    pub async fn add_traffic_usage<'e, E>(
        executor: E,
        id: Id,
        download: i64,
        upload: i64,
    ) -> Result<(), sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query(
            "UPDATE package SET download_traffic_usage = download_traffic_usage + $2, \
            upload_traffic_usage = upload_traffic_usage + $3 WHERE id = $1",
        )
        .bind(id)
        .bind(download)
        .bind(upload)
        .execute(executor)
        .await?;

        Ok(())
    }
}

impl FromRow<'_, PgRow> for Package<Id> {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            traffic_limit: row.try_get("traffic_limit")?,
            download_traffic_usage: row.try_get("download_traffic_usage")?,
            upload_traffic_usage: row.try_get("upload_traffic_usage")?,
            max_connections: row.try_get("max_connections")?,
            is_trial: row.try_get("is_trial")?,
            duration_days: row.try_get("duration_days")?,
            expire_at: row.try_get("expire_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Eligible packages of a single user split into the charged one and the queue.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserPackages {
    pub user_id: Id,
    pub active: Option<Package<Id>>,
    pub reserved: Vec<Package<Id>>,
}

impl UserPackages {
    #[must_use]
    pub fn new(user_id: Id) -> Self {
        Self {
            user_id,
            active: None,
            reserved: Vec::new(),
        }
    }

    /// No active package and nothing in the queue.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_none() && self.reserved.is_empty()
    }

    /// Group eligible packages by owner.
    ///
    /// Packages which are not eligible at `now` are dropped. If a user has more
    /// than one package with a deadline the one expiring first is active, the
    /// others are ignored.
    pub fn partition<T>(packages: T, now: NaiveDateTime) -> HashMap<Id, Self>
    where
        T: IntoIterator<Item = Package<Id>>,
    {
        let mut result: HashMap<Id, Self> = HashMap::new();

        for package in packages {
            if !package.is_eligible(now) {
                continue;
            }
            let user_packages = result
                .entry(package.user_id)
                .or_insert_with(|| Self::new(package.user_id));

            match package.expire_at {
                None => user_packages.reserved.push(package),
                Some(expire_at) => match &user_packages.active {
                    Some(active) if active.expire_at.is_some_and(|current| current <= expire_at) => {}
                    _ => user_packages.active = Some(package),
                },
            }
        }

        result
    }
}
