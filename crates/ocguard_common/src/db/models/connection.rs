use std::fmt;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, Row, Type, postgres::PgRow, query, query_as, query_scalar};

use crate::db::{Id, NoId};

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, Type)]
#[sqlx(type_name = "connection_status", rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// A single ocserv tunnel as recorded in the database.
///
/// Traffic counters hold the cumulative reading reported by ocserv for the whole
/// session, they are overwritten on every poll rather than incremented.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Connection<I = NoId> {
    pub id: I,
    pub external_id: String,
    pub username: String,
    pub status: ConnectionStatus,
    pub remote_ip: String,
    pub location: String,
    pub user_agent: String,
    pub hostname: String,
    // bytes sent by the server to the client
    pub download_traffic_usage: i64,
    // bytes received by the server from the client
    pub upload_traffic_usage: i64,
    pub connected_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Optional narrowing of connected rows.
#[derive(Clone, Debug, Default)]
pub struct ConnectionFilter {
    pub username: Option<String>,
}

impl ConnectionFilter {
    #[must_use]
    pub fn username<S: Into<String>>(username: S) -> Self {
        Self {
            username: Some(username.into()),
        }
    }
}

impl<I> fmt::Display for Connection<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.username, self.external_id)
    }
}

impl Connection<NoId> {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        external_id: String,
        username: String,
        remote_ip: String,
        location: String,
        user_agent: String,
        hostname: String,
        download_traffic_usage: i64,
        upload_traffic_usage: i64,
        connected_at: NaiveDateTime,
        updated_at: NaiveDateTime,
    ) -> Self {
        Self {
            id: NoId,
            external_id,
            username,
            status: ConnectionStatus::Connected,
            remote_ip,
            location,
            user_agent,
            hostname,
            download_traffic_usage,
            upload_traffic_usage,
            connected_at,
            updated_at,
        }
    }

    /// Insert a connected row, or refresh traffic counters and `updated_at`
    /// of the live row sharing the same external id.
    pub async fn upsert<'e, E>(&self, executor: E) -> Result<(), sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query(
            "INSERT INTO connection (external_id, username, status, remote_ip, location, \
            user_agent, hostname, download_traffic_usage, upload_traffic_usage, connected_at, \
            updated_at) \
            VALUES ($1, $2, 'connected', $3, $4, $5, $6, $7, $8, $9, $10) \
            ON CONFLICT (external_id) WHERE status = 'connected' DO UPDATE SET \
            download_traffic_usage = EXCLUDED.download_traffic_usage, \
            upload_traffic_usage = EXCLUDED.upload_traffic_usage, \
            updated_at = EXCLUDED.updated_at",
        )
        .bind(&self.external_id)
        .bind(&self.username)
        .bind(&self.remote_ip)
        .bind(&self.location)
        .bind(&self.user_agent)
        .bind(&self.hostname)
        .bind(self.download_traffic_usage)
        .bind(self.upload_traffic_usage)
        .bind(self.connected_at)
        .bind(self.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }
}

impl Connection<Id> {
    /// Fetch connected rows, newest connection first.
    pub async fn all_connected<'e, E>(
        executor: E,
        filter: &ConnectionFilter,
    ) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query_as::<_, Self>(
            "SELECT id, external_id, username, status, remote_ip, location, user_agent, \
            hostname, download_traffic_usage, upload_traffic_usage, connected_at, updated_at \
            FROM connection \
            WHERE status = 'connected' AND ($1::text IS NULL OR username = $1) \
            ORDER BY connected_at DESC",
        )
        .bind(filter.username.as_deref())
        .fetch_all(executor)
        .await
    }

    /// Transition a row to disconnected, persisting its final traffic reading.
    pub async fn mark_disconnected<'e, E>(
        executor: E,
        id: Id,
        download_traffic_usage: i64,
        upload_traffic_usage: i64,
    ) -> Result<(), sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query(
            "UPDATE connection SET status = 'disconnected', download_traffic_usage = $2, \
            upload_traffic_usage = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(download_traffic_usage)
        .bind(upload_traffic_usage)
        .bind(Utc::now().naive_utc())
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Mark a connected row as disconnected and return its ocserv session id.
    ///
    /// Returns `None` if there is no connected row with given id.
    pub async fn disconnect_by_id<'e, E>(executor: E, id: Id) -> Result<Option<String>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query_scalar::<_, String>(
            "UPDATE connection SET status = 'disconnected', updated_at = $2 \
            WHERE id = $1 AND status = 'connected' RETURNING external_id",
        )
        .bind(id)
        .bind(Utc::now().naive_utc())
        .fetch_optional(executor)
        .await
    }
}

impl FromRow<'_, PgRow> for Connection<Id> {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            external_id: row.try_get("external_id")?,
            username: row.try_get("username")?,
            status: row.try_get("status")?,
            remote_ip: row.try_get("remote_ip")?,
            location: row.try_get("location")?,
            user_agent: row.try_get("user_agent")?,
            hostname: row.try_get("hostname")?,
            download_traffic_usage: row.try_get("download_traffic_usage")?,
            upload_traffic_usage: row.try_get("upload_traffic_usage")?,
            connected_at: row.try_get("connected_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Server-wide connection statistics.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SystemStatus {
    pub total_active_connections: i64,
    pub online_users: i64,
    pub total_users: i64,
    pub total_download_usage: i64,
    pub total_upload_usage: i64,
}

impl SystemStatus {
    pub async fn fetch<'e, E>(executor: E) -> Result<Self, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let row = query(
            "SELECT \
            (SELECT count(*) FROM connection WHERE status = 'connected') total_active_connections, \
            (SELECT count(DISTINCT username) FROM connection WHERE status = 'connected') online_users, \
            (SELECT count(*) FROM \"user\") total_users, \
            (SELECT COALESCE(sum(download_traffic_usage), 0)::bigint FROM connection) total_download_usage, \
            (SELECT COALESCE(sum(upload_traffic_usage), 0)::bigint FROM connection) total_upload_usage",
        )
        .fetch_one(executor)
        .await?;

        Ok(Self {
            total_active_connections: row.try_get("total_active_connections")?,
            online_users: row.try_get("online_users")?,
            total_users: row.try_get("total_users")?,
            total_download_usage: row.try_get("total_download_usage")?,
            total_upload_usage: row.try_get("total_upload_usage")?,
        })
    }
}
