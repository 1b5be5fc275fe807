use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, Row, postgres::PgRow, query, query_as, query_scalar};

use crate::db::{Id, NoId};

/// VPN account. `username` is the ocserv login.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct User<I = NoId> {
    pub id: I,
    pub username: String,
    // identity in the front end that registered the account
    pub external_id: String,
    pub banned_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

impl<I> User<I> {
    #[must_use]
    pub fn is_banned(&self) -> bool {
        self.banned_at.is_some()
    }
}

impl<I> fmt::Display for User<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.username)
    }
}

impl User<NoId> {
    #[must_use]
    pub fn new<S: Into<String>>(username: S, external_id: S, created_at: NaiveDateTime) -> Self {
        Self {
            id: NoId,
            username: username.into(),
            external_id: external_id.into(),
            banned_at: None,
            created_at,
        }
    }

    pub async fn save<'e, E>(self, executor: E) -> Result<User<Id>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        let id = query_scalar::<_, Id>(
            "INSERT INTO \"user\" (username, external_id, banned_at, created_at) \
            VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(&self.username)
        .bind(&self.external_id)
        .bind(self.banned_at)
        .bind(self.created_at)
        .fetch_one(executor)
        .await?;

        Ok(User {
            id,
            username: self.username,
            external_id: self.external_id,
            banned_at: self.banned_at,
            created_at: self.created_at,
        })
    }
}

impl User<Id> {
    pub async fn find_by_id<'e, E>(executor: E, id: Id) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query_as::<_, Self>(
            "SELECT id, username, external_id, banned_at, created_at FROM \"user\" WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_by_username<'e, E>(
        executor: E,
        username: &str,
    ) -> Result<Option<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query_as::<_, Self>(
            "SELECT id, username, external_id, banned_at, created_at FROM \"user\" \
            WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(executor)
        .await
    }

    pub async fn find_many_by_usernames<'e, E>(
        executor: E,
        usernames: &[String],
    ) -> Result<Vec<Self>, sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query_as::<_, Self>(
            "SELECT id, username, external_id, banned_at, created_at FROM \"user\" \
            WHERE username = ANY($1)",
        )
        .bind(usernames)
        .fetch_all(executor)
        .await
    }

    pub async fn set_banned_at<'e, E>(
        executor: E,
        id: Id,
        banned_at: Option<NaiveDateTime>,
    ) -> Result<(), sqlx::Error>
    where
        E: PgExecutor<'e>,
    {
        query("UPDATE \"user\" SET banned_at = $2 WHERE id = $1")
            .bind(id)
            .bind(banned_at)
            .execute(executor)
            .await?;

        Ok(())
    }
}

impl FromRow<'_, PgRow> for User<Id> {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            external_id: row.try_get("external_id")?,
            banned_at: row.try_get("banned_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
