//! Mirroring of ocserv session snapshots into the connection table.

use chrono::NaiveDateTime;
use ocguard_common::db::Connection;
use ocguard_ocserv::OcservSession;
use tracing::{debug, warn};

use crate::{error::QuotaError, store::ConnectionStore};

/// Convert a session snapshot taken at `observed_at` into connection records.
#[must_use]
pub fn connections_from_sessions(
    sessions: &[OcservSession],
    observed_at: NaiveDateTime,
) -> Vec<Connection> {
    sessions
        .iter()
        .map(|session| {
            let connected_at = session.connected_at().unwrap_or_else(|| {
                warn!(
                    "Session {} of user {} has no valid connection time, using snapshot time",
                    session.id, session.username
                );
                observed_at
            });
            Connection::new(
                session.external_id(),
                session.username.clone(),
                session.remote_ip.clone(),
                session.location.clone(),
                session.user_agent.clone(),
                session.hostname.clone(),
                session.download(),
                session.upload(),
                connected_at,
                observed_at,
            )
        })
        .collect()
}

/// Merge a snapshot into the store.
///
/// Every merged row is stamped with `observed_at`, which is returned as the
/// cutoff: connected rows last seen before it were missing from this snapshot.
pub async fn ingest_snapshot<S>(
    store: &S,
    sessions: &[OcservSession],
    observed_at: NaiveDateTime,
) -> Result<NaiveDateTime, QuotaError>
where
    S: ConnectionStore + Sync,
{
    debug!("Ingesting snapshot of {} live sessions", sessions.len());
    let connections = connections_from_sessions(sessions, observed_at);
    store.upsert_connections(&connections).await?;
    Ok(observed_at)
}

#[cfg(test)]
mod test {
    use chrono::{DateTime, TimeDelta};
    use claims::{assert_err, assert_ok};
    use ocguard_common::db::{ConnectionFilter, ConnectionStatus};

    use super::*;
    use crate::testing::MemoryStore;

    fn session(id: i64, username: &str, rx: i64, tx: i64) -> OcservSession {
        OcservSession {
            id,
            username: username.into(),
            remote_ip: "203.0.113.7".into(),
            location: "unknown".into(),
            user_agent: "AnyConnect".into(),
            hostname: "laptop".into(),
            rx,
            tx,
            connected_at_text: String::new(),
            raw_connected_at: Some(1_717_242_000),
        }
    }

    fn observed_at() -> NaiveDateTime {
        DateTime::from_timestamp(1_717_245_600, 0)
            .unwrap()
            .naive_utc()
    }

    #[test]
    fn test_sessions_are_converted() {
        let mut without_time = session(2, "ron", 5, 6);
        without_time.raw_connected_at = None;

        let connections =
            connections_from_sessions(&[session(1, "hpotter", 10, 20), without_time], observed_at());

        assert_eq!(connections.len(), 2);
        assert_eq!(connections[0].external_id, "1");
        assert_eq!(connections[0].status, ConnectionStatus::Connected);
        assert_eq!(connections[0].download_traffic_usage, 20);
        assert_eq!(connections[0].upload_traffic_usage, 10);
        assert_eq!(
            connections[0].connected_at,
            DateTime::from_timestamp(1_717_242_000, 0).unwrap().naive_utc()
        );
        assert_eq!(connections[0].updated_at, observed_at());
        assert_eq!(connections[1].connected_at, observed_at());
    }

    #[tokio::test]
    async fn test_ingest_updates_existing_session() {
        let store = MemoryStore::default();
        let first = observed_at();
        let second = first + TimeDelta::seconds(5);

        assert_ok!(ingest_snapshot(&store, &[session(1, "hpotter", 10, 20)], first).await);
        let cutoff = assert_ok!(
            ingest_snapshot(
                &store,
                &[session(1, "hpotter", 15, 40), session(2, "ron", 1, 1)],
                second
            )
            .await
        );
        assert_eq!(cutoff, second);

        let rows = store.connections();
        assert_eq!(rows.len(), 2);
        let harry = rows.iter().find(|row| row.external_id == "1").unwrap();
        assert_eq!(harry.download_traffic_usage, 40);
        assert_eq!(harry.upload_traffic_usage, 15);
        assert_eq!(harry.updated_at, second);
    }

    #[tokio::test]
    async fn test_reingesting_identical_snapshot_is_idempotent() {
        let store = MemoryStore::default();
        let snapshot = [session(1, "hpotter", 10, 20), session(2, "ron", 3, 4)];

        assert_ok!(ingest_snapshot(&store, &snapshot, observed_at()).await);
        let before = store.connections();
        assert_ok!(ingest_snapshot(&store, &snapshot, observed_at()).await);
        let after = store.connections();

        assert_eq!(before, after);
        assert_eq!(
            assert_ok!(store.list_connected(&ConnectionFilter::default()).await).len(),
            2
        );
    }

    #[tokio::test]
    async fn test_failed_ingest_leaves_store_untouched() {
        let store = MemoryStore::default();
        store.fail_upserts(true);

        assert_err!(ingest_snapshot(&store, &[session(1, "hpotter", 10, 20)], observed_at()).await);
        assert!(store.connections().is_empty());
    }
}
