use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer};

use crate::error::OcservError;

// format of the human readable `Connected at` field
const CONNECTED_AT_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Live session as reported by `occtl -j show users`.
///
/// Only fields relevant for accounting are kept, everything else in the
/// occtl output is ignored.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct OcservSession {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Username", alias = "UserID")]
    pub username: String,
    #[serde(rename = "Remote IP", default)]
    pub remote_ip: String,
    #[serde(rename = "Location", default)]
    pub location: String,
    #[serde(rename = "User-Agent", default)]
    pub user_agent: String,
    #[serde(rename = "Hostname", default)]
    pub hostname: String,
    // bytes received by the server
    #[serde(rename = "RX", deserialize_with = "byte_counter")]
    pub rx: i64,
    // bytes transmitted by the server
    #[serde(rename = "TX", deserialize_with = "byte_counter")]
    pub tx: i64,
    #[serde(rename = "Connected at", default)]
    pub connected_at_text: String,
    #[serde(rename = "raw_connected_at", default)]
    pub raw_connected_at: Option<i64>,
}

impl OcservSession {
    /// Session identifier used by `occtl disconnect id`.
    #[must_use]
    pub fn external_id(&self) -> String {
        self.id.to_string()
    }

    /// Bytes sent to the client.
    #[must_use]
    pub fn download(&self) -> i64 {
        self.tx
    }

    /// Bytes sent by the client.
    #[must_use]
    pub fn upload(&self) -> i64 {
        self.rx
    }

    /// Session start, preferring the raw unix timestamp over the formatted one.
    #[must_use]
    pub fn connected_at(&self) -> Option<NaiveDateTime> {
        self.raw_connected_at
            .and_then(|timestamp| DateTime::from_timestamp(timestamp, 0))
            .map(|timestamp| timestamp.naive_utc())
            .or_else(|| {
                NaiveDateTime::parse_from_str(&self.connected_at_text, CONNECTED_AT_FORMAT).ok()
            })
    }
}

/// Parse the JSON document printed by `occtl -j show users`.
pub fn parse_sessions(output: &[u8]) -> Result<Vec<OcservSession>, OcservError> {
    // occtl prints nothing at all when no one is connected
    if output.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(output)?)
}

// occtl prints traffic counters as strings, accept plain numbers as well
fn byte_counter<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Counter {
        Number(i64),
        Text(String),
    }

    match Counter::deserialize(deserializer)? {
        Counter::Number(value) => Ok(value),
        Counter::Text(value) => value.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use claims::{assert_err, assert_ok};

    use super::*;

    const SHOW_USERS: &str = r#"[
      {
        "ID": 837,
        "Username": "hpotter",
        "Groupname": "(none)",
        "State": "connected",
        "vhost": "default",
        "Device": "vpns0",
        "MTU": "1434",
        "Remote IP": "203.0.113.7",
        "Location": "unknown",
        "Local Device IP": "198.51.100.2",
        "IPv4": "192.168.1.124",
        "P-t-P IPv4": "192.168.1.1",
        "User-Agent": "AnyConnect Darwin_i386 4.10.05095",
        "RX": "1203456",
        "TX": "7340032",
        "_RX": "1.2 MB",
        "_TX": "7.3 MB",
        "Average RX": "1.0 KB/sec",
        "Average TX": "6.1 KB/sec",
        "DPD": "90",
        "KeepAlive": "32400",
        "Hostname": "hogwarts-laptop",
        "Connected at": "2024-06-01 11:40",
        "_Connected at": "20m:01s",
        "raw_connected_at": 1717242000,
        "Full session": "Fv3nWq2M",
        "Session": "Fv3nWq",
        "TLS ciphersuite": "(TLS1.3)-(ECDHE-SECP256R1)-(RSA-PSS-RSAE-SHA256)-(AES-256-GCM)",
        "DNS": ["1.1.1.1"],
        "NBNS": [],
        "Split-DNS-Domains": [],
        "Routes": "defaultroute",
        "No-routes": [],
        "iRoutes": [],
        "Restricted to routes": "False",
        "Restricted to ports": []
      },
      {
        "ID": 838,
        "Username": "hgranger",
        "RX": 0,
        "TX": "15",
        "Connected at": "2024-06-01 11:55"
      }
    ]"#;

    #[test]
    fn test_parse_show_users() {
        let sessions = assert_ok!(parse_sessions(SHOW_USERS.as_bytes()));
        assert_eq!(sessions.len(), 2);

        let first = &sessions[0];
        assert_eq!(first.external_id(), "837");
        assert_eq!(first.username, "hpotter");
        assert_eq!(first.remote_ip, "203.0.113.7");
        assert_eq!(first.hostname, "hogwarts-laptop");
        assert_eq!(first.download(), 7_340_032);
        assert_eq!(first.upload(), 1_203_456);
        assert_eq!(
            first.connected_at(),
            DateTime::from_timestamp(1_717_242_000, 0).map(|t| t.naive_utc())
        );

        let second = &sessions[1];
        assert_eq!(second.upload(), 0);
        assert_eq!(second.download(), 15);
        assert_eq!(second.remote_ip, "");
        assert_eq!(
            second.connected_at(),
            NaiveDate::from_ymd_opt(2024, 6, 1)
                .unwrap()
                .and_hms_opt(11, 55, 0)
        );
    }

    #[test]
    fn test_parse_empty_output() {
        assert_eq!(assert_ok!(parse_sessions(b"")), Vec::new());
        assert_eq!(assert_ok!(parse_sessions(b" \n")), Vec::new());
        assert_eq!(assert_ok!(parse_sessions(b"[]")), Vec::new());
    }

    #[test]
    fn test_parse_invalid_counter() {
        let output = r#"[{"ID": 1, "Username": "ron", "RX": "lots", "TX": "0"}]"#;
        assert_err!(parse_sessions(output.as_bytes()));
    }

    #[test]
    fn test_unparsable_connected_at() {
        let output = r#"[{"ID": 1, "UserID": "ron", "RX": "1", "TX": "2", "Connected at": "yesterday"}]"#;
        let sessions = assert_ok!(parse_sessions(output.as_bytes()));
        assert_eq!(sessions[0].username, "ron");
        assert_eq!(sessions[0].connected_at(), None);
    }
}
