use std::str::FromStr;

use clap::Parser;
use humantime::Duration;
use secrecy::SecretString;
use serde::Serialize;

#[derive(Clone, Parser, Serialize, Debug)]
#[command(version)]
// TODO: find a better workaround for clap not
// working nice with test args
#[cfg_attr(test, command(ignore_errors(true)))]
pub struct OcguardConfig {
    #[arg(long, env = "OCGUARD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "OCGUARD_DB_HOST", default_value = "localhost")]
    pub database_host: String,

    #[arg(long, env = "OCGUARD_DB_PORT", default_value_t = 5432)]
    pub database_port: u16,

    #[arg(long, env = "OCGUARD_DB_NAME", default_value = "ocguard")]
    pub database_name: String,

    #[arg(long, env = "OCGUARD_DB_USER", default_value = "ocguard")]
    pub database_user: String,

    #[arg(long, env = "OCGUARD_DB_PASSWORD", default_value = "")]
    #[serde(skip_serializing)]
    pub database_password: SecretString,

    // ocserv password file managed with `ocpasswd`
    #[arg(
        long,
        env = "OCGUARD_OCPASSWD_FILE",
        default_value = "/etc/ocserv/ocpasswd"
    )]
    pub ocpasswd_file: String,

    #[arg(
        long,
        env = "OCGUARD_MANAGER_UPDATE_INTERVAL",
        default_value = "5s",
        value_parser = parse_update_interval
    )]
    #[serde(skip_serializing)]
    pub update_interval: Duration,

    #[arg(long, env = "OCGUARD_MANAGER_UPDATE_TIMEOUT", default_value = "60s")]
    #[serde(skip_serializing)]
    pub update_timeout: Duration,

    #[arg(long, env = "OCGUARD_MANAGER_MAX_FAILURES", default_value_t = 10)]
    pub max_failures: u32,

    #[arg(
        long,
        env = "OCGUARD_MANAGER_SHUTDOWN_ON_MAX_FAILURES",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub shutdown_on_max_failures: bool,

    #[arg(long, env = "OCGUARD_TRIAL_PACKAGE_ENABLED")]
    pub trial_package_enabled: bool,

    #[arg(long, env = "OCGUARD_TRIAL_PACKAGE_TRAFFIC_GB", default_value_t = 5.0)]
    pub trial_package_traffic_gb: f64,

    #[arg(long, env = "OCGUARD_TRIAL_PACKAGE_MAX_CONNECTIONS", default_value_t = 2)]
    pub trial_package_max_connections: i32,

    #[arg(long, env = "OCGUARD_TRIAL_PACKAGE_DURATION_DAYS", default_value_t = 7)]
    pub trial_package_duration_days: i32,
}

/// Tick period of the control loop, which must be non-zero.
pub fn parse_update_interval(value: &str) -> Result<Duration, String> {
    let interval = Duration::from_str(value).map_err(|err| err.to_string())?;
    if interval.is_zero() {
        return Err("update interval must be greater than zero".into());
    }
    Ok(interval)
}

impl OcguardConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::parse()
    }

    // this is an ugly workaround to avoid `cargo test` args being captured by `clap`
    #[must_use]
    pub fn new_test_config() -> Self {
        Self::parse_from::<[_; 0], String>([])
    }
}

impl Default for OcguardConfig {
    fn default() -> Self {
        Self::new()
    }
}
