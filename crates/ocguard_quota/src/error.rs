use ocguard_common::db::Id;
use ocguard_ocserv::OcservError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("Database error: {0}")]
    DbError(#[from] sqlx::Error),
    #[error("VPN control error: {0}")]
    VpnControlError(#[from] OcservError),
    #[error("User with ID {0} does not exist")]
    UserDoesNotExistError(Id),
    #[error("User {0} does not exist")]
    UsernameDoesNotExistError(String),
    #[error("Connection with ID {0} does not exist or is already disconnected")]
    ConnectionDoesNotExistError(Id),
}
