pub mod connection;
pub mod package;
pub mod user;
