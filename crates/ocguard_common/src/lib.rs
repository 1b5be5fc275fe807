pub mod config;
pub mod db;
pub mod units;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
