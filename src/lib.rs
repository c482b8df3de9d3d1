pub mod auth;
pub mod booking;
pub mod config;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod store;
pub mod sweeper;
pub mod tls;
pub mod wal;
pub mod wire;
