//! NNTP client: per-connection protocol sessions and per-server pools

pub mod connection;
pub mod pool;

pub use connection::NntpConnection;
pub use pool::{ConnectionPool, DecodeJob, PoolNotice, PoolStats};
