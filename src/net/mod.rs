//! Executor connections: one lazily connected channel per replica, health
//! probing with backoff, and per-replica call accounting.

pub mod error;
pub mod pool;
pub mod probe;
pub mod replica;

pub use error::TransportError;
pub use pool::{ConnectionPool, PoolSnapshot};
pub use replica::{ConnState, Lease};
