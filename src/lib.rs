//! Bounded connection pools driven by serial event loops.
//!
//! A [`ConnectionPool`] keeps at most `capacity` connections alive, opens
//! them lazily, queues callers fairly once the cap is reached and prunes
//! connections that died while idle. Its state is owned by a single task on
//! an [`EventLoop`], so every operation is safe to call from any thread
//! without locks around the pool itself.

pub mod common;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod group;
pub mod pool;
pub mod tcp;

#[cfg(test)]
mod testing;

pub use config::PoolConfig;
pub use connection::{ConnectionSource, PooledConnection};
pub use error::{CloseError, PoolError};
pub use event_loop::{EventLoop, EventLoopGroup};
pub use group::PoolGroup;
pub use pool::{Checkout, ConnectionPool, PoolState};
