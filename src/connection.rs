//! Capabilities a pooled resource has to provide

use std::error::Error;

use crate::event_loop::EventLoop;

/// A resource that can sit idle in a [`ConnectionPool`](crate::pool::ConnectionPool).
///
/// The pool only ever asks two things of it: whether it has died, and to
/// shut it down.
pub trait PooledConnection: Send + 'static {
    type Error: Error + Send + Sync + 'static;

    /// Cheap, synchronous probe. Must not perform I/O or change state.
    fn is_closed(&self) -> bool;

    /// Shut the resource down.
    fn close(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Factory for new pooled resources.
pub trait ConnectionSource: Send + Sync + 'static {
    type Connection: PooledConnection;
    type Error: Error + Send + Sync + 'static;

    /// Open a new connection bound to `event_loop`.
    ///
    /// The pool always calls this from a task running on `event_loop`, so
    /// any I/O registered here is driven by that loop.
    fn make_connection(
        &self,
        event_loop: &EventLoop,
    ) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;
}
