//! One pool per event loop

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::config::PoolConfig;
use crate::connection::ConnectionSource;
use crate::error::{CloseError, PoolError};
use crate::event_loop::{EventLoop, EventLoopGroup};
use crate::pool::ConnectionPool;

/// A [`ConnectionPool`] for every loop of an [`EventLoopGroup`], all fed by
/// the same source.
///
/// `config.capacity` applies to each loop separately. Connections must be
/// released to the pool they came from.
pub struct PoolGroup<S: ConnectionSource> {
    pools: Vec<ConnectionPool<S>>,
    next: AtomicUsize,
}

impl<S: ConnectionSource> PoolGroup<S> {
    pub fn new(source: Arc<S>, config: PoolConfig, group: &EventLoopGroup) -> Self {
        let pools = group
            .iter()
            .map(|event_loop| ConnectionPool::new(Arc::clone(&source), config.clone(), event_loop))
            .collect();
        PoolGroup {
            pools,
            next: AtomicUsize::new(0),
        }
    }

    pub fn pools(&self) -> &[ConnectionPool<S>] {
        &self.pools
    }

    /// The pool running on `event_loop`, if that loop belongs to the group.
    pub fn pool(&self, event_loop: &EventLoop) -> Option<&ConnectionPool<S>> {
        self.pools
            .iter()
            .find(|pool| pool.event_loop().id() == event_loop.id())
    }

    /// The pool of the loop the caller runs on, or the next one in turn when
    /// called from outside the group.
    pub fn any_pool(&self) -> &ConnectionPool<S> {
        self.pools
            .iter()
            .find(|pool| pool.event_loop().in_event_loop())
            .unwrap_or_else(|| {
                let index = self.next.fetch_add(1, Ordering::Relaxed) % self.pools.len();
                &self.pools[index]
            })
    }

    /// Total capacity across all loops.
    pub fn capacity(&self) -> usize {
        self.pools.iter().map(ConnectionPool::capacity).sum()
    }

    pub fn live_count(&self) -> usize {
        self.pools.iter().map(ConnectionPool::live_count).sum()
    }

    /// Run `f` with a connection from [`any_pool`](Self::any_pool), releasing
    /// it back to that pool afterwards.
    pub async fn with_connection<F, R>(&self, f: F) -> Result<R, PoolError<S::Error>>
    where
        F: AsyncFnOnce(&mut S::Connection) -> R,
    {
        self.any_pool().with_connection(f).await
    }

    /// Close every pool. All pools start shutting down at once; failures are
    /// merged into one report.
    pub async fn close(&self) -> Result<(), CloseError> {
        debug!(pools = self.pools.len(), "closing pool group");
        let completions: Vec<_> = self.pools.iter().map(ConnectionPool::start_close).collect();
        let mut outcome = Ok(());
        for completion in completions {
            let Ok(Err(err)) = completion.await else {
                continue;
            };
            outcome = match outcome {
                Ok(()) => Err(err),
                Err(previous) => Err(CloseError::merge(previous, err)),
            };
        }
        outcome
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::PoolGroup;
    use crate::config::PoolConfig;
    use crate::event_loop::EventLoopGroup;
    use crate::pool::PoolState;
    use crate::testing::FakeSource;

    #[tokio::test]
    async fn one_pool_per_loop() {
        let loops = EventLoopGroup::new(2).unwrap();
        let group = PoolGroup::new(Arc::new(FakeSource::new()), PoolConfig::new(3), &loops);
        assert_eq!(group.pools().len(), 2);
        assert_eq!(group.capacity(), 6);
        for event_loop in loops.iter() {
            let pool = group.pool(event_loop).unwrap();
            assert_eq!(pool.event_loop().id(), event_loop.id());
        }
        group.close().await.unwrap();
    }

    #[tokio::test]
    async fn outside_callers_round_robin() {
        let loops = EventLoopGroup::new(2).unwrap();
        let group = PoolGroup::new(Arc::new(FakeSource::new()), PoolConfig::new(1), &loops);

        let first = group.any_pool().request().await.unwrap();
        let second = group.any_pool().request().await.unwrap();
        assert_ne!(first.event_loop, second.event_loop);
        assert_eq!(group.live_count(), 2);
        for pool in group.pools() {
            assert_eq!(pool.live_count(), 1);
        }

        let loop_of_first = loops.iter().find(|l| l.id() == first.event_loop).unwrap();
        group.pool(loop_of_first).unwrap().release(first);
        let loop_of_second = loops.iter().find(|l| l.id() == second.event_loop).unwrap();
        group.pool(loop_of_second).unwrap().release(second);
        group.close().await.unwrap();
    }

    #[tokio::test]
    async fn callers_on_a_loop_use_its_pool() {
        let loops = EventLoopGroup::new(3).unwrap();
        let group = Arc::new(PoolGroup::new(
            Arc::new(FakeSource::new()),
            PoolConfig::new(2),
            &loops,
        ));
        let target = loops.iter().nth(2).unwrap().clone();

        let inner = Arc::clone(&group);
        let opened_on = target
            .spawn(async move {
                inner
                    .with_connection(async |conn| conn.event_loop)
                    .await
                    .unwrap()
            })
            .await
            .unwrap();
        assert_eq!(opened_on, target.id());
        assert_eq!(group.pool(&target).unwrap().live_count(), 1);

        group.close().await.unwrap();
        for pool in group.pools() {
            assert_eq!(pool.state(), PoolState::Closed);
        }
    }

    #[tokio::test]
    async fn close_merges_failures() {
        let loops = EventLoopGroup::new(2).unwrap();
        let source = Arc::new(FakeSource::new());
        let group = PoolGroup::new(Arc::clone(&source), PoolConfig::new(1), &loops);
        for pool in group.pools() {
            let conn = pool.request().await.unwrap();
            pool.release(conn);
        }
        source.fail_closes(true);

        let err = group.close().await.unwrap_err();
        assert_eq!((err.failed, err.attempted), (2, 2));
        assert_eq!(source.closed(), 2);
    }
}
