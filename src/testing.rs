//! In-memory connections for exercising pools

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::connection::{ConnectionSource, PooledConnection};
use crate::event_loop::EventLoop;

#[derive(Debug, thiserror::Error)]
#[error("fake failure: {0}")]
pub struct FakeError(&'static str);

/// Source handing out numbered [`FakeConnection`]s.
#[derive(Default)]
pub struct FakeSource {
    next_id: AtomicUsize,
    started: AtomicUsize,
    failing_opens: AtomicUsize,
    failing_closes: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
    open_delay: Option<Duration>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Make the next `count` opens fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn fail_closes(&self, fail: bool) {
        self.failing_closes.store(fail, Ordering::SeqCst);
    }

    /// opens begun so far, finished or not
    pub fn opens_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// successful opens so far
    pub fn opened(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    /// close calls so far, failed ones included
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ConnectionSource for FakeSource {
    type Connection = FakeConnection;
    type Error = FakeError;

    async fn make_connection(&self, event_loop: &EventLoop) -> Result<FakeConnection, FakeError> {
        assert!(event_loop.in_event_loop(), "opened off the pool's loop");
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        let fail = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(FakeError("open refused"));
        }
        Ok(FakeConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            event_loop: event_loop.id(),
            dead: KillSwitch(Arc::new(AtomicBool::new(false))),
            failing_closes: Arc::clone(&self.failing_closes),
            closed: Arc::clone(&self.closed),
        })
    }
}

#[derive(Debug, Clone)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
    pub fn kill(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct FakeConnection {
    pub id: usize,
    /// id of the loop the connection was opened on
    pub event_loop: usize,
    dead: KillSwitch,
    failing_closes: Arc<AtomicBool>,
    closed: Arc<AtomicUsize>,
}

impl FakeConnection {
    /// Handle for marking the connection dead after it has been released.
    pub fn kill_switch(&self) -> KillSwitch {
        self.dead.clone()
    }
}

impl PooledConnection for FakeConnection {
    type Error = FakeError;

    fn is_closed(&self) -> bool {
        self.dead.0.load(Ordering::SeqCst)
    }

    async fn close(self) -> Result<(), FakeError> {
        self.dead.kill();
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.failing_closes.load(Ordering::SeqCst) {
            return Err(FakeError("close refused"));
        }
        Ok(())
    }
}

/// Wait up to a second for `check` to hold.
pub async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
