//! Serial execution contexts
//!
//! An [`EventLoop`] is a dedicated OS thread driving a current-thread tokio
//! runtime. Everything spawned onto it runs on that one thread, one task at a
//! time, so state owned by a task on the loop never needs a lock.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task;
use tracing::{debug, trace};

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT_LOOP: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Handle to a single-threaded executor. Cheap to clone.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<EventLoopInner>,
}

struct EventLoopInner {
    id: usize,
    handle: Handle,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Start a new event loop thread.
    pub fn new() -> io::Result<Self> {
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let (stop_send, stop_recv) = oneshot::channel::<()>();
        let (handle_send, handle_recv) = mpsc::sync_channel(1);

        let thread = thread::Builder::new()
            .name(format!("event-loop-{id}"))
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = handle_send.send(Err(err));
                        return;
                    }
                };
                let _ = handle_send.send(Ok(runtime.handle().clone()));
                CURRENT_LOOP.set(Some(id));
                runtime.block_on(async {
                    // resolves on an explicit stop or once every handle is gone
                    let _ = stop_recv.await;
                });
                trace!(event_loop = id, "event loop stopped");
            })?;

        let handle = handle_recv
            .recv()
            .map_err(|_| io::Error::other("event loop thread exited during startup"))??;
        debug!(event_loop = id, "event loop started");

        Ok(EventLoop {
            inner: Arc::new(EventLoopInner {
                id,
                handle,
                stop: Mutex::new(Some(stop_send)),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Whether the calling thread is this loop's thread.
    pub fn in_event_loop(&self) -> bool {
        CURRENT_LOOP.get() == Some(self.inner.id)
    }

    /// Spawn a task onto the loop. Once the loop has stopped the task is
    /// dropped without running and the returned handle reports cancellation.
    pub fn spawn<F>(&self, future: F) -> task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Stop the loop and wait for its thread to exit. Tasks still pending on
    /// the loop are dropped. Called from the loop's own thread, this only
    /// signals the stop.
    pub fn shutdown(&self) {
        if let Some(stop) = self.inner.stop.lock().take() {
            let _ = stop.send(());
        }
        if self.in_event_loop() {
            return;
        }
        if let Some(thread) = self.inner.thread.lock().take() {
            if thread.join().is_err() {
                debug!(event_loop = self.inner.id, "event loop thread panicked");
            }
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl Drop for EventLoopInner {
    fn drop(&mut self) {
        // the thread is left to wind down on its own; joining here could
        // deadlock when the last handle is dropped on the loop itself
        if let Some(stop) = self.stop.get_mut().take() {
            let _ = stop.send(());
        }
    }
}

/// A fixed set of event loops handed out round-robin.
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    pub fn new(count: usize) -> io::Result<Self> {
        assert!(count > 0, "an event loop group needs at least one loop");
        let loops = (0..count)
            .map(|_| EventLoop::new())
            .collect::<io::Result<Vec<_>>>()?;
        Ok(EventLoopGroup {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    pub fn next(&self) -> &EventLoop {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[index]
    }

    /// The loop the caller is running on if it belongs to this group,
    /// otherwise the next one in turn.
    pub fn any(&self) -> &EventLoop {
        self.loops
            .iter()
            .find(|event_loop| event_loop.in_event_loop())
            .unwrap_or_else(|| self.next())
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventLoop> {
        self.loops.iter()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn shutdown(&self) {
        for event_loop in &self.loops {
            event_loop.shutdown();
        }
    }
}
