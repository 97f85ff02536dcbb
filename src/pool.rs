//! Connection pools
//!
//! All pool state lives in a [`PoolWorker`] task running on the pool's
//! [`EventLoop`]. The [`ConnectionPool`] handle only posts messages to that
//! task, so it can be used from any thread while the state itself is only
//! ever touched by one.

use std::collections::VecDeque;
use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use pin_project_lite::pin_project;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{Instant, Sleep};
use tracing::{Instrument, Span, debug, trace, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectionSource, PooledConnection};
use crate::error::{CloseError, PoolError};
use crate::event_loop::EventLoop;

type Connection<S> = <S as ConnectionSource>::Connection;
type CheckoutResult<S> = Result<Connection<S>, PoolError<<S as ConnectionSource>::Error>>;
type CheckoutReply<S> = oneshot::Sender<CheckoutResult<S>>;
type CloseReply = oneshot::Sender<Result<(), CloseError>>;

/// Lifecycle of a pool. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Open,
            1 => PoolState::Closing,
            _ => PoolState::Closed,
        }
    }
}

/// Messages from pool handles to the worker
pub(crate) enum PoolMessage<S: ConnectionSource> {
    Request {
        reply: CheckoutReply<S>,
        span: Span,
    },
    Release {
        connection: Connection<S>,
        span: Span,
    },
    Close {
        reply: CloseReply,
        span: Span,
    },
}

/// Completions of work the worker spawned
enum WorkerEvent<S: ConnectionSource> {
    Opened {
        result: Result<Connection<S>, S::Error>,
        reply: CheckoutReply<S>,
        span: Span,
    },
    Drained(Result<(), CloseError>),
}

/// Read-only view of the worker's bookkeeping, published for handles
struct PoolShared {
    live: AtomicUsize,
    state: AtomicU8,
}

enum CloseState {
    Open,
    Closing(Vec<CloseReply>),
    Closed,
}

/// Owner of all pool state. Runs on the pool's event loop.
struct PoolWorker<S: ConnectionSource> {
    source: Arc<S>,
    event_loop: EventLoop,
    capacity: usize,
    live: usize,
    available: VecDeque<Connection<S>>,
    waiters: VecDeque<CheckoutReply<S>>,
    state: CloseState,
    shared: Arc<PoolShared>,
    recv: Receiver<PoolMessage<S>>,
    events_send: Sender<WorkerEvent<S>>,
    events_recv: Receiver<WorkerEvent<S>>,
}

enum Next<S: ConnectionSource> {
    Message(PoolMessage<S>),
    Event(WorkerEvent<S>),
    Disconnected,
}

impl<S: ConnectionSource> PoolWorker<S> {
    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                biased;
                Ok(event) = self.events_recv.recv() => Next::Event(event),
                message = self.recv.recv() => match message {
                    Ok(message) => Next::Message(message),
                    Err(_) => Next::Disconnected,
                },
            };
            match next {
                Next::Message(message) => self.on_message(message),
                Next::Event(event) => self.on_event(event),
                Next::Disconnected => break,
            }
        }
        trace!(
            idle = self.available.len(),
            "every pool handle is gone, worker exiting"
        );
    }

    fn on_message(&mut self, message: PoolMessage<S>) {
        match message {
            PoolMessage::Request { reply, span } => span.in_scope(|| self.request(reply)),
            PoolMessage::Release { connection, span } => {
                span.in_scope(|| self.release(connection))
            }
            PoolMessage::Close { reply, span } => span.in_scope(|| self.close(reply)),
        }
    }

    fn on_event(&mut self, event: WorkerEvent<S>) {
        match event {
            WorkerEvent::Opened {
                result,
                reply,
                span,
            } => span.in_scope(|| self.opened(result, reply)),
            WorkerEvent::Drained(result) => self.drained(result),
        }
    }

    fn publish(&self) {
        let state = match self.state {
            CloseState::Open => PoolState::Open,
            CloseState::Closing(_) => PoolState::Closing,
            CloseState::Closed => PoolState::Closed,
        };
        self.shared.live.store(self.live, Ordering::Release);
        self.shared.state.store(state as u8, Ordering::Release);
    }

    fn request(&mut self, reply: CheckoutReply<S>) {
        if !matches!(self.state, CloseState::Open) {
            let _ = reply.send(Err(PoolError::Closed));
            return;
        }
        if reply.is_closed() {
            trace!("request abandoned before it was handled");
            return;
        }

        while let Some(connection) = self.available.pop_front() {
            if connection.is_closed() {
                self.live -= 1;
                self.publish();
                debug!(live = self.live, "pruned closed idle connection");
                continue;
            }
            trace!("reusing idle connection");
            self.hand_out(reply, connection);
            return;
        }

        if self.live < self.capacity {
            self.live += 1;
            self.publish();
            debug!(
                live = self.live,
                capacity = self.capacity,
                "opening new connection"
            );
            self.open(reply);
            return;
        }

        // drop waiters whose callers have given up so the queue stays bounded
        // by the number of callers actually waiting
        self.waiters.retain(|waiter| !waiter.is_closed());
        self.waiters.push_back(reply);
        trace!(waiters = self.waiters.len(), "pool exhausted, request queued");
    }

    fn open(&self, reply: CheckoutReply<S>) {
        let source = Arc::clone(&self.source);
        let event_loop = self.event_loop.clone();
        let events = self.events_send.clone();
        let span = Span::current();
        let task = async move {
            let result = source.make_connection(&event_loop).await;
            let _ = events
                .send(WorkerEvent::Opened {
                    result,
                    reply,
                    span: Span::current(),
                })
                .await;
        };
        drop(self.event_loop.spawn(task.instrument(span)));
    }

    fn opened(&mut self, result: Result<Connection<S>, S::Error>, reply: CheckoutReply<S>) {
        match result {
            Ok(connection) => {
                trace!("connection opened");
                self.hand_out(reply, connection);
            }
            Err(err) => {
                debug!(error = %err, "failed to open connection");
                // closing already reset the count, so only an open pool gives
                // the reserved slot back
                let open = matches!(self.state, CloseState::Open);
                if open {
                    self.live -= 1;
                    self.publish();
                }
                let _ = reply.send(Err(PoolError::Connect(err)));
                if open {
                    if let Some(waiter) = self.next_waiter() {
                        self.request(waiter);
                    }
                }
            }
        }
    }

    /// Give `connection` to the caller behind `reply`, or take it back if
    /// that caller has gone away.
    fn hand_out(&mut self, reply: CheckoutReply<S>, connection: Connection<S>) {
        if let Err(Ok(connection)) = reply.send(Ok(connection)) {
            trace!("requester went away, taking connection back");
            self.release(connection);
        }
    }

    fn next_waiter(&mut self) -> Option<CheckoutReply<S>> {
        while let Some(waiter) = self.waiters.pop_front() {
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    fn release(&mut self, mut connection: Connection<S>) {
        if !matches!(self.state, CloseState::Open) {
            debug!("pool is closed, closing released connection");
            self.spawn_close(connection);
            return;
        }
        while let Some(waiter) = self.waiters.pop_front() {
            let Err(Ok(returned)) = waiter.send(Ok(connection)) else {
                trace!("handed released connection to waiter");
                return;
            };
            connection = returned;
        }
        self.available.push_back(connection);
        trace!(idle = self.available.len(), "connection parked");
    }

    fn spawn_close(&self, connection: Connection<S>) {
        let task = async move {
            if let Err(err) = connection.close().await {
                debug!(error = %err, "failed to close connection");
            }
        };
        drop(self.event_loop.spawn(task.in_current_span()));
    }

    fn close(&mut self, reply: CloseReply) {
        match &mut self.state {
            CloseState::Closing(observers) => {
                observers.push(reply);
                return;
            }
            CloseState::Closed => {
                let _ = reply.send(Ok(()));
                return;
            }
            CloseState::Open => {}
        }

        let idle: Vec<_> = self.available.drain(..).collect();
        self.live = 0;
        self.state = CloseState::Closing(vec![reply]);
        self.publish();
        debug!(
            idle = idle.len(),
            waiters = self.waiters.len(),
            "closing connection pool"
        );
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(PoolError::Closed));
        }

        let events = self.events_send.clone();
        let task = async move {
            let result = close_all(idle).await;
            let _ = events.send(WorkerEvent::Drained(result)).await;
        };
        drop(self.event_loop.spawn(task.in_current_span()));
    }

    fn drained(&mut self, result: Result<(), CloseError>) {
        let observers = match std::mem::replace(&mut self.state, CloseState::Closed) {
            CloseState::Closing(observers) => observers,
            _ => Vec::new(),
        };
        self.publish();
        match &result {
            Ok(()) => debug!("connection pool closed"),
            Err(err) => warn!(error = %err, "connection pool closed with errors"),
        }
        for observer in observers {
            let _ = observer.send(result.clone());
        }
    }
}

/// Close every connection concurrently, reporting failures together.
async fn close_all<C: PooledConnection>(connections: Vec<C>) -> Result<(), CloseError> {
    let attempted = connections.len();
    let mut closes = JoinSet::new();
    for connection in connections {
        closes.spawn(connection.close());
    }

    let mut failed = 0;
    let mut first: Option<Arc<dyn Error + Send + Sync>> = None;
    while let Some(joined) = closes.join_next().await {
        let err: Arc<dyn Error + Send + Sync> = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => Arc::new(err),
            Err(err) => Arc::new(err),
        };
        warn!(error = %err, "failed to close idle connection");
        failed += 1;
        first.get_or_insert(err);
    }

    match first {
        None => Ok(()),
        Some(first) => Err(CloseError {
            failed,
            attempted,
            first,
        }),
    }
}

/// Sending half of the worker's mailbox
pub(crate) struct Mailbox<S: ConnectionSource> {
    send: Sender<PoolMessage<S>>,
    event_loop: EventLoop,
}

impl<S: ConnectionSource> Clone for Mailbox<S> {
    fn clone(&self) -> Self {
        Mailbox {
            send: self.send.clone(),
            event_loop: self.event_loop.clone(),
        }
    }
}

impl<S: ConnectionSource> Mailbox<S> {
    fn post(&self, message: PoolMessage<S>) -> Result<(), PoolMessage<S>> {
        self.send.try_send(message).map_err(|err| err.into_inner())
    }

    fn release(&self, connection: Connection<S>) {
        let message = PoolMessage::Release {
            connection,
            span: Span::current(),
        };
        if let Err(PoolMessage::Release { connection, .. }) = self.post(message) {
            debug!("pool worker is gone, closing released connection");
            let task = async move {
                if let Err(err) = connection.close().await {
                    debug!(error = %err, "failed to close connection");
                }
            };
            drop(self.event_loop.spawn(task.in_current_span()));
        }
    }
}

pin_project! {
    /// A pending connection request. Resolves once the pool hands over a
    /// connection.
    ///
    /// Dropping it before completion cancels the request; a connection that
    /// was already on its way is returned to the pool.
    #[must_use = "futures do nothing unless polled"]
    pub struct Checkout<S: ConnectionSource> {
        reply: Option<oneshot::Receiver<CheckoutResult<S>>>,
        failed: Option<PoolError<S::Error>>,
        // the timeout and the instant it runs out, fixed when the request is made
        timeout: Option<(Duration, Instant)>,
        #[pin]
        deadline: Option<Sleep>,
        mailbox: Option<Mailbox<S>>,
    }

    impl<S: ConnectionSource> PinnedDrop for Checkout<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(mut reply) = this.reply.take() {
                reply.close();
                let returned = reply.try_recv();
                if let (Ok(Ok(connection)), Some(mailbox)) = (returned, this.mailbox.as_ref()) {
                    mailbox.release(connection);
                }
            }
        }
    }
}

impl<S: ConnectionSource> Checkout<S> {
    fn failed(err: PoolError<S::Error>) -> Self {
        Checkout {
            reply: None,
            failed: Some(err),
            timeout: None,
            deadline: None,
            mailbox: None,
        }
    }
}

impl<S: ConnectionSource> Future for Checkout<S> {
    type Output = CheckoutResult<S>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        if let Some(err) = this.failed.take() {
            return Poll::Ready(Err(err));
        }
        let Some(reply) = this.reply.as_mut() else {
            panic!("`Checkout` polled after completion");
        };
        if let Poll::Ready(result) = Pin::new(reply).poll(cx) {
            *this.reply = None;
            // the worker only drops a reply without answering when it exits
            return Poll::Ready(result.unwrap_or(Err(PoolError::Closed)));
        }

        let Some((timeout, expires)) = *this.timeout else {
            return Poll::Pending;
        };
        if this.deadline.is_none() {
            this.deadline.set(Some(tokio::time::sleep_until(expires)));
        }
        let expired = this
            .deadline
            .as_mut()
            .as_pin_mut()
            .is_some_and(|deadline| deadline.poll(cx).is_ready());
        if !expired {
            return Poll::Pending;
        }

        if let Some(mut reply) = this.reply.take() {
            reply.close();
            // a connection sent just before the close still belongs to us
            if let Ok(result) = reply.try_recv() {
                return Poll::Ready(result);
            }
        }
        debug!(?timeout, "connection request timed out");
        Poll::Ready(Err(PoolError::RequestTimeout(timeout)))
    }
}

/// A bounded pool of connections served by one event loop.
///
/// The pool must be shut down with [`close`](Self::close) before it is
/// dropped; dropping an open pool panics.
pub struct ConnectionPool<S: ConnectionSource> {
    mailbox: Mailbox<S>,
    shared: Arc<PoolShared>,
    capacity: usize,
    request_timeout: Option<Duration>,
    close_requested: AtomicBool,
}

impl<S: ConnectionSource> ConnectionPool<S> {
    /// Create a pool whose worker runs on `event_loop`. Connections are only
    /// opened when requested.
    pub fn new(source: Arc<S>, config: PoolConfig, event_loop: &EventLoop) -> Self {
        assert!(
            config.capacity > 0,
            "connection pool capacity must be greater than zero"
        );
        let (send, recv) = async_channel::unbounded();
        let (events_send, events_recv) = async_channel::unbounded();
        let shared = Arc::new(PoolShared {
            live: AtomicUsize::new(0),
            state: AtomicU8::new(PoolState::Open as u8),
        });

        let worker = PoolWorker {
            source,
            event_loop: event_loop.clone(),
            capacity: config.capacity,
            live: 0,
            available: VecDeque::new(),
            waiters: VecDeque::new(),
            state: CloseState::Open,
            shared: Arc::clone(&shared),
            recv,
            events_send,
            events_recv,
        };
        let span = tracing::debug_span!(
            "connection_pool",
            event_loop = event_loop.id(),
            capacity = config.capacity
        );
        drop(event_loop.spawn(worker.run().instrument(span)));

        ConnectionPool {
            mailbox: Mailbox {
                send,
                event_loop: event_loop.clone(),
            },
            shared,
            capacity: config.capacity,
            request_timeout: config.request_timeout,
            close_requested: AtomicBool::new(false),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.mailbox.event_loop
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Connections currently checked out or idle, as last published by the
    /// worker.
    pub fn live_count(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// True once shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.state() != PoolState::Open
    }

    /// Ask for a connection. The request is queued with the worker right
    /// away, so requests are served in the order this is called.
    pub fn request(&self) -> Checkout<S> {
        if self.is_closed() {
            return Checkout::failed(PoolError::Closed);
        }
        let (reply, recv) = oneshot::channel();
        let message = PoolMessage::Request {
            reply,
            span: Span::current(),
        };
        if self.mailbox.post(message).is_err() {
            return Checkout::failed(PoolError::Closed);
        }
        Checkout {
            reply: Some(recv),
            failed: None,
            timeout: self
                .request_timeout
                .map(|timeout| (timeout, Instant::now() + timeout)),
            deadline: None,
            mailbox: Some(self.mailbox.clone()),
        }
    }

    /// Hand a connection back. Never blocks; once the pool is closing the
    /// connection is closed instead of pooled.
    pub fn release(&self, connection: S::Connection) {
        self.mailbox.release(connection);
    }

    /// Check out a connection for the duration of `f`, then release it.
    pub async fn with_connection<F, R>(&self, f: F) -> Result<R, PoolError<S::Error>>
    where
        F: AsyncFnOnce(&mut S::Connection) -> R,
    {
        let mut connection = self.request().await?;
        let output = f(&mut connection).await;
        self.release(connection);
        Ok(output)
    }

    /// Shut the pool down: fail queued requests and close idle connections.
    ///
    /// Concurrent and repeated calls share one shutdown and see the same
    /// outcome while it is in flight; once closed this returns `Ok(())`.
    /// Checked-out connections are left alone and closed on release.
    pub async fn close(&self) -> Result<(), CloseError> {
        self.start_close().await.unwrap_or(Ok(()))
    }

    pub(crate) fn start_close(&self) -> oneshot::Receiver<Result<(), CloseError>> {
        self.close_requested.store(true, Ordering::Release);
        let (reply, completion) = oneshot::channel();
        // if the worker is gone the reply is dropped and `completion`
        // resolves immediately
        let _ = self.mailbox.post(PoolMessage::Close {
            reply,
            span: Span::current(),
        });
        completion
    }
}

impl<S: ConnectionSource> Drop for ConnectionPool<S> {
    fn drop(&mut self) {
        if !self.close_requested.load(Ordering::Acquire)
            && self.state() == PoolState::Open
            && !thread::panicking()
        {
            panic!("ConnectionPool dropped while open, call close() before dropping it");
        }
    }
}
