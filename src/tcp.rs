//! Pooled TCP connections

use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::trace;

use crate::connection::{ConnectionSource, PooledConnection};
use crate::event_loop::EventLoop;

/// Opens plain TCP connections to a fixed address.
#[derive(Debug, Clone)]
pub struct TcpSource {
    addr: SocketAddr,
}

impl TcpSource {
    pub fn new(addr: SocketAddr) -> Self {
        TcpSource { addr }
    }
}

impl ConnectionSource for TcpSource {
    type Connection = TcpConnection;
    type Error = io::Error;

    async fn make_connection(&self, event_loop: &EventLoop) -> io::Result<TcpConnection> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        trace!(peer = %self.addr, event_loop = event_loop.id(), "tcp connection opened");
        Ok(TcpConnection {
            stream,
            peer: self.addr,
            closed: false,
        })
    }
}

/// A TCP stream that remembers whether it has seen EOF or an I/O error.
///
/// The stream's I/O is driven by the loop it was opened on. An idle stream is
/// checked with a non-blocking peek, so a peer that hung up while the
/// connection sat in the pool is noticed without any I/O from the caller.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    closed: bool,
}

impl TcpConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let result = self.stream.write_all(buf).await;
        self.closed |= result.is_err();
        result
    }

    /// Read into `buf`. `Ok(0)` means the peer hung up.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let result = self.stream.read(buf).await;
        self.closed |= !matches!(&result, Ok(n) if *n > 0 || buf.is_empty());
        result
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let result = self.stream.read_exact(buf).await.map(|_| ());
        self.closed |= result.is_err();
        result
    }

    /// Send `message` and read back exactly as many bytes.
    pub async fn round_trip(&mut self, message: &[u8]) -> io::Result<Vec<u8>> {
        self.write_all(message).await?;
        let mut response = vec![0; message.len()];
        self.read_exact(&mut response).await?;
        Ok(response)
    }
}

impl PooledConnection for TcpConnection {
    type Error = io::Error;

    fn is_closed(&self) -> bool {
        if self.closed {
            return true;
        }
        let mut byte = [0; 1];
        let mut buf = ReadBuf::new(&mut byte);
        let mut cx = Context::from_waker(Waker::noop());
        match self.stream.poll_peek(&mut cx, &mut buf) {
            // nothing to read yet, the peer is still there
            Poll::Pending => false,
            Poll::Ready(Ok(0)) => true,
            Poll::Ready(Ok(_)) => false,
            Poll::Ready(Err(err)) => {
                trace!(peer = %self.peer, error = %err, "idle tcp connection failed");
                true
            }
        }
    }

    async fn close(mut self) -> io::Result<()> {
        self.closed = true;
        trace!(peer = %self.peer, "closing tcp connection");
        match self.stream.shutdown().await {
            // the peer beat us to it
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::TcpSource;
    use crate::config::PoolConfig;
    use crate::connection::PooledConnection;
    use crate::event_loop::EventLoop;
    use crate::pool::ConnectionPool;

    async fn echo_server() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn round_trip_through_pool() {
        let listener = echo_server().await;
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });

        let event_loop = EventLoop::new().unwrap();
        let pool = ConnectionPool::new(
            Arc::new(TcpSource::new(addr)),
            PoolConfig::new(1),
            &event_loop,
        );

        let echoed = pool
            .with_connection(async |conn| conn.round_trip(b"hello").await)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, b"hello");

        let mut conn = pool.request().await.unwrap();
        assert_eq!(conn.peer_addr(), addr);
        assert_eq!(conn.round_trip(b"again").await.unwrap(), b"again");
        pool.release(conn);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn hung_up_connection_is_pruned() {
        let listener = echo_server().await;
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                // hang up immediately
                let _ = stream.shutdown().await;
            }
        });

        let event_loop = EventLoop::new().unwrap();
        let pool = ConnectionPool::new(
            Arc::new(TcpSource::new(addr)),
            PoolConfig::new(1),
            &event_loop,
        );

        let mut conn = pool.request().await.unwrap();
        let mut buf = [0; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert!(conn.is_closed());
        pool.release(conn);

        // the server hangs up on the replacement too, so only the count says
        // anything here
        let replacement = pool.request().await.unwrap();
        assert_eq!(pool.live_count(), 1);
        pool.release(replacement);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn peer_hanging_up_while_idle_is_pruned() {
        let listener = echo_server().await;
        let addr = listener.local_addr().unwrap();
        let (accepted_send, mut accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                if accepted_send.send(stream).is_err() {
                    return;
                }
            }
        });

        let event_loop = EventLoop::new().unwrap();
        let pool = ConnectionPool::new(
            Arc::new(TcpSource::new(addr)),
            PoolConfig::new(1),
            &event_loop,
        );

        let conn = pool.request().await.unwrap();
        assert!(!conn.is_closed());
        let first_peer = accepted.recv().await.unwrap();
        pool.release(conn);

        // hang up on the idle connection and give the FIN time to land
        drop(first_peer);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut replacement = pool.request().await.unwrap();
        let mut second_peer = tokio::time::timeout(Duration::from_secs(1), accepted.recv())
            .await
            .expect("no replacement connection was opened")
            .unwrap();
        assert_eq!(pool.live_count(), 1);
        assert!(!replacement.is_closed());

        second_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0; 4];
        replacement.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        pool.release(replacement);
        pool.close().await.unwrap();
    }
}
