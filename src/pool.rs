//! Upstream pool connection (C2): TCP connect with timeout and a FIFO
//! outbound queue so writes never block on a connection that's mid-reconnect.
//!
//! Grounded on `src/stratum/v1/connection.rs::StratumConnection`, generalized
//! away from the single-upstream `Miner` trait and adapted to
//! `dpmpv2.py::ProxySession.up_q`/`connect_pool`.

use crate::error::ProxyError;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Identifies one of the two upstream pools a session is bridging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolId {
    A,
    B,
}

impl PoolId {
    pub fn other(self) -> PoolId {
        match self {
            PoolId::A => PoolId::B,
            PoolId::B => PoolId::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PoolId::A => "A",
            PoolId::B => "B",
        }
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection to one upstream pool. Outbound lines written before the
/// socket is connected (or while it's being re-established) queue up and
/// flush on the next successful connect, mirroring the source's `up_q`.
pub struct PoolLink {
    pub id: PoolId,
    pub host: String,
    pub port: u16,
    writer: Mutex<Option<OwnedWriteHalf>>,
    queue: Mutex<VecDeque<String>>,
}

impl PoolLink {
    pub fn new(id: PoolId, host: String, port: u16) -> Self {
        Self {
            id,
            host,
            port,
            writer: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Connect with a bounded timeout, disable Nagle, split the stream, and
    /// flush any lines queued while disconnected. Returns the read half for
    /// the caller's reader task.
    pub async fn connect(&self) -> Result<BufReader<OwnedReadHalf>, ProxyError> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProxyError::UpstreamTransient(format!("connect timeout to {addr}")))?
            .map_err(|e| ProxyError::UpstreamTransient(format!("connect to {addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ProxyError::UpstreamTransient(format!("set_nodelay: {e}")))?;

        let (read_half, write_half) = stream.into_split();
        {
            let mut w = self.writer.lock().await;
            *w = Some(write_half);
        }
        self.flush_queue().await;
        log::info!("event=pool_connected pool={} addr={addr}", self.id.as_str());
        Ok(BufReader::new(read_half))
    }

    /// Drop the writer so subsequent sends queue until the next `connect()`.
    pub async fn disconnect(&self) {
        let mut w = self.writer.lock().await;
        *w = None;
    }

    async fn flush_queue(&self) {
        let mut pending: Vec<String> = {
            let mut q = self.queue.lock().await;
            q.drain(..).collect()
        };
        for line in pending.drain(..) {
            if let Err(e) = self.write_now(&line).await {
                log::warn!("event=pool_flush_error pool={} err={e}", self.id.as_str());
                self.enqueue(line).await;
                break;
            }
        }
    }

    async fn enqueue(&self, line: String) {
        let mut q = self.queue.lock().await;
        q.push_back(line);
    }

    async fn write_now(&self, line: &str) -> Result<(), ProxyError> {
        let mut w = self.writer.lock().await;
        match w.as_mut() {
            Some(writer) => {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
                Ok(())
            }
            None => Err(ProxyError::UpstreamTransient("not connected".to_string())),
        }
    }

    /// Send a line (without trailing newline). Queues it if the connection
    /// is down; surfaces a transient error (triggering failover) if the
    /// write itself fails on an apparently-live socket.
    pub async fn send(&self, line: String) -> Result<(), ProxyError> {
        let is_connected = self.writer.lock().await.is_some();
        if !is_connected {
            self.enqueue(line).await;
            return Ok(());
        }
        if let Err(e) = self.write_now(&line).await {
            self.disconnect().await;
            self.enqueue(line).await;
            return Err(e);
        }
        Ok(())
    }
}

/// Both upstream links for one session, bundled for convenient lookup by
/// `PoolId`.
pub struct PoolLinks {
    pub a: std::sync::Arc<PoolLink>,
    pub b: std::sync::Arc<PoolLink>,
}

impl PoolLinks {
    pub fn get(&self, id: PoolId) -> &std::sync::Arc<PoolLink> {
        match id {
            PoolId::A => &self.a,
            PoolId::B => &self.b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_id_other_flips() {
        assert_eq!(PoolId::A.other(), PoolId::B);
        assert_eq!(PoolId::B.other(), PoolId::A);
    }

    #[test]
    fn pool_id_display() {
        assert_eq!(PoolId::A.as_str(), "A");
        assert_eq!(format!("{}", PoolId::B), "B");
    }

    #[tokio::test]
    async fn send_before_connect_queues_without_error() {
        let link = PoolLink::new(PoolId::A, "127.0.0.1".to_string(), 1);
        let res = link.send("hello".to_string()).await;
        assert!(res.is_ok());
        assert_eq!(link.queue.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn connect_and_send_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(socket);
            let mut line = String::new();
            tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line)
                .await
                .unwrap();
            line
        });

        let link = PoolLink::new(PoolId::A, addr.ip().to_string(), addr.port());
        link.send("queued-before-connect".to_string()).await.unwrap();
        let _reader = link.connect().await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received.trim_end(), "queued-before-connect");
    }
}
