// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted pool of connections to downstream forwarders.
//!
//! ```text
//!   ConnPool (std Mutex: map structure + refcounts only)
//!     "central:1463" ─► Arc<tokio Mutex<ForwarderConn>>, refs = 2
//!     "aggregators"  ─► Arc<tokio Mutex<ForwarderConn>>, refs = 1
//! ```
//!
//! The map lock is never held while a connection lock is awaited, so a slow
//! send to one forwarder never blocks opens, closes or sends on another key.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::counters::{Counter, Counters};
use crate::entry::{batch_size, LogEntry, ResultCode};
use crate::membership::ServerAddr;
use crate::wire::{self, WireError};

const SEND_ATTEMPTS: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out talking to {0}")]
    Timeout(String),

    #[error("no servers available for {0}")]
    NoServers(String),

    #[error("connection is not open")]
    NotOpen,

    #[error("connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("reply seqid {got} does not match request {expected}")]
    SeqIdMismatch { expected: i32, got: i32 },
}

#[derive(Clone, Debug)]
enum Target {
    Host(ServerAddr),
    Service {
        name: String,
        servers: Vec<ServerAddr>,
    },
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Host(addr) => write!(f, "<{addr}>"),
            Target::Service { name, .. } => write!(f, "<service: {name}>"),
        }
    }
}

/// One client connection speaking the `Log` call.
pub struct ForwarderConn {
    target: Target,
    timeout: Duration,
    counters: Arc<Counters>,
    transport: Option<Framed<TcpStream, LengthDelimitedCodec>>,
    seqid: i32,
}

impl ForwarderConn {
    pub fn to_host(addr: ServerAddr, timeout: Duration, counters: Arc<Counters>) -> Self {
        Self::new(Target::Host(addr), timeout, counters)
    }

    /// Connects to any one of `servers`, tried in random order.
    pub fn to_service(
        name: impl Into<String>,
        servers: Vec<ServerAddr>,
        timeout: Duration,
        counters: Arc<Counters>,
    ) -> Self {
        Self::new(
            Target::Service {
                name: name.into(),
                servers,
            },
            timeout,
            counters,
        )
    }

    fn new(target: Target, timeout: Duration, counters: Arc<Counters>) -> Self {
        ForwarderConn {
            target,
            timeout,
            counters,
            transport: None,
            seqid: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub async fn open(&mut self) -> Result<(), ConnError> {
        let stream = match &self.target {
            Target::Host(addr) => self.connect(addr).await,
            Target::Service { name, servers } => {
                let mut candidates = servers.clone();
                candidates.shuffle(&mut rand::rng());
                let mut last_error = ConnError::NoServers(name.clone());
                let mut connected = None;
                for addr in &candidates {
                    match self.connect(addr).await {
                        Ok(stream) => {
                            connected = Some(stream);
                            break;
                        }
                        Err(e) => {
                            debug!("Service <{}> member {} unavailable: {}", name, addr, e);
                            last_error = e;
                        }
                    }
                }
                connected.ok_or(last_error)
            }
        };

        match stream {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", self.target, e);
                }
                self.transport = Some(wire::framed(stream));
                info!("Opened connection to remote forwarder {}", self.target);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to open connection to remote forwarder {}: {}", self.target, e);
                Err(e)
            }
        }
    }

    async fn connect(&self, addr: &ServerAddr) -> Result<TcpStream, ConnError> {
        let connect = TcpStream::connect((addr.host.as_str(), addr.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnError::Connect {
                target: addr.to_string(),
                source,
            }),
            Err(_) => Err(ConnError::Timeout(addr.to_string())),
        }
    }

    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = SinkExt::<Bytes>::close(&mut transport).await {
                debug!("Error <{}> while closing connection to {}", e, self.target);
            }
        }
    }

    /// Sends `entries`, reconnecting once after a transport failure.
    ///
    /// A reply other than `OK`, including an unrecognised result code, is not
    /// retried.
    pub async fn send(&mut self, entries: &[LogEntry]) -> bool {
        if entries.is_empty() {
            return true;
        }
        let size = entries.len();

        for attempt in 1..=SEND_ATTEMPTS {
            match self.call(entries).await {
                Ok(ResultCode::Ok) => {
                    self.counters.add(Counter::Sent, size as u64);
                    debug!(
                        "Sent <{}> messages ({} bytes) to remote forwarder {}",
                        size,
                        batch_size(entries),
                        self.target
                    );
                    return true;
                }
                Ok(code) => {
                    warn!(
                        "Failed to send <{}> messages, remote forwarder {} returned <{}>",
                        size, self.target, code
                    );
                    return false;
                }
                Err(ConnError::Wire(WireError::UnknownResultCode(code))) => {
                    warn!(
                        "Failed to send <{}> messages, remote forwarder {} returned unknown result <{}>",
                        size, self.target, code
                    );
                    return false;
                }
                Err(e) => {
                    warn!(
                        "Failed to send <{}> messages to remote forwarder {}: {}",
                        size, self.target, e
                    );
                }
            }

            self.close().await;
            if attempt == SEND_ATTEMPTS {
                break;
            }
            if self.open().await.is_err() {
                return false;
            }
            info!("Reopened connection to remote forwarder {}", self.target);
        }
        false
    }

    async fn call(&mut self, entries: &[LogEntry]) -> Result<ResultCode, ConnError> {
        self.seqid = self.seqid.wrapping_add(1);
        let seqid = self.seqid;
        let timeout = self.timeout;
        let target = self.target.to_string();
        let transport = self.transport.as_mut().ok_or(ConnError::NotOpen)?;

        let request = wire::encode_log_call(seqid, entries);
        tokio::time::timeout(timeout, transport.send(request))
            .await
            .map_err(|_| ConnError::Timeout(target.clone()))??;

        let frame = tokio::time::timeout(timeout, transport.next())
            .await
            .map_err(|_| ConnError::Timeout(target))?
            .ok_or(ConnError::Closed)??;

        let (got, code) = wire::decode_log_reply(&frame)?;
        if got != seqid {
            return Err(ConnError::SeqIdMismatch {
                expected: seqid,
                got,
            });
        }
        Ok(code)
    }
}

struct PoolEntry {
    conn: Arc<TokioMutex<ForwarderConn>>,
    refs: usize,
}

/// Shared connections keyed by `host:port` or service name.
#[derive(Default)]
pub struct ConnPool {
    conns: Mutex<HashMap<String, PoolEntry>>,
}

impl ConnPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_key(host: &str, port: u16) -> String {
        format!("{host}:{port}")
    }

    /// Takes a reference on `key`, opening `conn` only if no entry exists.
    pub async fn open(&self, key: &str, mut conn: ForwarderConn) -> bool {
        if self.add_ref(key) {
            return true;
        }

        if conn.open().await.is_err() {
            return false;
        }

        let raced = {
            #[allow(clippy::expect_used)]
            let mut conns = self.conns.lock().expect("lock poisoned");
            match conns.get_mut(key) {
                Some(entry) => {
                    entry.refs += 1;
                    true
                }
                None => {
                    conns.insert(
                        key.to_string(),
                        PoolEntry {
                            conn: Arc::new(TokioMutex::new(conn)),
                            refs: 1,
                        },
                    );
                    return true;
                }
            }
        };
        if raced {
            conn.close().await;
        }
        true
    }

    fn add_ref(&self, key: &str) -> bool {
        #[allow(clippy::expect_used)]
        let mut conns = self.conns.lock().expect("lock poisoned");
        match conns.get_mut(key) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Drops a reference on `key`, closing the connection at zero.
    pub async fn close(&self, key: &str) {
        let released = {
            #[allow(clippy::expect_used)]
            let mut conns = self.conns.lock().expect("lock poisoned");
            let Some(entry) = conns.get_mut(key) else {
                error!(
                    "LOGIC ERROR: attempting to close connection <{}> that the pool has no entry for",
                    key
                );
                return;
            };
            entry.refs -= 1;
            if entry.refs == 0 {
                conns.remove(key).map(|entry| entry.conn)
            } else {
                None
            }
        };

        if let Some(conn) = released {
            conn.lock().await.close().await;
        }
    }

    pub async fn send(&self, key: &str, entries: &[LogEntry]) -> bool {
        let conn = {
            #[allow(clippy::expect_used)]
            let conns = self.conns.lock().expect("lock poisoned");
            match conns.get(key) {
                Some(entry) => Arc::clone(&entry.conn),
                None => {
                    error!("Send failed. No connection pool entry for <{}>", key);
                    return false;
                }
            }
        };
        let mut conn = conn.lock().await;
        conn.send(entries).await
    }

    /// Current reference count for `key`, if it has an entry.
    pub fn ref_count(&self, key: &str) -> Option<usize> {
        #[allow(clippy::expect_used)]
        let conns = self.conns.lock().expect("lock poisoned");
        conns.get(key).map(|entry| entry.refs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, ServerAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, ServerAddr::new("127.0.0.1", addr.port()))
    }

    fn conn(addr: &ServerAddr) -> ForwarderConn {
        ForwarderConn::to_host(
            addr.clone(),
            Duration::from_millis(500),
            Arc::new(Counters::new()),
        )
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_entry() {
        let (listener, addr) = listener().await;
        drop(listener);
        let pool = ConnPool::new();
        let key = ConnPool::make_key(&addr.host, addr.port);
        assert!(!pool.open(&key, conn(&addr)).await);
        assert_eq!(pool.ref_count(&key), None);
        assert!(!pool.send(&key, &[LogEntry::new("a", "x")]).await);
    }

    #[tokio::test]
    async fn test_second_open_reuses_entry() {
        let (listener, addr) = listener().await;
        let pool = ConnPool::new();
        let key = ConnPool::make_key(&addr.host, addr.port);

        assert!(pool.open(&key, conn(&addr)).await);
        let _first = listener.accept().await.unwrap();
        assert!(pool.open(&key, conn(&addr)).await);
        assert_eq!(pool.ref_count(&key), Some(2));

        pool.close(&key).await;
        assert_eq!(pool.ref_count(&key), Some(1));
        pool.close(&key).await;
        assert_eq!(pool.ref_count(&key), None);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_extra_close_does_not_touch_other_keys() {
        let (listener_a, addr_a) = listener().await;
        let (_listener_b, addr_b) = listener().await;
        let pool = ConnPool::new();
        let key_a = ConnPool::make_key(&addr_a.host, addr_a.port);
        let key_b = ConnPool::make_key(&addr_b.host, addr_b.port);

        assert!(pool.open(&key_a, conn(&addr_a)).await);
        assert!(pool.open(&key_b, conn(&addr_b)).await);
        drop(listener_a);

        pool.close(&key_a).await;
        pool.close(&key_a).await;
        assert!(logs_contain("LOGIC ERROR"));
        assert_eq!(pool.ref_count(&key_b), Some(1));
    }

    #[tokio::test]
    async fn test_service_without_servers_fails() {
        let mut conn = ForwarderConn::to_service(
            "nowhere",
            Vec::new(),
            Duration::from_millis(100),
            Arc::new(Counters::new()),
        );
        assert!(matches!(conn.open().await, Err(ConnError::NoServers(_))));
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_unknown_result_code_is_not_retried() {
        let (listener, addr) = listener().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let server_calls = Arc::clone(&calls);
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = wire::framed(stream);
            while let Some(Ok(frame)) = transport.next().await {
                let header = wire::decode_header(&frame).unwrap();
                server_calls.fetch_add(1, Ordering::SeqCst);
                // Log reply with result code 9
                let mut reply = BytesMut::new();
                reply.put_u32(0x8001_0002);
                reply.put_i32(3);
                reply.put_slice(b"Log");
                reply.put_i32(header.seqid);
                reply.put_u8(8);
                reply.put_i16(0);
                reply.put_i32(9);
                reply.put_u8(0);
                transport.send(reply.freeze()).await.unwrap();
            }
        });

        let counters = Arc::new(Counters::new());
        let mut conn = ForwarderConn::to_host(addr, Duration::from_millis(500), Arc::clone(&counters));
        conn.open().await.unwrap();
        assert!(!conn.send(&[LogEntry::new("a", "x")]).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(conn.is_open());
        assert_eq!(counters.get(Counter::Sent), 0);

        conn.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_on_closed_connection_reports_failure() {
        let (listener, addr) = listener().await;
        drop(listener);
        let mut conn = conn(&addr);
        assert!(conn.send(&[]).await);
        assert!(!conn.send(&[LogEntry::new("a", "x")]).await);
    }
}
