// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Downstream forwarder that answers `Log` calls on a random local port

use futures::{SinkExt, StreamExt};
use logrelay::{wire, LogEntry, ResultCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct MockForwarder {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<LogEntry>>>,
    accepting: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
    hang_ups: Arc<AtomicUsize>,
}

impl MockForwarder {
    /// Start a forwarder that replies OK to every batch
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock forwarder");
        let addr = listener.local_addr().expect("Failed to get local addr");

        let forwarder = MockForwarder {
            addr,
            received: Arc::new(Mutex::new(Vec::new())),
            accepting: Arc::new(AtomicBool::new(true)),
            connections: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
            hang_ups: Arc::new(AtomicUsize::new(0)),
        };

        let server = forwarder.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                server.connections.fetch_add(1, Ordering::SeqCst);

                let server = server.clone();
                tokio::spawn(async move {
                    let mut transport = wire::framed(stream);
                    while let Some(Ok(frame)) = transport.next().await {
                        server.calls.fetch_add(1, Ordering::SeqCst);
                        if server.take_hang_up() {
                            break;
                        }
                        let Ok((header, entries)) = wire::decode_log_call(&frame) else {
                            break;
                        };
                        let code = if server.accepting.load(Ordering::SeqCst) {
                            server.received.lock().unwrap().extend(entries);
                            ResultCode::Ok
                        } else {
                            ResultCode::TryLater
                        };
                        let reply = wire::encode_log_reply(header.seqid, code);
                        if transport.send(reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        forwarder
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// While false, every batch is answered with TRY_LATER and dropped
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// The next `calls` calls are dropped along with their connection,
    /// without a reply
    pub fn hang_up_on(&self, calls: usize) {
        self.hang_ups.store(calls, Ordering::SeqCst);
    }

    fn take_hang_up(&self) -> bool {
        self.hang_ups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    pub fn received(&self) -> Vec<LogEntry> {
        self.received.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Calls received, answered or not
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}
