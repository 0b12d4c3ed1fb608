// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Inbound listener for `Log` calls.
//!
//! Each connection carries length-framed calls. A `Log` call is handed to the
//! [`Router`] and answered with its result code; any other method gets an
//! unknown-method exception.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use logrelay::counters::Counter;
use logrelay::router::Router;
use logrelay::wire::{self, MessageType, WireError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct LogServerConfig {
    /// Host to bind the listener to (e.g., "0.0.0.0")
    pub host: String,
    pub port: u16,
}

pub struct LogServer {
    listener: TcpListener,
    router: Arc<Router>,
    cancel_token: CancellationToken,
}

impl LogServer {
    pub async fn bind(
        config: &LogServerConfig,
        router: Arc<Router>,
        cancel_token: CancellationToken,
    ) -> io::Result<LogServer> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        Ok(LogServer {
            listener,
            router,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the token is cancelled.
    pub async fn spin(self) {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!("Log server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        tokio::spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.router),
                            self.cancel_token.clone(),
                        ));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    cancel_token: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }
    let mut transport = wire::framed(stream);
    loop {
        let frame = tokio::select! {
            () = cancel_token.cancelled() => break,
            frame = transport.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("Dropping connection from {}: {}", peer, e);
                break;
            }
            None => break,
        };

        if let Some(reply) = respond(&router, &frame) {
            if let Err(e) = transport.send(reply).await {
                warn!("Failed to reply to {}: {}", peer, e);
                break;
            }
        }
    }
    debug!("Connection from {} closed", peer);
}

/// Reply for one inbound frame; one-way calls get none.
fn respond(router: &Router, frame: &[u8]) -> Option<Bytes> {
    match wire::decode_log_call(frame) {
        Ok((header, entries)) => {
            let code = router.log(entries);
            (header.message_type != MessageType::Oneway)
                .then(|| wire::encode_log_reply(header.seqid, code))
        }
        Err(WireError::UnknownMethod(name)) => {
            info!("Rejecting call to unknown method <{}>", name);
            let seqid = wire::decode_header(frame).map_or(0, |header| header.seqid);
            Some(wire::encode_exception(
                seqid,
                &name,
                wire::EXCEPTION_UNKNOWN_METHOD,
                &format!("Invalid method name: '{name}'"),
            ))
        }
        Err(e) => {
            warn!("Failed to decode inbound call: {}", e);
            router.counters().increment(Counter::InvalidRequests);
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use logrelay::conf::StoreConf;
    use logrelay::store::StoreContext;
    use logrelay::{LogEntry, ResultCode};

    async fn start_server() -> (SocketAddr, Arc<Router>, CancellationToken) {
        let router = Arc::new(Router::new(StoreContext::default()));
        let conf = StoreConf::new().with_store(
            "store0",
            StoreConf::new().with("category", "a").with("type", "null"),
        );
        assert!(router.configure(&conf).await);

        let cancel_token = CancellationToken::new();
        let config = LogServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };
        let server = LogServer::bind(&config, Arc::clone(&router), cancel_token.clone())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.spin());
        (addr, router, cancel_token)
    }

    #[tokio::test]
    async fn test_log_call_is_routed() {
        let (addr, router, cancel_token) = start_server().await;
        let mut transport = wire::framed(TcpStream::connect(addr).await.unwrap());

        let call = wire::encode_log_call(5, &[LogEntry::new("a", "x"), LogEntry::new("b", "y")]);
        transport.send(call).await.unwrap();
        let reply = transport.next().await.unwrap().unwrap();

        assert_eq!(wire::decode_log_reply(&reply).unwrap(), (5, ResultCode::Ok));
        assert_eq!(router.counters().get(Counter::ReceivedGood), 1);
        assert_eq!(router.counters().get(Counter::ReceivedBad), 1);

        cancel_token.cancel();
        router.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_method_gets_exception() {
        let (addr, router, cancel_token) = start_server().await;
        let mut transport = wire::framed(TcpStream::connect(addr).await.unwrap());

        // strict header for call "getStatus", seqid 9, empty args
        let mut call = vec![0x80, 0x01, 0x00, 0x01, 0, 0, 0, 9];
        call.extend_from_slice(b"getStatus");
        call.extend_from_slice(&[0, 0, 0, 9, 0]);
        transport.send(Bytes::from(call)).await.unwrap();
        let reply = transport.next().await.unwrap().unwrap();

        assert_eq!(
            wire::decode_log_reply(&reply).unwrap_err(),
            WireError::Remote {
                kind: wire::EXCEPTION_UNKNOWN_METHOD,
                message: "Invalid method name: 'getStatus'".to_string(),
            }
        );

        cancel_token.cancel();
        router.shutdown().await;
    }
}
