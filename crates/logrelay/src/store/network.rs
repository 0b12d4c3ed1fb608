// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::conf::StoreConf;
use crate::conn_pool::{ConnPool, ForwarderConn};
use crate::entry::LogEntry;
use crate::membership::ServerAddr;
use crate::store::{Store, StoreBase, StoreContext, StoreType};

pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 5000;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Remote {
    Unset,
    Host(ServerAddr),
    Service(String),
}

/// Forwards batches to a downstream daemon, through the shared pool or a
/// private connection.
pub struct NetworkStore {
    base: StoreBase,
    ctx: StoreContext,
    remote: Remote,
    timeout: Duration,
    use_conn_pool: bool,
    opened: bool,
    pool_key: String,
    unpooled: Option<ForwarderConn>,
}

impl NetworkStore {
    #[must_use]
    pub fn new(category: &str, multi_category: bool, ctx: StoreContext) -> Self {
        NetworkStore {
            base: StoreBase::new(category, StoreType::Network, multi_category),
            ctx,
            remote: Remote::Unset,
            timeout: Duration::from_millis(DEFAULT_SOCKET_TIMEOUT_MS),
            use_conn_pool: false,
            opened: false,
            pool_key: String::new(),
            unpooled: None,
        }
    }

    async fn connection(&mut self) -> Option<(String, ForwarderConn)> {
        let counters = self.ctx.counters.clone();
        match &self.remote {
            Remote::Host(addr) => Some((
                ConnPool::make_key(&addr.host, addr.port),
                ForwarderConn::to_host(addr.clone(), self.timeout, counters),
            )),
            Remote::Service(name) => match self.ctx.resolver.resolve(name).await {
                Some(servers) => Some((
                    name.clone(),
                    ForwarderConn::to_service(name.clone(), servers, self.timeout, counters),
                )),
                None => {
                    error!(
                        "[{}] No members found for remote service <{}>",
                        self.base.category, name
                    );
                    None
                }
            },
            Remote::Unset => None,
        }
    }
}

#[async_trait]
impl Store for NetworkStore {
    fn category(&self) -> &str {
        &self.base.category
    }

    fn store_type(&self) -> StoreType {
        self.base.store_type
    }

    fn multi_category(&self) -> bool {
        self.base.multi_category
    }

    fn copy(&self, category: &str) -> Box<dyn Store> {
        Box::new(NetworkStore {
            base: self.base.copy_for(category),
            ctx: self.ctx.clone(),
            remote: self.remote.clone(),
            timeout: self.timeout,
            use_conn_pool: self.use_conn_pool,
            opened: false,
            pool_key: String::new(),
            unpooled: None,
        })
    }

    fn configure(&mut self, conf: &StoreConf) {
        if let Some(service) = conf.get_string("remote_service") {
            self.remote = Remote::Service(service.to_string());
        } else {
            let host = conf.get_string("remote_host");
            let port = conf
                .get_unsigned("remote_port")
                .and_then(|port| u16::try_from(port).ok())
                .filter(|port| *port != 0);
            match (host, port) {
                (Some(host), Some(port)) if !host.is_empty() => {
                    self.remote = Remote::Host(ServerAddr::new(host, port));
                }
                _ => {
                    error!(
                        "[{}] Bad config - invalid location for remote server",
                        self.base.category
                    );
                    self.remote = Remote::Unset;
                }
            }
        }

        if let Some(timeout) = conf.get_unsigned("timeout") {
            self.timeout = Duration::from_millis(timeout);
        }
        if let Some(use_conn_pool) = conf.get_flag("use_conn_pool") {
            self.use_conn_pool = use_conn_pool;
        }
        self.base.configured = true;
    }

    async fn open(&mut self) -> bool {
        if !self.base.check_configured() {
            return false;
        }
        if self.opened {
            self.close().await;
        }

        if self.remote == Remote::Unset {
            self.base
                .set_status("Bad config - invalid location for remote server");
            return false;
        }

        let Some((key, mut conn)) = self.connection().await else {
            self.base.set_status("Failed to connect");
            return false;
        };

        self.opened = if self.use_conn_pool {
            let opened = self.ctx.conn_pool.open(&key, conn).await;
            if opened {
                self.pool_key = key;
            }
            opened
        } else {
            match conn.open().await {
                Ok(()) => {
                    self.unpooled = Some(conn);
                    true
                }
                Err(e) => {
                    debug!("[{}] Unpooled connect failed: {}", self.base.category, e);
                    false
                }
            }
        };

        if self.opened {
            self.base.set_status("");
        } else {
            self.base.set_status("Failed to connect");
        }
        self.opened
    }

    fn is_open(&self) -> bool {
        self.opened
    }

    async fn close(&mut self) {
        if !self.opened {
            return;
        }
        self.opened = false;
        if self.use_conn_pool {
            let key = std::mem::take(&mut self.pool_key);
            self.ctx.conn_pool.close(&key).await;
        } else if let Some(mut conn) = self.unpooled.take() {
            conn.close().await;
        }
    }

    async fn handle_messages(&mut self, messages: &mut Vec<LogEntry>) -> bool {
        if !self.opened {
            error!(
                "[{}] Logic error: NetworkStore::handle_messages called on closed store",
                self.base.category
            );
            return false;
        }

        let sent = if self.use_conn_pool {
            self.ctx.conn_pool.send(&self.pool_key, messages).await
        } else {
            match self.unpooled.as_mut() {
                Some(conn) => conn.send(messages).await,
                None => false,
            }
        };

        if sent {
            messages.clear();
        } else {
            warn!(
                "[{}] Failed to forward <{}> messages",
                self.base.category,
                messages.len()
            );
        }
        sent
    }

    async fn flush(&mut self) {}

    fn status(&self) -> String {
        self.base.status.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::membership::StaticResolver;
    use crate::store::test_support::entries;
    use std::sync::Arc;

    fn ctx_with_service(name: &str, servers: Vec<ServerAddr>) -> StoreContext {
        let mut resolver = StaticResolver::new();
        resolver.insert(name, servers);
        StoreContext {
            resolver: Arc::new(resolver),
            ..StoreContext::default()
        }
    }

    #[tokio::test]
    async fn test_missing_location_is_bad_config() {
        let mut store = NetworkStore::new("web", false, StoreContext::default());
        store.configure(&StoreConf::new().with("remote_host", "localhost"));
        assert!(!store.open().await);
        assert_eq!(
            store.status(),
            "Bad config - invalid location for remote server"
        );
    }

    #[tokio::test]
    async fn test_connect_failure_sets_status() {
        // bind then drop so the port is closed
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut store = NetworkStore::new("web", false, StoreContext::default());
        store.configure(
            &StoreConf::new()
                .with("remote_host", "127.0.0.1")
                .with("remote_port", &port.to_string())
                .with("timeout", "500"),
        );
        assert!(!store.open().await);
        assert!(!store.is_open());
        assert_eq!(store.status(), "Failed to connect");

        let mut batch = entries("web", &["a"]);
        assert!(!store.handle_messages(&mut batch).await);
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_service_fails_open() {
        let ctx = ctx_with_service("central", vec![]);
        let mut store = NetworkStore::new("web", false, ctx);
        store.configure(&StoreConf::new().with("remote_service", "elsewhere"));
        assert!(!store.open().await);
        assert_eq!(store.status(), "Failed to connect");
    }

    #[tokio::test]
    async fn test_pooled_stores_share_one_entry() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let ctx = StoreContext::default();
        let conf = StoreConf::new()
            .with("remote_host", "127.0.0.1")
            .with("remote_port", &addr.port().to_string())
            .with("use_conn_pool", "yes");
        let key = ConnPool::make_key("127.0.0.1", addr.port());

        let mut first = NetworkStore::new("a", false, ctx.clone());
        first.configure(&conf);
        let mut second = first.copy("b");

        assert!(first.open().await);
        assert!(second.open().await);
        assert_eq!(ctx.conn_pool.ref_count(&key), Some(2));

        // reopening must not leak a reference
        assert!(first.open().await);
        assert_eq!(ctx.conn_pool.ref_count(&key), Some(2));

        first.close().await;
        assert_eq!(ctx.conn_pool.ref_count(&key), Some(1));
        second.close().await;
        assert_eq!(ctx.conn_pool.ref_count(&key), None);
    }
}
