// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resolution of logical service names to forwarder endpoints.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::conf::StoreConf;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerAddr {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrParseError {
    #[error("missing port in <{0}>")]
    MissingPort(String),
    #[error("invalid port in <{0}>")]
    InvalidPort(String),
    #[error("empty host in <{0}>")]
    EmptyHost(String),
}

impl FromStr for ServerAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrParseError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddrParseError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| AddrParseError::InvalidPort(s.to_string()))?;
        Ok(ServerAddr::new(host, port))
    }
}

/// Looks up the current endpoints of a logical service.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// `None` when the service is unknown or has no members.
    async fn resolve(&self, service: &str) -> Option<Vec<ServerAddr>>;
}

/// Resolver backed by a fixed table, typically the `<services>` block:
///
/// ```text
/// <services>
///   central=10.0.0.1:1463,10.0.0.2:1463
/// </services>
/// ```
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    services: HashMap<String, Vec<ServerAddr>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: impl Into<String>, servers: Vec<ServerAddr>) {
        self.services.insert(service.into(), servers);
    }

    /// Builds the table from a conf block; unparsable endpoints are skipped.
    #[must_use]
    pub fn from_conf(conf: &StoreConf) -> Self {
        let mut resolver = StaticResolver::new();
        for (service, members) in conf.values() {
            let servers: Vec<ServerAddr> = members
                .split(',')
                .filter(|member| !member.trim().is_empty())
                .filter_map(|member| match member.parse() {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        warn!("Ignoring member of service <{}>: {}", service, e);
                        None
                    }
                })
                .collect();
            resolver.insert(service, servers);
        }
        resolver
    }
}

#[async_trait]
impl ServiceResolver for StaticResolver {
    async fn resolve(&self, service: &str) -> Option<Vec<ServerAddr>> {
        self.services
            .get(service)
            .filter(|servers| !servers.is_empty())
            .cloned()
    }
}
