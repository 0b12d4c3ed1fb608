// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod server;

use anyhow::{bail, Context};
use std::{env, sync::Arc};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use logrelay::{
    conf::StoreConf,
    conn_pool::ConnPool,
    counters::Counters,
    membership::StaticResolver,
    router::Router,
    store::StoreContext,
};

use crate::server::{LogServer, LogServerConfig};

const DEFAULT_PORT: u16 = 1463;
const DEFAULT_COUNTERS_INTERVAL: u64 = 60;
const LISTEN_HOST: &str = "0.0.0.0";

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let log_level = env::var("LOGRELAY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).context("could not parse LOGRELAY_LOG_LEVEL")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");

    let config_path = env::var("LOGRELAY_CONFIG")
        .ok()
        .or_else(|| env::args().nth(1))
        .context("no config file given, set LOGRELAY_CONFIG or pass a path")?;
    let conf = StoreConf::from_file(&config_path)
        .with_context(|| format!("failed to load config file {config_path}"))?;

    let port = env::var("LOGRELAY_PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .or_else(|| {
            conf.get_unsigned("port")
                .and_then(|port| u16::try_from(port).ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let counters_interval = env::var("LOGRELAY_COUNTERS_INTERVAL")
        .ok()
        .and_then(|secs| secs.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_COUNTERS_INTERVAL);

    let resolver = conf
        .get_store("services")
        .map(|services| StaticResolver::from_conf(&services))
        .unwrap_or_default();
    let ctx = StoreContext::new(
        Arc::new(ConnPool::new()),
        Arc::new(resolver),
        Arc::new(Counters::new()),
    );

    let router = Arc::new(Router::new(ctx));
    if !router.configure(&conf).await {
        bail!("unable to configure stores: {}", router.status_details());
    }
    info!("Router is {}", router.status());

    let cancel_token = CancellationToken::new();
    let server = LogServer::bind(
        &LogServerConfig {
            host: LISTEN_HOST.to_string(),
            port,
        },
        Arc::clone(&router),
        cancel_token.clone(),
    )
    .await
    .with_context(|| format!("failed to listen on port {port}"))?;
    info!("logrelay: starting to listen on {}", server.local_addr()?);
    let server_task = tokio::spawn(server.spin());

    let mut report_interval = interval(Duration::from_secs(counters_interval));
    report_interval.tick().await; // discard first tick, which is instantaneous

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {e}");
                }
                break;
            }
            _ = report_interval.tick() => {
                match serde_json::to_string(&router.counters().snapshot()) {
                    Ok(report) => info!("counters: {report}"),
                    Err(e) => error!("Failed to serialize counters: {e}"),
                }
            }
        }
    }

    info!("Shutting down");
    cancel_token.cancel();
    if let Err(e) = server_task.await {
        error!("Log server task failed: {e}");
    }
    router.shutdown().await;
    info!("Router is {}", router.status());
    Ok(())
}
