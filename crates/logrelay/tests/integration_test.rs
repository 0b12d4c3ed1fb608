// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests driving the router and stores against real files and a
//! mock downstream forwarder

mod common;

use common::helpers::{entries, path_str, read_framed_records, router_conf, wait_for};
use common::mock_forwarder::MockForwarder;
use logrelay::conf::StoreConf;
use logrelay::conn_pool::{ConnPool, ForwarderConn};
use logrelay::counters::{Counter, Counters};
use logrelay::membership::{ServerAddr, StaticResolver};
use logrelay::router::{HealthStatus, Router};
use logrelay::store::{create_store, BufferState, BufferStore, Store, StoreContext};
use logrelay::{LogEntry, ResultCode};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_log_to_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let conf = router_conf(vec![StoreConf::new()
        .with("category", "a")
        .with("type", "file")
        .with("file_path", &path_str(dir.path()))]);

    let router = Router::new(StoreContext::default());
    assert!(router.configure(&conf).await);
    assert_eq!(router.status(), HealthStatus::Alive);

    assert_eq!(router.log(vec![LogEntry::new("a", "x")]), ResultCode::Ok);
    router.shutdown().await;

    assert_eq!(
        read_framed_records(dir.path().join("a_00000")),
        vec![b"x".to_vec()]
    );
    assert!(dir.path().join("a_current").exists());
    assert_eq!(router.counters().get(Counter::ReceivedGood), 1);
}

#[tokio::test]
async fn test_key_modulo_bucket_files() {
    let dir = tempfile::tempdir().unwrap();
    let conf = router_conf(vec![StoreConf::new()
        .with("category", "a")
        .with("type", "bucket")
        .with("num_buckets", "4")
        .with("bucket_type", "key_modulo")
        .with("delimiter", "58")
        .with("bucket_subdir", "bucket")
        .with_store(
            "bucket",
            StoreConf::new()
                .with("type", "file")
                .with("file_path", &path_str(dir.path())),
        )]);

    let router = Router::new(StoreContext::default());
    assert!(router.configure(&conf).await);
    router.log(vec![LogEntry::new("a", "7:payload")]);
    router.shutdown().await;

    assert_eq!(
        read_framed_records(dir.path().join("bucket004/a_00000")),
        vec![b"7:payload".to_vec()]
    );
    for empty in ["bucket000", "bucket001", "bucket002", "bucket003"] {
        assert!(read_framed_records(dir.path().join(empty).join("a_00000")).is_empty());
    }
}

#[tokio::test]
async fn test_buffer_failover_to_network_primary() {
    let forwarder = MockForwarder::start().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = StoreContext::default();

    let mut store = BufferStore::new("web", false, ctx.clone());
    store.configure(
        &StoreConf::new()
            .with("retry_interval", "0")
            .with("retry_interval_range", "0")
            .with_store(
                "primary",
                StoreConf::new()
                    .with("type", "network")
                    .with("remote_host", "127.0.0.1")
                    .with("remote_port", &forwarder.port().to_string()),
            )
            .with_store(
                "secondary",
                StoreConf::new()
                    .with("type", "file")
                    .with("file_path", &path_str(dir.path())),
            ),
    );

    assert!(store.open().await);
    store.periodic_check().await;
    assert_eq!(store.state(), BufferState::Streaming);

    forwarder.set_accepting(false);
    let mut batch = entries("web", &["1", "2", "3"]);
    assert!(store.handle_messages(&mut batch).await);
    assert_eq!(store.state(), BufferState::Disconnected);
    assert!(forwarder.received().is_empty());

    forwarder.set_accepting(true);
    store.periodic_check().await;
    assert_eq!(store.state(), BufferState::Streaming);
    assert_eq!(forwarder.received(), entries("web", &["1", "2", "3"]));
    assert_eq!(ctx.counters.get(Counter::Sent), 3);

    store.close().await;
}

#[tokio::test]
async fn test_category_store_creates_children() {
    let dir = tempfile::tempdir().unwrap();
    let mut conf = router_conf(vec![StoreConf::new()
        .with("category", "default")
        .with("type", "category")
        .with_store(
            "model",
            StoreConf::new()
                .with("type", "file")
                .with("file_path", &path_str(dir.path())),
        )]);
    conf.set_string("new_thread_per_category", "no");

    let router = Router::new(StoreContext::default());
    assert!(router.configure(&conf).await);
    router.log(vec![
        LogEntry::new("x", "1"),
        LogEntry::new("y", "2"),
        LogEntry::new("x", "3"),
    ]);
    router.shutdown().await;

    assert_eq!(
        read_framed_records(dir.path().join("x/x_00000")),
        vec![b"1".to_vec(), b"3".to_vec()]
    );
    assert_eq!(
        read_framed_records(dir.path().join("y/y_00000")),
        vec![b"2".to_vec()]
    );
}

#[tokio::test]
async fn test_router_forwards_to_resolved_service() {
    let forwarder = MockForwarder::start().await;
    let mut resolver = StaticResolver::new();
    resolver.insert("relay", vec![ServerAddr::new("127.0.0.1", forwarder.port())]);
    let ctx = StoreContext::new(
        Arc::new(ConnPool::new()),
        Arc::new(resolver),
        Arc::new(Counters::new()),
    );

    let conf = router_conf(vec![StoreConf::new()
        .with("category", "web*")
        .with("type", "network")
        .with("remote_service", "relay")
        .with("use_conn_pool", "yes")]);
    let router = Router::new(ctx.clone());
    assert!(router.configure(&conf).await);

    router.log(entries("web.front", &["a", "b"]));
    router.log(entries("web.back", &["c"]));
    router.shutdown().await;

    let mut received: Vec<String> = forwarder
        .received()
        .into_iter()
        .map(|entry| format!("{}:{}", entry.category, String::from_utf8_lossy(&entry.message)))
        .collect();
    received.sort();
    assert_eq!(received, vec!["web.back:c", "web.front:a", "web.front:b"]);
    // one pooled connection per service, shared by both categories
    assert_eq!(forwarder.connections(), 1);
    assert_eq!(ctx.conn_pool.ref_count("relay"), None);
}

#[tokio::test]
async fn test_conn_pool_ref_counting() {
    let forwarder = MockForwarder::start().await;
    let other = MockForwarder::start().await;
    let pool = ConnPool::new();
    let counters = Arc::new(Counters::new());
    let conn = |forwarder: &MockForwarder| {
        ForwarderConn::to_host(
            ServerAddr::new("127.0.0.1", forwarder.port()),
            Duration::from_secs(2),
            Arc::clone(&counters),
        )
    };
    let key = ConnPool::make_key("127.0.0.1", forwarder.port());
    let other_key = ConnPool::make_key("127.0.0.1", other.port());

    assert!(pool.open(&key, conn(&forwarder)).await);
    assert!(pool.open(&key, conn(&forwarder)).await);
    assert!(pool.open(&other_key, conn(&other)).await);
    assert_eq!(pool.ref_count(&key), Some(2));
    assert!(wait_for(|| forwarder.connections() == 1).await);

    pool.close(&key).await;
    assert_eq!(pool.ref_count(&key), Some(1));
    assert!(pool.send(&key, &entries("a", &["x"])).await);

    pool.close(&key).await;
    assert_eq!(pool.ref_count(&key), None);
    assert!(!pool.send(&key, &entries("a", &["y"])).await);

    // extra closes leave other keys alone
    pool.close(&key).await;
    assert_eq!(pool.ref_count(&other_key), Some(1));
    assert!(pool.send(&other_key, &entries("b", &["z"])).await);

    assert_eq!(forwarder.received(), entries("a", &["x"]));
    assert_eq!(other.received(), entries("b", &["z"]));
    assert_eq!(counters.get(Counter::Sent), 2);
}

fn forwarder_conn(forwarder: &MockForwarder, counters: &Arc<Counters>) -> ForwarderConn {
    ForwarderConn::to_host(
        ServerAddr::new("127.0.0.1", forwarder.port()),
        Duration::from_secs(2),
        Arc::clone(counters),
    )
}

#[tokio::test]
async fn test_send_reconnects_once_after_stale_connection() {
    let forwarder = MockForwarder::start().await;
    let counters = Arc::new(Counters::new());
    let mut conn = forwarder_conn(&forwarder, &counters);
    conn.open().await.unwrap();

    forwarder.hang_up_on(1);
    assert!(conn.send(&entries("a", &["x", "y"])).await);

    assert_eq!(forwarder.connections(), 2);
    assert_eq!(forwarder.calls(), 2);
    assert_eq!(forwarder.received(), entries("a", &["x", "y"]));
    assert_eq!(counters.get(Counter::Sent), 2);
    conn.close().await;
}

#[tokio::test]
async fn test_try_later_is_not_resent() {
    let forwarder = MockForwarder::start().await;
    let counters = Arc::new(Counters::new());
    let mut conn = forwarder_conn(&forwarder, &counters);
    conn.open().await.unwrap();

    forwarder.set_accepting(false);
    assert!(!conn.send(&entries("a", &["x"])).await);

    assert_eq!(forwarder.calls(), 1);
    assert_eq!(forwarder.connections(), 1);
    assert!(conn.is_open());
    assert!(forwarder.received().is_empty());
    assert_eq!(counters.get(Counter::Sent), 0);
    conn.close().await;
}

#[tokio::test]
async fn test_send_gives_up_after_second_transport_failure() {
    let forwarder = MockForwarder::start().await;
    let counters = Arc::new(Counters::new());
    let mut conn = forwarder_conn(&forwarder, &counters);
    conn.open().await.unwrap();

    forwarder.hang_up_on(2);
    assert!(!conn.send(&entries("a", &["x"])).await);

    // one reconnect between the two attempts, none after the last
    assert_eq!(forwarder.calls(), 2);
    assert_eq!(forwarder.connections(), 2);
    assert!(!conn.is_open());
    assert!(forwarder.received().is_empty());

    // the next send connects afresh
    assert!(conn.send(&entries("a", &["z"])).await);
    assert!(wait_for(|| forwarder.connections() == 3).await);
    assert_eq!(forwarder.received(), entries("a", &["z"]));
    conn.close().await;
}

fn category_strategy() -> impl Strategy<Value = Vec<(usize, u8)>> {
    prop::collection::vec((0usize..3, any::<u8>()), 0..40)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_failed_batch_keeps_unhandled_in_order(picks in category_strategy()) {
        const CATEGORIES: [&str; 3] = ["good", "also_good", "bad"];
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            // a plain file where the child's directory would go
            std::fs::write(dir.path().join("bad"), b"").unwrap();

            let mut store = create_store("category", "all", false, true, &StoreContext::default())
                .unwrap();
            store.configure(&StoreConf::new().with_store(
                "model",
                StoreConf::new()
                    .with("type", "file")
                    .with("file_path", &path_str(dir.path())),
            ));
            assert!(store.open().await);

            let original: Vec<LogEntry> = picks
                .iter()
                .enumerate()
                .map(|(i, (category, byte))| {
                    LogEntry::new(CATEGORIES[*category], format!("{i}-{byte}"))
                })
                .collect();
            let expected: Vec<LogEntry> = original
                .iter()
                .filter(|entry| entry.category == "bad")
                .cloned()
                .collect();

            let mut batch = original.clone();
            let handled = store.handle_messages(&mut batch).await;
            store.close().await;

            if expected.is_empty() {
                assert!(handled);
            } else {
                assert!(!handled);
                assert_eq!(batch, expected);
            }
        });
    }
}
