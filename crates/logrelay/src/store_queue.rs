// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One worker task per store.
//!
//! A [`StoreQueue`] is the handle the router holds; the worker task behind it
//! owns the [`Store`] and is driven by two inputs:
//!
//! ```text
//!   add_message ──► pending (std Mutex) ──┐ wake once pending >= target_write_size
//!                                          ▼
//!   configure/open/stop ──► mpsc ──► QueueWorker ──► Store
//!                                          ▲
//!                   check_period / max_write_interval deadlines
//! ```
//!
//! Commands are drained before each batch, so a `Stop` is never stuck behind
//! a message backlog. Model queues are prototypes: they hold a configured
//! store that is only ever copied, and never run a worker.

use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::conf::StoreConf;
use crate::counters::{Counter, Counters};
use crate::entry::LogEntry;
use crate::store::{create_store, Store, StoreContext, StoreError, StoreType};

pub const DEFAULT_TARGET_WRITE_SIZE: u64 = 16_384;
pub const DEFAULT_MAX_WRITE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreQueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("queue for category <{0}> is not a model")]
    NotAModel(String),
}

#[derive(Debug)]
pub enum QueueCommand {
    Configure(Arc<StoreConf>),
    Open,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    pub target_write_size: u64,
    pub max_write_interval: Duration,
    pub check_period: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            target_write_size: DEFAULT_TARGET_WRITE_SIZE,
            max_write_interval: DEFAULT_MAX_WRITE_INTERVAL,
            check_period: DEFAULT_CHECK_PERIOD,
        }
    }
}

impl QueueSettings {
    fn apply(&mut self, conf: &StoreConf) {
        if let Some(size) = conf.get_unsigned("target_write_size") {
            self.target_write_size = size;
        }
        if let Some(secs) = conf.get_unsigned("max_write_interval") {
            self.max_write_interval = Duration::from_secs(secs);
        }
    }
}

#[derive(Default)]
struct Pending {
    messages: Vec<LogEntry>,
    size: u64,
}

struct Shared {
    pending: Mutex<Pending>,
    wakeup: Notify,
    settings: Mutex<QueueSettings>,
    status: Mutex<String>,
}

impl Shared {
    fn settings(&self) -> QueueSettings {
        #[allow(clippy::expect_used)]
        let settings = self.settings.lock().expect("lock poisoned");
        *settings
    }

    fn set_status(&self, status: String) {
        #[allow(clippy::expect_used)]
        let mut current = self.status.lock().expect("lock poisoned");
        *current = status;
    }
}

enum Role {
    Model(Mutex<Box<dyn Store>>),
    Worker {
        tx: mpsc::UnboundedSender<QueueCommand>,
        handle: Mutex<Option<JoinHandle<()>>>,
    },
}

pub struct StoreQueue {
    category: String,
    store_type: StoreType,
    multi_category: bool,
    shared: Arc<Shared>,
    role: Role,
}

impl StoreQueue {
    /// Creates an unconfigured queue around a new store of `store_type`.
    ///
    /// Non-model queues spawn their worker immediately, so this must run
    /// inside a tokio runtime.
    pub fn new(
        store_type: &str,
        category: &str,
        check_period: Duration,
        is_model: bool,
        multi_category: bool,
        ctx: &StoreContext,
    ) -> Result<Self, StoreQueueError> {
        let store = create_store(store_type, category, false, multi_category, ctx)?;
        let settings = QueueSettings {
            check_period,
            ..QueueSettings::default()
        };
        Ok(Self::with_store(
            store,
            settings,
            is_model,
            Arc::clone(&ctx.counters),
        ))
    }

    /// Starts a live queue for `category` from a copy of `model`'s store.
    pub fn from_model(
        model: &StoreQueue,
        category: &str,
        counters: Arc<Counters>,
    ) -> Result<Self, StoreQueueError> {
        let store = model.copy_store(category)?;
        Ok(Self::with_store(store, model.shared.settings(), false, counters))
    }

    pub(crate) fn with_store(
        store: Box<dyn Store>,
        settings: QueueSettings,
        is_model: bool,
        counters: Arc<Counters>,
    ) -> Self {
        let category = store.category().to_string();
        let store_type = store.store_type();
        let multi_category = store.multi_category();
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending::default()),
            wakeup: Notify::new(),
            settings: Mutex::new(settings),
            status: Mutex::new(String::new()),
        });

        let role = if is_model {
            Role::Model(Mutex::new(store))
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = QueueWorker {
                category: category.clone(),
                store,
                rx,
                shared: Arc::clone(&shared),
                settings,
                counters,
                opened: false,
                last_check: Instant::now(),
                last_flush: Instant::now(),
            };
            Role::Worker {
                tx,
                handle: Mutex::new(Some(tokio::spawn(worker.run()))),
            }
        };

        StoreQueue {
            category,
            store_type,
            multi_category,
            shared,
            role,
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    pub fn is_model(&self) -> bool {
        matches!(self.role, Role::Model(_))
    }

    pub fn multi_category(&self) -> bool {
        self.multi_category
    }

    pub fn settings(&self) -> QueueSettings {
        self.shared.settings()
    }

    /// Bytes of message payload waiting for the next batch.
    pub fn size(&self) -> u64 {
        #[allow(clippy::expect_used)]
        let pending = self.shared.pending.lock().expect("lock poisoned");
        pending.size
    }

    /// Last status reported by the store; empty when healthy.
    pub fn status(&self) -> String {
        match &self.role {
            Role::Model(store) => {
                #[allow(clippy::expect_used)]
                let store = store.lock().expect("lock poisoned");
                store.status()
            }
            Role::Worker { .. } => {
                #[allow(clippy::expect_used)]
                let status = self.shared.status.lock().expect("lock poisoned");
                status.clone()
            }
        }
    }

    pub fn add_message(&self, entry: LogEntry) {
        if self.is_model() {
            error!(
                "[{}] LOGIC ERROR: attempting to add message to model store queue",
                self.category
            );
            return;
        }

        let target = self.shared.settings().target_write_size;
        let size = {
            #[allow(clippy::expect_used)]
            let mut pending = self.shared.pending.lock().expect("lock poisoned");
            pending.size += entry.message.len() as u64;
            pending.messages.push(entry);
            pending.size
        };
        if size >= target {
            self.shared.wakeup.notify_one();
        }
    }

    /// Configures the store and (re)opens it. Model queues configure inline
    /// and stay closed.
    pub fn configure_and_open(&self, conf: Arc<StoreConf>) {
        match &self.role {
            Role::Model(store) => {
                {
                    #[allow(clippy::expect_used)]
                    let mut settings = self.shared.settings.lock().expect("lock poisoned");
                    settings.apply(&conf);
                }
                #[allow(clippy::expect_used)]
                let mut store = store.lock().expect("lock poisoned");
                store.configure(&conf);
            }
            Role::Worker { .. } => self.send(QueueCommand::Configure(conf)),
        }
    }

    pub fn open(&self) {
        if !self.is_model() {
            self.send(QueueCommand::Open);
        }
    }

    /// Flushes pending messages, closes the store and waits for the worker
    /// to exit.
    pub async fn stop(&self) {
        let Role::Worker { handle, .. } = &self.role else {
            return;
        };
        self.send(QueueCommand::Stop);

        let handle = {
            #[allow(clippy::expect_used)]
            let mut handle = handle.lock().expect("lock poisoned");
            handle.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("[{}] store queue worker failed: {}", self.category, e);
            }
        }
    }

    /// A configured copy of a model queue's store, bound to `category`.
    pub fn copy_store(&self, category: &str) -> Result<Box<dyn Store>, StoreQueueError> {
        match &self.role {
            Role::Model(store) => {
                #[allow(clippy::expect_used)]
                let store = store.lock().expect("lock poisoned");
                Ok(store.copy(category))
            }
            Role::Worker { .. } => Err(StoreQueueError::NotAModel(self.category.clone())),
        }
    }

    fn send(&self, command: QueueCommand) {
        if let Role::Worker { tx, .. } = &self.role {
            if let Err(e) = tx.send(command) {
                warn!(
                    "[{}] store queue worker is gone, dropping command {:?}",
                    self.category, e.0
                );
            }
        }
    }
}

struct QueueWorker {
    category: String,
    store: Box<dyn Store>,
    rx: mpsc::UnboundedReceiver<QueueCommand>,
    shared: Arc<Shared>,
    settings: QueueSettings,
    counters: Arc<Counters>,
    /// Set once an open was requested, whether or not the store came up.
    opened: bool,
    last_check: Instant,
    last_flush: Instant,
}

impl QueueWorker {
    async fn run(mut self) {
        debug!("[{}] store queue worker started", self.category);
        let mut received = None;

        loop {
            let mut stop = false;
            let mut next = received.take();
            loop {
                match next {
                    Some(QueueCommand::Configure(conf)) => self.configure(&conf).await,
                    Some(QueueCommand::Open) => self.open().await,
                    Some(QueueCommand::Stop) => stop = true,
                    None => {}
                }
                match self.rx.try_recv() {
                    Ok(command) => next = Some(command),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        stop = true;
                        break;
                    }
                }
            }

            if self.last_check.elapsed() >= self.settings.check_period {
                if self.opened {
                    self.store.periodic_check().await;
                }
                self.last_check = Instant::now();
            }

            let pending_size = {
                #[allow(clippy::expect_used)]
                let pending = self.shared.pending.lock().expect("lock poisoned");
                pending.size
            };
            if stop
                || pending_size >= self.settings.target_write_size
                || self.last_flush.elapsed() >= self.settings.max_write_interval
            {
                self.process_messages().await;
            }

            self.shared.set_status(self.store.status());

            if stop {
                self.store.close().await;
                break;
            }

            let deadline = (self.last_check + self.settings.check_period)
                .min(self.last_flush + self.settings.max_write_interval);
            tokio::select! {
                command = self.rx.recv() => {
                    received = Some(command.unwrap_or(QueueCommand::Stop));
                }
                () = self.shared.wakeup.notified() => {}
                () = sleep_until(deadline) => {}
            }
        }

        info!("[{}] store queue worker stopped", self.category);
    }

    async fn configure(&mut self, conf: &StoreConf) {
        self.settings.apply(conf);
        {
            #[allow(clippy::expect_used)]
            let mut settings = self.shared.settings.lock().expect("lock poisoned");
            *settings = self.settings;
        }
        self.store.configure(conf);
        self.open().await;
    }

    async fn open(&mut self) {
        if self.store.is_open() {
            self.store.close().await;
        }
        self.opened = true;
        if !self.store.open().await {
            warn!(
                "[{}] Failed to open store of type <{}>",
                self.category,
                self.store.store_type()
            );
        }
    }

    async fn process_messages(&mut self) {
        let mut messages = {
            #[allow(clippy::expect_used)]
            let mut pending = self.shared.pending.lock().expect("lock poisoned");
            pending.size = 0;
            mem::take(&mut pending.messages)
        };

        if !messages.is_empty() && !self.store.handle_messages(&mut messages).await {
            let lost = messages.len();
            if lost > 0 {
                warn!("[{}] Lost {} messages", self.category, lost);
                self.counters.add(Counter::Lost, lost as u64);
            }
        }
        self.store.flush().await;
        self.last_flush = Instant::now();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::test_support::{MockState, MockStore};
    use tracing_test::traced_test;

    fn settings(target_write_size: u64) -> QueueSettings {
        QueueSettings {
            target_write_size,
            max_write_interval: Duration::from_secs(10),
            check_period: Duration::from_secs(5),
        }
    }

    fn live_queue(target_write_size: u64) -> (StoreQueue, Arc<Mutex<MockState>>, Arc<Counters>) {
        let (store, state) = MockStore::new("web");
        let counters = Arc::new(Counters::new());
        let queue = StoreQueue::with_store(
            Box::new(store),
            settings(target_write_size),
            false,
            Arc::clone(&counters),
        );
        queue.open();
        (queue, state, counters)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(condition(), "condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_after_max_write_interval() {
        let (queue, state, _) = live_queue(1_000);
        queue.add_message(LogEntry::new("web", "small"));
        assert_eq!(queue.size(), 5);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(state.lock().unwrap().received.is_empty());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(state.lock().unwrap().received.len(), 1);
        assert_eq!(queue.size(), 0);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_write_size_wakes_worker() {
        let (queue, state, _) = live_queue(8);
        queue.add_message(LogEntry::new("web", "0123456789"));
        wait_until(|| state.lock().unwrap().received.len() == 1).await;
        assert!(state.lock().unwrap().flushes >= 1);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_failed_batch_is_counted_lost() {
        let (queue, state, counters) = live_queue(1);
        state.lock().unwrap().accept = Some(1);
        queue.add_message(LogEntry::new("web", "a"));
        queue.add_message(LogEntry::new("web", "b"));
        queue.add_message(LogEntry::new("web", "c"));
        queue.stop().await;

        let accepted = state.lock().unwrap().received.len() as u64;
        assert_eq!(accepted + counters.get(Counter::Lost), 3);
        assert!(counters.get(Counter::Lost) >= 1);
        assert!(logs_contain("Lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_and_closes() {
        let (queue, state, _) = live_queue(1_000);
        queue.add_message(LogEntry::new("web", "pending"));
        queue.stop().await;

        let state = state.lock().unwrap();
        assert_eq!(state.received.len(), 1);
        assert_eq!(state.opens, 1);
        assert_eq!(state.closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_check_runs_on_period() {
        let (queue, state, _) = live_queue(1_000);
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(state.lock().unwrap().periodic_checks >= 2);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_that_fails_to_open_keeps_check_period() {
        let (store, state) = MockStore::new("web");
        state.lock().unwrap().fail_open = true;
        let counters = Arc::new(Counters::new());
        let queue = StoreQueue::with_store(
            Box::new(store),
            QueueSettings {
                target_write_size: 1_000,
                max_write_interval: Duration::from_secs(10),
                check_period: Duration::from_millis(50),
            },
            false,
            counters,
        );
        queue.open();

        tokio::time::sleep(Duration::from_millis(225)).await;
        let checks = state.lock().unwrap().periodic_checks;
        assert!((3..=5).contains(&checks), "{checks} periodic checks");
        assert_eq!(state.lock().unwrap().opens, 1);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_periodic_check_before_open() {
        let (store, state) = MockStore::new("web");
        let queue = StoreQueue::with_store(
            Box::new(store),
            QueueSettings {
                check_period: Duration::from_secs(1),
                ..settings(1_000)
            },
            false,
            Arc::new(Counters::new()),
        );

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(state.lock().unwrap().periodic_checks, 0);

        queue.open();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(state.lock().unwrap().periodic_checks >= 2);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_reopens_and_applies_settings() {
        let (queue, state, _) = live_queue(1_000);
        queue.configure_and_open(Arc::new(
            StoreConf::new()
                .with("target_write_size", "2")
                .with("max_write_interval", "3"),
        ));
        wait_until(|| queue.settings().target_write_size == 2).await;
        assert_eq!(queue.settings().max_write_interval, Duration::from_secs(3));

        let state_after = state.lock().unwrap();
        assert_eq!(state_after.opens, 2);
        assert_eq!(state_after.closes, 1);
        drop(state_after);
        queue.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_tracks_store() {
        let (queue, state, _) = live_queue(1);
        state.lock().unwrap().status = "degraded".to_string();
        queue.add_message(LogEntry::new("web", "x"));
        wait_until(|| queue.status() == "degraded").await;
        queue.stop().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_model_queue_only_copies() {
        let ctx = StoreContext::default();
        let model = StoreQueue::new("null", "default", DEFAULT_CHECK_PERIOD, true, false, &ctx).unwrap();
        assert!(model.is_model());
        model.configure_and_open(Arc::new(StoreConf::new().with("target_write_size", "42")));
        assert_eq!(model.settings().target_write_size, 42);

        model.add_message(LogEntry::new("default", "x"));
        assert_eq!(model.size(), 0);
        assert!(logs_contain("LOGIC ERROR"));

        let live = StoreQueue::from_model(&model, "api", Arc::clone(&ctx.counters)).unwrap();
        assert!(!live.is_model());
        assert_eq!(live.category(), "api");
        assert_eq!(live.settings().target_write_size, 42);
        assert!(matches!(
            live.copy_store("other"),
            Err(StoreQueueError::NotAModel(_))
        ));
        live.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_store_type() {
        let ctx = StoreContext::default();
        let err = StoreQueue::new("thriftfile", "web", DEFAULT_CHECK_PERIOD, false, false, &ctx)
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Unknown store type: thriftfile");
    }
}
