// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Primary/secondary failover store.
//!
//! ```text
//!              primary fails                   retry interval elapsed,
//!   STREAMING ──────────────► DISCONNECTED ─── primary opens ──► SENDING_BUFFER
//!       ▲                          ▲                                  │
//!       │                          └────── primary rejects a batch ───┤
//!       └──────────────────── secondary drained ──────────────────────┘
//! ```
//!
//! While not streaming, every batch lands in the secondary store. Replay
//! moves at most `buffer_send_rate` of the secondary's oldest files per
//! periodic check.

use async_trait::async_trait;
use chrono::Local;
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::conf::StoreConf;
use crate::counters::Counter;
use crate::entry::LogEntry;
use crate::store::{create_store, FileStore, Store, StoreBase, StoreContext, StoreType};

pub const DEFAULT_MAX_QUEUE_LENGTH: u64 = 2_000_000;
pub const DEFAULT_BUFFER_SEND_RATE: u64 = 1;
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_RETRY_INTERVAL_RANGE_SECS: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    Streaming,
    Disconnected,
    SendingBuffer,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferState::Streaming => "STREAMING",
            BufferState::Disconnected => "DISCONNECTED",
            BufferState::SendingBuffer => "SENDING_BUFFER",
        };
        f.write_str(name)
    }
}

pub struct BufferStore {
    base: StoreBase,
    ctx: StoreContext,
    primary: Option<Box<dyn Store>>,
    secondary: Option<Box<dyn Store>>,
    state: BufferState,
    max_queue_length: u64,
    buffer_send_rate: u64,
    avg_retry_interval: u64,
    retry_interval_range: u64,
    retry_interval: Duration,
    last_open_attempt: Instant,
}

/// A retry interval in `[avg - range/2, avg + range/2)` seconds.
fn draw_retry_interval(avg: u64, range: u64) -> Duration {
    let secs = if range == 0 {
        avg
    } else {
        avg - range / 2 + rand::rng().random_range(0..range)
    };
    Duration::from_secs(secs)
}

impl BufferStore {
    #[must_use]
    pub fn new(category: &str, multi_category: bool, ctx: StoreContext) -> Self {
        BufferStore {
            base: StoreBase::new(category, StoreType::Buffer, multi_category),
            ctx,
            primary: None,
            secondary: None,
            state: BufferState::Disconnected,
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            buffer_send_rate: DEFAULT_BUFFER_SEND_RATE,
            avg_retry_interval: DEFAULT_RETRY_INTERVAL_SECS,
            retry_interval_range: DEFAULT_RETRY_INTERVAL_RANGE_SECS,
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            last_open_attempt: Instant::now(),
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Builds the `primary` or `secondary` child, recording a status on any
    /// config problem.
    fn configure_child(&mut self, conf: &StoreConf, role: &str, readable: bool) -> Option<Box<dyn Store>> {
        let Some(child_conf) = conf.get_store(role) else {
            let msg = format!("Bad config - buffer store doesn't have {role} store");
            error!("[{}] {}", self.base.category, msg);
            self.base.set_status(msg);
            return None;
        };
        let Some(store_type) = child_conf.get_string("type") else {
            let msg = format!("Bad config - buffer {role} store doesn't have a type");
            error!("[{}] {}", self.base.category, msg);
            self.base.set_status(msg);
            return None;
        };
        if role == "primary" && store_type == StoreType::Multi.as_str() {
            let msg = "Bad config - buffer primary store cannot be multistore";
            error!("[{}] {}", self.base.category, msg);
            self.base.set_status(msg);
            return None;
        }

        match create_store(
            store_type,
            &self.base.category,
            readable,
            self.base.multi_category,
            &self.ctx,
        ) {
            Ok(mut store) => {
                store.configure(&child_conf);
                Some(store)
            }
            Err(e) => {
                let msg = format!("Bad config - buffer {role} store: {e}");
                error!("[{}] {}", self.base.category, msg);
                self.base.set_status(msg);
                None
            }
        }
    }

    /// A file store under the default path, used when a child is misconfigured.
    fn fallback_store(&self, readable: bool) -> Box<dyn Store> {
        let mut store: Box<dyn Store> = Box::new(FileStore::new(
            &self.base.category,
            self.base.multi_category,
            readable,
        ));
        store.configure(&StoreConf::new());
        store
    }

    fn set_new_retry_interval(&mut self) {
        self.retry_interval = draw_retry_interval(self.avg_retry_interval, self.retry_interval_range);
        debug!(
            "[{}] Buffer store retry interval set to <{}> seconds",
            self.base.category,
            self.retry_interval.as_secs()
        );
    }

    async fn change_state(&mut self, new_state: BufferState) {
        match self.state {
            BufferState::Streaming => {
                if let Some(secondary) = self.secondary.as_mut() {
                    secondary.open().await;
                }
            }
            BufferState::Disconnected => self.base.set_status(""),
            BufferState::SendingBuffer => {}
        }

        match new_state {
            BufferState::Streaming => {
                if let Some(secondary) = self.secondary.as_mut() {
                    if secondary.is_open() {
                        secondary.close().await;
                    }
                }
            }
            BufferState::Disconnected => {
                self.ctx.counters.increment(Counter::Retries);
                self.set_new_retry_interval();
                self.last_open_attempt = Instant::now();
                self.open_secondary_if_closed().await;
            }
            BufferState::SendingBuffer => self.open_secondary_if_closed().await,
        }

        info!(
            "[{}] Changing state from <{}> to <{}>",
            self.base.category, self.state, new_state
        );
        self.state = new_state;
    }

    async fn open_secondary_if_closed(&mut self) {
        if let Some(secondary) = self.secondary.as_mut() {
            if !secondary.is_open() {
                secondary.open().await;
            }
        }
    }

    async fn send_buffered(&mut self) {
        let (Some(primary), Some(secondary)) = (self.primary.as_mut(), self.secondary.as_mut())
        else {
            return;
        };

        let mut next_state = None;
        for _ in 0..self.buffer_send_rate {
            let now = Local::now();
            let Some(mut messages) = secondary.read_oldest(now).await else {
                error!(
                    "[{}] Failed to read from secondary store, staying in <{}>",
                    self.base.category, self.state
                );
                self.base.set_status("Failed to read from secondary store");
                break;
            };

            let size = messages.len();
            if size > 0 {
                if primary.handle_messages(&mut messages).await {
                    secondary.delete_oldest(now).await;
                } else {
                    if messages.len() != size {
                        info!(
                            "[{}] buffer store primary store processed {}/{} messages",
                            self.base.category,
                            size - messages.len(),
                            size
                        );
                        if !secondary.replace_oldest(&mut messages, now).await {
                            warn!(
                                "[{}] buffer store secondary store lost {} messages",
                                self.base.category,
                                messages.len()
                            );
                            self.ctx
                                .counters
                                .add(Counter::Lost, messages.len() as u64);
                            secondary.delete_oldest(now).await;
                        }
                    }
                    next_state = Some(BufferState::Disconnected);
                    break;
                }
            } else {
                secondary.delete_oldest(now).await;
            }

            if secondary.empty(now).await {
                info!(
                    "[{}] No more buffer files to send, switching to streaming mode",
                    self.base.category
                );
                primary.flush().await;
                next_state = Some(BufferState::Streaming);
                break;
            }
        }

        if let Some(next_state) = next_state {
            self.change_state(next_state).await;
        }
    }
}

#[async_trait]
impl Store for BufferStore {
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
        Box::new(BufferStore {
            base: self.base.copy_for(category),
            ctx: self.ctx.clone(),
            primary: self.primary.as_ref().map(|store| store.copy(category)),
            secondary: self.secondary.as_ref().map(|store| store.copy(category)),
            state: BufferState::Disconnected,
            max_queue_length: self.max_queue_length,
            buffer_send_rate: self.buffer_send_rate,
            avg_retry_interval: self.avg_retry_interval,
            retry_interval_range: self.retry_interval_range,
            retry_interval: self.retry_interval,
            last_open_attempt: Instant::now(),
        })
    }

    fn configure(&mut self, conf: &StoreConf) {
        if let Some(value) = conf.get_unsigned("max_queue_length") {
            self.max_queue_length = value;
        }
        if let Some(value) = conf.get_unsigned("buffer_send_rate") {
            self.buffer_send_rate = value;
        }
        if let Some(value) = conf.get_unsigned("retry_interval") {
            self.avg_retry_interval = value;
        }
        if let Some(value) = conf.get_unsigned("retry_interval_range") {
            self.retry_interval_range = value;
        }
        if self.retry_interval_range > self.avg_retry_interval {
            warn!(
                "[{}] Bad config - retry_interval_range must be less than retry_interval. Using <{}> as range instead of <{}>",
                self.base.category, self.avg_retry_interval, self.retry_interval_range
            );
            self.retry_interval_range = self.avg_retry_interval;
        }
        self.set_new_retry_interval();

        self.secondary = self.configure_child(conf, "secondary", true);
        self.primary = self.configure_child(conf, "primary", false);
        if self.secondary.is_none() {
            self.secondary = Some(self.fallback_store(true));
        }
        if self.primary.is_none() {
            self.primary = Some(self.fallback_store(false));
        }
        self.base.configured = true;
    }

    async fn open(&mut self) -> bool {
        if !self.base.check_configured() {
            return false;
        }
        let primary_opened = match self.primary.as_mut() {
            Some(primary) => primary.open().await,
            None => false,
        };
        if primary_opened {
            // leftovers from a previous run get replayed first
            self.change_state(BufferState::SendingBuffer).await;
        } else {
            if let Some(secondary) = self.secondary.as_mut() {
                secondary.open().await;
            }
            self.change_state(BufferState::Disconnected).await;
        }
        self.is_open()
    }

    fn is_open(&self) -> bool {
        self.primary.as_ref().is_some_and(|store| store.is_open())
            || self.secondary.as_ref().is_some_and(|store| store.is_open())
    }

    async fn close(&mut self) {
        if let Some(primary) = self.primary.as_mut() {
            if primary.is_open() {
                primary.flush().await;
                primary.close().await;
            }
        }
        if let Some(secondary) = self.secondary.as_mut() {
            if secondary.is_open() {
                secondary.flush().await;
                secondary.close().await;
            }
        }
    }

    async fn handle_messages(&mut self, messages: &mut Vec<LogEntry>) -> bool {
        if self.state == BufferState::Streaming {
            if messages.len() as u64 > self.max_queue_length {
                warn!(
                    "[{}] Batch of <{}> messages exceeds max_queue_length <{}>, buffering",
                    self.base.category,
                    messages.len(),
                    self.max_queue_length
                );
                self.change_state(BufferState::Disconnected).await;
            } else {
                let handled = match self.primary.as_mut() {
                    Some(primary) => primary.handle_messages(messages).await,
                    None => false,
                };
                if handled {
                    return true;
                }
                self.change_state(BufferState::Disconnected).await;
            }
        }

        match self.secondary.as_mut() {
            Some(secondary) => secondary.handle_messages(messages).await,
            None => false,
        }
    }

    async fn periodic_check(&mut self) {
        if let Some(primary) = self.primary.as_mut() {
            primary.periodic_check().await;
        }
        if let Some(secondary) = self.secondary.as_mut() {
            secondary.periodic_check().await;
        }

        if self.state == BufferState::Disconnected
            && self.last_open_attempt.elapsed() >= self.retry_interval
        {
            let reopened = match self.primary.as_mut() {
                Some(primary) => primary.open().await,
                None => false,
            };
            if reopened {
                self.change_state(BufferState::SendingBuffer).await;
            } else {
                // restarts the retry timer
                self.change_state(BufferState::Disconnected).await;
            }
        }

        if self.state == BufferState::SendingBuffer {
            self.send_buffered().await;
        }
    }

    async fn flush(&mut self) {
        if let Some(primary) = self.primary.as_mut() {
            if primary.is_open() {
                primary.flush().await;
            }
        }
        if let Some(secondary) = self.secondary.as_mut() {
            if secondary.is_open() {
                secondary.flush().await;
            }
        }
    }

    fn status(&self) -> String {
        if let Some(status) = self
            .secondary
            .as_ref()
            .map(|store| store.status())
            .filter(|status| !status.is_empty())
        {
            return status;
        }
        if !self.base.status.is_empty() {
            return self.base.status.clone();
        }
        self.primary
            .as_ref()
            .map(|store| store.status())
            .unwrap_or_default()
    }
}
