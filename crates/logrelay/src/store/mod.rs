// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Polymorphic storage targets.
//!
//! Every variant implements [`Store`]. Composite variants (buffer, bucket,
//! multi, category) own their children as `Box<dyn Store>`.
//!
//! ```text
//!   Unconfigured ──configure──► Configured ──open──► Open ⇄ Closed
//! ```
//!
//! `handle_messages` follows one contract across variants: `true` means the
//! whole batch was consumed. `false` leaves only the unconsumed messages in
//! the batch, in their original order, so the caller can retry or re-route
//! without duplicating anything.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::error;

use crate::conf::StoreConf;
use crate::conn_pool::ConnPool;
use crate::counters::Counters;
use crate::entry::LogEntry;
use crate::membership::{ServiceResolver, StaticResolver};

pub mod bucket;
pub mod buffer;
pub mod category;
pub mod file;
pub mod multi;
pub mod network;
pub mod null;

pub use bucket::{BucketStore, BucketType};
pub use buffer::{BufferState, BufferStore};
pub use category::CategoryStore;
pub use file::FileStore;
pub use multi::MultiStore;
pub use network::NetworkStore;
pub use null::NullStore;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Unknown store type: {0}")]
    UnknownType(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreType {
    File,
    Buffer,
    Network,
    Bucket,
    Null,
    Multi,
    Category,
    MultiFile,
}

impl StoreType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StoreType::File => "file",
            StoreType::Buffer => "buffer",
            StoreType::Network => "network",
            StoreType::Bucket => "bucket",
            StoreType::Null => "null",
            StoreType::Multi => "multi",
            StoreType::Category => "category",
            StoreType::MultiFile => "multifile",
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(StoreType::File),
            "buffer" => Ok(StoreType::Buffer),
            "network" => Ok(StoreType::Network),
            "bucket" => Ok(StoreType::Bucket),
            "null" => Ok(StoreType::Null),
            "multi" => Ok(StoreType::Multi),
            "category" => Ok(StoreType::Category),
            "multifile" => Ok(StoreType::MultiFile),
            other => Err(StoreError::UnknownType(other.to_string())),
        }
    }
}

/// Shared collaborators handed to every store at construction.
#[derive(Clone)]
pub struct StoreContext {
    pub conn_pool: Arc<ConnPool>,
    pub resolver: Arc<dyn ServiceResolver>,
    pub counters: Arc<Counters>,
}

impl StoreContext {
    pub fn new(
        conn_pool: Arc<ConnPool>,
        resolver: Arc<dyn ServiceResolver>,
        counters: Arc<Counters>,
    ) -> Self {
        StoreContext {
            conn_pool,
            resolver,
            counters,
        }
    }
}

impl Default for StoreContext {
    fn default() -> Self {
        StoreContext::new(
            Arc::new(ConnPool::new()),
            Arc::new(StaticResolver::new()),
            Arc::new(Counters::new()),
        )
    }
}

/// Builds an unconfigured store.
///
/// `readable` asks for a store that supports the replay operations; only
/// file stores honour it, by switching to framed buffer files.
pub fn create_store(
    store_type: &str,
    category: &str,
    readable: bool,
    multi_category: bool,
    ctx: &StoreContext,
) -> Result<Box<dyn Store>, StoreError> {
    let store: Box<dyn Store> = match store_type.parse::<StoreType>()? {
        StoreType::File => Box::new(FileStore::new(category, multi_category, readable)),
        StoreType::Buffer => Box::new(BufferStore::new(category, multi_category, ctx.clone())),
        StoreType::Network => Box::new(NetworkStore::new(category, multi_category, ctx.clone())),
        StoreType::Bucket => Box::new(BucketStore::new(category, multi_category, ctx.clone())),
        StoreType::Null => Box::new(NullStore::new(category, multi_category)),
        StoreType::Multi => Box::new(MultiStore::new(category, multi_category, ctx.clone())),
        StoreType::Category => Box::new(CategoryStore::new(category, multi_category, ctx.clone())),
        StoreType::MultiFile => Box::new(CategoryStore::multi_file(
            category,
            multi_category,
            ctx.clone(),
        )),
    };
    Ok(store)
}

/// State common to every variant.
#[derive(Clone, Debug)]
pub(crate) struct StoreBase {
    pub(crate) category: String,
    pub(crate) store_type: StoreType,
    pub(crate) multi_category: bool,
    pub(crate) status: String,
    pub(crate) configured: bool,
}

impl StoreBase {
    pub(crate) fn new(category: &str, store_type: StoreType, multi_category: bool) -> Self {
        StoreBase {
            category: category.to_string(),
            store_type,
            multi_category,
            status: String::new(),
            configured: false,
        }
    }

    /// Same settings bound to another category, marked configured.
    pub(crate) fn copy_for(&self, category: &str) -> Self {
        StoreBase {
            category: category.to_string(),
            store_type: self.store_type,
            multi_category: self.multi_category,
            status: String::new(),
            configured: true,
        }
    }

    pub(crate) fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    /// Guards `open` against a store that was never configured.
    pub(crate) fn check_configured(&mut self) -> bool {
        if !self.configured {
            error!(
                "[{}] LOGIC ERROR: open called on unconfigured {} store",
                self.category, self.store_type
            );
            self.set_status("Store opened before configure");
        }
        self.configured
    }
}

#[async_trait]
pub trait Store: Send {
    fn category(&self) -> &str;

    fn store_type(&self) -> StoreType;

    fn multi_category(&self) -> bool;

    /// Unopened clone with identical configuration, bound to `category`.
    fn copy(&self, category: &str) -> Box<dyn Store>;

    fn configure(&mut self, conf: &StoreConf);

    async fn open(&mut self) -> bool;

    fn is_open(&self) -> bool;

    async fn close(&mut self);

    async fn handle_messages(&mut self, messages: &mut Vec<LogEntry>) -> bool;

    async fn periodic_check(&mut self) {}

    async fn flush(&mut self);

    /// Empty when healthy.
    fn status(&self) -> String;

    /// Oldest buffered batch, `None` when it could not be read.
    async fn read_oldest(&mut self, _now: DateTime<Local>) -> Option<Vec<LogEntry>> {
        error!(
            "[{}] ERROR: attempting to read from a write-only store",
            self.category()
        );
        None
    }

    async fn replace_oldest(&mut self, _messages: &mut Vec<LogEntry>, _now: DateTime<Local>) -> bool {
        error!(
            "[{}] ERROR: attempting to read from a write-only store",
            self.category()
        );
        false
    }

    async fn delete_oldest(&mut self, _now: DateTime<Local>) {
        error!(
            "[{}] ERROR: attempting to read from a write-only store",
            self.category()
        );
    }

    async fn empty(&mut self, _now: DateTime<Local>) -> bool {
        error!(
            "[{}] ERROR: attempting to read from a write-only store",
            self.category()
        );
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Observable and steerable state behind a [`MockStore`] and its copies.
    #[derive(Debug, Default)]
    pub(crate) struct MockState {
        pub(crate) received: Vec<LogEntry>,
        pub(crate) fail_open: bool,
        /// Messages accepted per call before failing; `None` accepts all.
        pub(crate) accept: Option<usize>,
        pub(crate) opens: usize,
        pub(crate) closes: usize,
        pub(crate) flushes: usize,
        pub(crate) periodic_checks: usize,
        pub(crate) copies: Vec<String>,
        pub(crate) status: String,
    }

    pub(crate) struct MockStore {
        base: StoreBase,
        open: bool,
        pub(crate) state: Arc<Mutex<MockState>>,
    }

    impl MockStore {
        pub(crate) fn new(category: &str) -> (Self, Arc<Mutex<MockState>>) {
            let state = Arc::new(Mutex::new(MockState::default()));
            let mut base = StoreBase::new(category, StoreType::Null, false);
            base.configured = true;
            (
                MockStore {
                    base,
                    open: false,
                    state: Arc::clone(&state),
                },
                state,
            )
        }
    }

    #[async_trait]
    impl Store for MockStore {
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
            self.state.lock().unwrap().copies.push(category.to_string());
            Box::new(MockStore {
                base: self.base.copy_for(category),
                open: false,
                state: Arc::clone(&self.state),
            })
        }

        fn configure(&mut self, _conf: &StoreConf) {
            self.base.configured = true;
        }

        async fn open(&mut self) -> bool {
            let mut state = self.state.lock().unwrap();
            state.opens += 1;
            self.open = !state.fail_open;
            self.open
        }

        fn is_open(&self) -> bool {
            self.open
        }

        async fn close(&mut self) {
            self.state.lock().unwrap().closes += 1;
            self.open = false;
        }

        async fn handle_messages(&mut self, messages: &mut Vec<LogEntry>) -> bool {
            if !self.open {
                return false;
            }
            let mut state = self.state.lock().unwrap();
            let take = state.accept.unwrap_or(messages.len()).min(messages.len());
            state.received.extend(messages.drain(..take));
            messages.is_empty()
        }

        async fn periodic_check(&mut self) {
            self.state.lock().unwrap().periodic_checks += 1;
        }

        async fn flush(&mut self) {
            self.state.lock().unwrap().flushes += 1;
        }

        fn status(&self) -> String {
            self.state.lock().unwrap().status.clone()
        }
    }

    pub(crate) fn entries(category: &str, messages: &[&str]) -> Vec<LogEntry> {
        messages
            .iter()
            .map(|message| LogEntry::new(category, *message))
            .collect()
    }
}
