// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::conf::StoreConf;
use crate::entry::LogEntry;
use crate::store::{Store, StoreBase, StoreType};

/// Accepts and discards everything. Replays as an always-empty buffer.
pub struct NullStore {
    base: StoreBase,
}

impl NullStore {
    #[must_use]
    pub fn new(category: &str, multi_category: bool) -> Self {
        NullStore {
            base: StoreBase::new(category, StoreType::Null, multi_category),
        }
    }
}

#[async_trait]
impl Store for NullStore {
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
        Box::new(NullStore {
            base: self.base.copy_for(category),
        })
    }

    fn configure(&mut self, _conf: &StoreConf) {
        self.base.configured = true;
    }

    async fn open(&mut self) -> bool {
        self.base.check_configured()
    }

    fn is_open(&self) -> bool {
        true
    }

    async fn close(&mut self) {}

    async fn handle_messages(&mut self, _messages: &mut Vec<LogEntry>) -> bool {
        true
    }

    async fn flush(&mut self) {}

    fn status(&self) -> String {
        self.base.status.clone()
    }

    async fn read_oldest(&mut self, _now: DateTime<Local>) -> Option<Vec<LogEntry>> {
        Some(Vec::new())
    }

    async fn replace_oldest(&mut self, _messages: &mut Vec<LogEntry>, _now: DateTime<Local>) -> bool {
        true
    }

    async fn delete_oldest(&mut self, _now: DateTime<Local>) {}

    async fn empty(&mut self, _now: DateTime<Local>) -> bool {
        true
    }
}
