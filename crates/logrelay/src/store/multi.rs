// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tracing::{error, info};

use crate::conf::StoreConf;
use crate::entry::LogEntry;
use crate::store::{create_store, Store, StoreBase, StoreContext, StoreType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportSuccess {
    All,
    Any,
}

impl ReportSuccess {
    fn combine(self, results: &[bool]) -> bool {
        match self {
            ReportSuccess::All => results.iter().all(|ok| *ok),
            ReportSuccess::Any => results.iter().any(|ok| *ok),
        }
    }
}

/// Fans every batch out to `store0`, `store1`, ... in order.
pub struct MultiStore {
    base: StoreBase,
    ctx: StoreContext,
    report_success: ReportSuccess,
    stores: Vec<Box<dyn Store>>,
}

impl MultiStore {
    #[must_use]
    pub fn new(category: &str, multi_category: bool, ctx: StoreContext) -> Self {
        MultiStore {
            base: StoreBase::new(category, StoreType::Multi, multi_category),
            ctx,
            report_success: ReportSuccess::All,
            stores: Vec::new(),
        }
    }

    fn configure_stores(&mut self, conf: &StoreConf) -> Result<(), &'static str> {
        self.report_success = match conf.get_string("report_success") {
            None | Some("all") => ReportSuccess::All,
            Some("any") => ReportSuccess::Any,
            Some(other) => {
                error!(
                    "[{}] MULTI: {} is an invalid value for report_success.",
                    self.base.category, other
                );
                return Err("MULTI: Invalid report_success value.");
            }
        };

        // numbering may start at store0 or store1
        let mut index = if conf.get_store("store0").is_some() { 0 } else { 1 };
        while let Some(child_conf) = conf.get_store(&format!("store{index}")) {
            let Some(store_type) = child_conf.get_string("type") else {
                error!("[{}] MULTI: Store {} is missing type.", self.base.category, index);
                return Err("MULTI: Store is missing type.");
            };
            match create_store(
                store_type,
                &self.base.category,
                false,
                self.base.multi_category,
                &self.ctx,
            ) {
                Ok(mut store) => {
                    store.configure(&child_conf);
                    info!(
                        "[{}] MULTI: Configured store of type {} successfully.",
                        self.base.category, store_type
                    );
                    self.stores.push(store);
                }
                Err(e) => {
                    error!("[{}] MULTI: store {}: {}", self.base.category, index, e);
                    return Err("MULTI: Store has an unknown type.");
                }
            }
            index += 1;
        }

        if self.stores.is_empty() {
            error!("[{}] MULTI: No stores found, invalid store.", self.base.category);
            return Err("MULTI: No stores found, invalid store.");
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MultiStore {
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
        Box::new(MultiStore {
            base: self.base.copy_for(category),
            ctx: self.ctx.clone(),
            report_success: self.report_success,
            stores: self.stores.iter().map(|store| store.copy(category)).collect(),
        })
    }

    fn configure(&mut self, conf: &StoreConf) {
        self.stores.clear();
        if let Err(msg) = self.configure_stores(conf) {
            self.base.set_status(msg);
        }
        self.base.configured = true;
    }

    async fn open(&mut self) -> bool {
        if !self.base.check_configured() {
            return false;
        }
        let mut results = Vec::with_capacity(self.stores.len());
        for store in &mut self.stores {
            results.push(store.open().await);
        }
        self.report_success.combine(&results)
    }

    fn is_open(&self) -> bool {
        let results: Vec<bool> = self.stores.iter().map(|store| store.is_open()).collect();
        self.report_success.combine(&results)
    }

    async fn close(&mut self) {
        for store in &mut self.stores {
            store.close().await;
        }
    }

    async fn handle_messages(&mut self, messages: &mut Vec<LogEntry>) -> bool {
        let mut results = Vec::with_capacity(self.stores.len());
        for store in &mut self.stores {
            // every child sees the whole batch
            let mut batch = messages.clone();
            results.push(store.handle_messages(&mut batch).await);
        }
        let success = self.report_success.combine(&results);
        if success {
            messages.clear();
        }
        success
    }

    async fn periodic_check(&mut self) {
        for store in &mut self.stores {
            store.periodic_check().await;
        }
    }

    async fn flush(&mut self) {
        for store in &mut self.stores {
            store.flush().await;
        }
    }

    fn status(&self) -> String {
        if !self.base.status.is_empty() {
            return self.base.status.clone();
        }
        self.stores
            .iter()
            .map(|store| store.status())
            .find(|status| !status.is_empty())
            .unwrap_or_default()
    }
}
