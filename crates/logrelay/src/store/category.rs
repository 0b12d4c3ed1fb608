// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use hashbrown::HashMap;
use tracing::{error, info};

use crate::conf::StoreConf;
use crate::entry::LogEntry;
use crate::store::{create_store, Store, StoreBase, StoreContext, StoreType};

/// Clones a model store for every category seen in traffic.
///
/// A `multifile` store is the same thing with the model fixed to a file store
/// configured from the block itself.
pub struct CategoryStore {
    base: StoreBase,
    ctx: StoreContext,
    model: Option<Box<dyn Store>>,
    stores: HashMap<String, Box<dyn Store>>,
    open: bool,
}

impl CategoryStore {
    #[must_use]
    pub fn new(category: &str, multi_category: bool, ctx: StoreContext) -> Self {
        Self::with_type(category, StoreType::Category, multi_category, ctx)
    }

    #[must_use]
    pub fn multi_file(category: &str, multi_category: bool, ctx: StoreContext) -> Self {
        Self::with_type(category, StoreType::MultiFile, multi_category, ctx)
    }

    fn with_type(category: &str, store_type: StoreType, multi_category: bool, ctx: StoreContext) -> Self {
        CategoryStore {
            base: StoreBase::new(category, store_type, multi_category),
            ctx,
            model: None,
            stores: HashMap::new(),
            open: false,
        }
    }

    /// Categories that currently have a child store.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.stores.keys().cloned().collect();
        categories.sort();
        categories
    }

    fn configure_common(&mut self, conf: &StoreConf, store_type: &str) {
        match create_store(store_type, &self.base.category, false, false, &self.ctx) {
            Ok(mut model) => {
                model.configure(conf);
                info!(
                    "[{}] {}: Configured store of type {} successfully.",
                    self.base.category, self.base.store_type, store_type
                );
                self.model = Some(model);
            }
            Err(e) => {
                error!("[{}] CATEGORYSTORE: {}", self.base.category, e);
                self.base.set_status("CATEGORYSTORE: Store has an unknown type.");
            }
        }
    }

    /// Child for `category`, created from the model and opened on first use.
    async fn child(&mut self, category: &str) -> Option<&mut Box<dyn Store>> {
        if !self.stores.contains_key(category) {
            let mut store = self.model.as_ref()?.copy(category);
            store.open().await;
            self.stores.insert(category.to_string(), store);
        }
        self.stores.get_mut(category)
    }
}

#[async_trait]
impl Store for CategoryStore {
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
        Box::new(CategoryStore {
            base: self.base.copy_for(category),
            ctx: self.ctx.clone(),
            model: self.model.as_ref().map(|model| model.copy(category)),
            stores: HashMap::new(),
            open: false,
        })
    }

    fn configure(&mut self, conf: &StoreConf) {
        self.model = None;
        if self.base.store_type == StoreType::MultiFile {
            self.configure_common(conf, StoreType::File.as_str());
        } else {
            match conf.get_store("model") {
                None => {
                    error!(
                        "[{}] CATEGORYSTORE: No stores found, invalid store.",
                        self.base.category
                    );
                    self.base
                        .set_status("CATEGORYSTORE: NO stores found, invalid store.");
                }
                Some(model_conf) => match model_conf.get_string("type") {
                    Some(store_type) => {
                        let store_type = store_type.to_string();
                        self.configure_common(&model_conf, &store_type);
                    }
                    None => {
                        error!(
                            "[{}] CATEGORYSTORE: Store is missing type.",
                            self.base.category
                        );
                        self.base.set_status("CATEGORYSTORE: Store is missing type.");
                    }
                },
            }
        }
        self.base.configured = true;
    }

    async fn open(&mut self) -> bool {
        if !self.base.check_configured() {
            return false;
        }
        self.open = true;
        let mut result = true;
        for store in self.stores.values_mut() {
            result &= store.open().await;
        }
        result
    }

    fn is_open(&self) -> bool {
        self.open && self.stores.values().all(|store| store.is_open())
    }

    async fn close(&mut self) {
        for store in self.stores.values_mut() {
            store.close().await;
        }
        self.open = false;
    }

    async fn handle_messages(&mut self, messages: &mut Vec<LogEntry>) -> bool {
        if !self.open {
            return false;
        }
        let mut failed = Vec::new();
        for entry in messages.drain(..) {
            let parent = self.base.category.clone();
            let Some(store) = self.child(&entry.category).await.filter(|store| store.is_open())
            else {
                error!(
                    "[{}] Failed to open store for category <{}>",
                    parent, entry.category
                );
                failed.push(entry);
                continue;
            };

            let mut single = vec![entry];
            if !store.handle_messages(&mut single).await {
                error!(
                    "[{}] Failed to handle message for category <{}>",
                    parent, single[0].category
                );
                failed.append(&mut single);
            }
        }

        if failed.is_empty() {
            true
        } else {
            *messages = failed;
            false
        }
    }

    async fn periodic_check(&mut self) {
        for store in self.stores.values_mut() {
            store.periodic_check().await;
        }
    }

    async fn flush(&mut self) {
        for store in self.stores.values_mut() {
            store.flush().await;
        }
    }

    fn status(&self) -> String {
        if !self.base.status.is_empty() {
            return self.base.status.clone();
        }
        self.stores
            .values()
            .map(|store| store.status())
            .find(|status| !status.is_empty())
            .unwrap_or_default()
    }
}
