// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Message acceptance and category routing.
//!
//! A category resolves to its queues by exact name, then by the longest
//! registered `prefix*`, then by the `default` store. Prefix and default
//! stores are models when `new_thread_per_category=yes`: the first message
//! for an unseen category starts a dedicated queue from a copy of the model.
//! Otherwise they are live multi-category queues shared by every category
//! they match.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::conf::StoreConf;
use crate::counters::{Counter, Counters};
use crate::entry::{LogEntry, ResultCode};
use crate::store::StoreContext;
use crate::store_queue::StoreQueue;

pub const DEFAULT_MAX_MSG_PER_SECOND: u64 = 100_000;
pub const DEFAULT_MAX_QUEUE_SIZE: u64 = 5_000_000;
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_CATEGORY: &str = "default";

const THROTTLE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Dead,
    Starting,
    Alive,
    Stopping,
    Stopped,
    Warning,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Dead => "DEAD",
            HealthStatus::Starting => "STARTING",
            HealthStatus::Alive => "ALIVE",
            HealthStatus::Stopping => "STOPPING",
            HealthStatus::Stopped => "STOPPED",
            HealthStatus::Warning => "WARNING",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouterSettings {
    pub max_msg_per_second: u64,
    pub max_queue_size: u64,
    pub check_period: Duration,
    pub new_thread_per_category: bool,
}

impl Default for RouterSettings {
    fn default() -> Self {
        RouterSettings {
            max_msg_per_second: DEFAULT_MAX_MSG_PER_SECOND,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            check_period: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            new_thread_per_category: true,
        }
    }
}

impl RouterSettings {
    #[must_use]
    pub fn from_conf(conf: &StoreConf) -> Self {
        let defaults = RouterSettings::default();
        RouterSettings {
            max_msg_per_second: conf
                .get_unsigned("max_msg_per_second")
                .unwrap_or(defaults.max_msg_per_second),
            max_queue_size: conf
                .get_unsigned("max_queue_size")
                .unwrap_or(defaults.max_queue_size),
            check_period: conf
                .get_unsigned("check_interval")
                .map_or(defaults.check_period, Duration::from_secs),
            new_thread_per_category: conf.get_string("new_thread_per_category") != Some("no"),
        }
    }
}

/// A category name usable as a single path component.
#[must_use]
pub fn is_valid_category(category: &str) -> bool {
    !category.is_empty()
        && category != "."
        && category != ".."
        && !category.contains(['/', '\\', '\0'])
}

#[derive(Clone, Default)]
struct RoutingTable {
    categories: HashMap<String, Vec<Arc<StoreQueue>>>,
    /// Keyed by the configured category, trailing `*` included.
    prefixes: BTreeMap<String, Arc<StoreQueue>>,
    default: Option<Arc<StoreQueue>>,
}

impl RoutingTable {
    /// Every distinct queue in the table.
    fn queues(&self) -> Vec<Arc<StoreQueue>> {
        let mut queues: Vec<Arc<StoreQueue>> = Vec::new();
        let all = self
            .categories
            .values()
            .flatten()
            .chain(self.prefixes.values())
            .chain(self.default.iter());
        for queue in all {
            if !queues.iter().any(|known| Arc::ptr_eq(known, queue)) {
                queues.push(Arc::clone(queue));
            }
        }
        queues
    }

    fn contains(&self, queue: &Arc<StoreQueue>) -> bool {
        self.queues().iter().any(|known| Arc::ptr_eq(known, queue))
    }

    fn model_for(&self, category: &str) -> Option<Arc<StoreQueue>> {
        self.prefixes
            .iter()
            .filter(|(prefix, _)| category.starts_with(prefix.trim_end_matches('*')))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, queue)| Arc::clone(queue))
            .or_else(|| self.default.clone())
    }
}

struct Throttle {
    window_start: Instant,
    count: u64,
}

struct Health {
    status: HealthStatus,
    details: String,
}

pub struct Router {
    ctx: StoreContext,
    settings: Mutex<RouterSettings>,
    table: RwLock<Option<RoutingTable>>,
    throttle: Mutex<Throttle>,
    health: Mutex<Health>,
}

impl Router {
    #[must_use]
    pub fn new(ctx: StoreContext) -> Self {
        Router {
            ctx,
            settings: Mutex::new(RouterSettings::default()),
            table: RwLock::new(None),
            throttle: Mutex::new(Throttle {
                window_start: Instant::now(),
                count: 0,
            }),
            health: Mutex::new(Health {
                status: HealthStatus::Dead,
                details: String::new(),
            }),
        }
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.ctx.counters
    }

    pub fn settings(&self) -> RouterSettings {
        #[allow(clippy::expect_used)]
        let settings = self.settings.lock().expect("lock poisoned");
        *settings
    }

    /// Health, downgraded to `Warning` while any store reports a status.
    pub fn status(&self) -> HealthStatus {
        let status = {
            #[allow(clippy::expect_used)]
            let health = self.health.lock().expect("lock poisoned");
            health.status
        };
        if status == HealthStatus::Alive
            && self.live_queues().iter().any(|queue| !queue.status().is_empty())
        {
            return HealthStatus::Warning;
        }
        status
    }

    /// Why the router is unhealthy, or the first store status found.
    pub fn status_details(&self) -> String {
        let details = {
            #[allow(clippy::expect_used)]
            let health = self.health.lock().expect("lock poisoned");
            health.details.clone()
        };
        if !details.is_empty() {
            return details;
        }
        self.live_queues()
            .iter()
            .map(|queue| queue.status())
            .find(|status| !status.is_empty())
            .unwrap_or_default()
    }

    fn set_status(&self, status: HealthStatus) {
        info!("STATUS: {}", status);
        #[allow(clippy::expect_used)]
        let mut health = self.health.lock().expect("lock poisoned");
        health.status = status;
    }

    fn set_status_details(&self, details: impl Into<String>) {
        let details = details.into();
        info!("STATUS: {}", details);
        #[allow(clippy::expect_used)]
        let mut health = self.health.lock().expect("lock poisoned");
        health.details = details;
    }

    fn live_queues(&self) -> Vec<Arc<StoreQueue>> {
        #[allow(clippy::expect_used)]
        let table = self.table.read().expect("lock poisoned");
        table.as_ref().map(RoutingTable::queues).unwrap_or_default()
    }

    /// Categories with a routing entry, sorted.
    pub fn categories(&self) -> Vec<String> {
        #[allow(clippy::expect_used)]
        let table = self.table.read().expect("lock poisoned");
        let mut categories: Vec<String> = table
            .as_ref()
            .map(|table| table.categories.keys().cloned().collect())
            .unwrap_or_default();
        categories.sort();
        categories
    }

    /// Queues registered for exactly `category`.
    pub fn queues(&self, category: &str) -> Vec<Arc<StoreQueue>> {
        #[allow(clippy::expect_used)]
        let table = self.table.read().expect("lock poisoned");
        table
            .as_ref()
            .and_then(|table| table.categories.get(category).cloned())
            .unwrap_or_default()
    }

    /// Builds a new routing table from `conf` and swaps it in.
    ///
    /// Queues for unchanged categories are reused. If no store could be
    /// configured the previous table stays in place and the status becomes
    /// `Warning`. Returns whether the new table was installed.
    pub async fn configure(&self, conf: &StoreConf) -> bool {
        self.set_status(HealthStatus::Starting);
        self.set_status_details("configuring");

        let settings = RouterSettings::from_conf(conf);
        {
            #[allow(clippy::expect_used)]
            let mut current = self.settings.lock().expect("lock poisoned");
            *current = settings;
        }

        let old = {
            #[allow(clippy::expect_used)]
            let table = self.table.read().expect("lock poisoned");
            table.clone().unwrap_or_default()
        };

        let mut perfect_config = true;
        let mut new = RoutingTable::default();
        let mut num_stores = 0;

        for (_, store_conf) in conf.get_all_stores() {
            let category = match store_conf.get_string("category") {
                Some(category) if !category.is_empty() => category.to_string(),
                _ => {
                    self.set_status_details("Bad config - store with no category");
                    perfect_config = false;
                    continue;
                }
            };
            info!("CATEGORY : {}", category);

            let is_default = category == DEFAULT_CATEGORY;
            if is_default && new.default.is_some() {
                self.set_status_details("Bad config - multiple default stores specified");
                perfect_config = false;
                continue;
            }
            let is_prefix = category.ends_with('*');

            let Some(store_type) = store_conf
                .get_string("type")
                .filter(|store_type| !store_type.is_empty())
                .map(str::to_string)
            else {
                self.set_status_details(format!(
                    "Bad config - no type for store with category: {category}"
                ));
                perfect_config = false;
                continue;
            };

            // several queues for one category can't be matched up, so only
            // a lone queue of the same type is reused
            let reused = match old.categories.get(&category) {
                Some(queues) if !is_prefix && queues.len() == 1 => queues
                    .first()
                    .filter(|queue| queue.store_type().as_str() == store_type)
                    .cloned(),
                _ => None,
            };

            let queue = match reused {
                Some(queue) => {
                    debug!("[{}] reusing store queue", category);
                    queue
                }
                None => {
                    let store_name = category.trim_end_matches('*');
                    let is_model = settings.new_thread_per_category && (is_default || is_prefix);
                    let multi_category =
                        !settings.new_thread_per_category && (is_default || is_prefix);
                    match StoreQueue::new(
                        &store_type,
                        store_name,
                        settings.check_period,
                        is_model,
                        multi_category,
                        &self.ctx,
                    ) {
                        Ok(queue) => Arc::new(queue),
                        Err(e) => {
                            error!("[{}] {}", category, e);
                            self.set_status_details(format!(
                                "Bad config - can't create a store of type: {store_type}"
                            ));
                            perfect_config = false;
                            continue;
                        }
                    }
                }
            };

            queue.configure_and_open(store_conf);
            num_stores += 1;

            if is_default {
                info!("Creating default store");
                new.default = Some(Arc::clone(&queue));
            } else if is_prefix {
                if new.prefixes.contains_key(&category) {
                    self.set_status_details(format!(
                        "Bad config - multiple prefix stores specified for category: {category}"
                    ));
                    perfect_config = false;
                } else {
                    new.prefixes.insert(category.clone(), Arc::clone(&queue));
                }
            }

            if !queue.is_model() {
                new.categories.entry(category).or_default().push(queue);
            }
        }

        let enough_config_to_run = num_stores > 0;
        if enough_config_to_run {
            info!("configured <{}> stores", num_stores);
        } else {
            self.set_status_details("No stores configured successfully");
            perfect_config = false;
        }

        let retired = if enough_config_to_run {
            #[allow(clippy::expect_used)]
            let mut table = self.table.write().expect("lock poisoned");
            *table = Some(new.clone());
            old.queues()
                .into_iter()
                .filter(|queue| !new.contains(queue))
                .collect()
        } else {
            new.queues()
                .into_iter()
                .filter(|queue| !old.contains(queue))
                .collect::<Vec<_>>()
        };
        for queue in retired {
            queue.stop().await;
        }

        if perfect_config {
            self.set_status_details("");
            self.set_status(HealthStatus::Alive);
        } else {
            self.set_status(HealthStatus::Warning);
        }
        enough_config_to_run
    }

    /// Accepts a batch for processing.
    ///
    /// `TryLater` only means the whole batch was refused; accepted messages
    /// with a blank or unroutable category are counted and dropped.
    pub fn log(&self, messages: Vec<LogEntry>) -> ResultCode {
        if self.throttle_deny(messages.len() as u64) {
            self.ctx.counters.increment(Counter::DeniedForRate);
            return ResultCode::TryLater;
        }

        let max_queue_size = self.settings().max_queue_size;
        let largest_queue = {
            #[allow(clippy::expect_used)]
            let table = self.table.read().expect("lock poisoned");
            let Some(table) = table.as_ref() else {
                self.ctx.counters.increment(Counter::InvalidRequests);
                return ResultCode::TryLater;
            };
            table
                .categories
                .values()
                .flatten()
                .map(|queue| queue.size())
                .max()
                .unwrap_or(0)
        };
        if largest_queue > max_queue_size {
            self.ctx.counters.increment(Counter::DeniedForQueueSize);
            return ResultCode::TryLater;
        }

        for entry in messages {
            if entry.category.is_empty() {
                self.ctx.counters.increment(Counter::ReceivedBlankCategory);
                continue;
            }

            let queues = self.resolve(&entry.category);
            if queues.is_empty() {
                warn!("log entry has invalid category <{}>", entry.category);
                self.ctx.counters.increment(Counter::ReceivedBad);
                continue;
            }
            for queue in &queues {
                queue.add_message(entry.clone());
            }
            self.ctx.counters.increment(Counter::ReceivedGood);
        }
        ResultCode::Ok
    }

    fn throttle_deny(&self, num_messages: u64) -> bool {
        let max_msg_per_second = self.settings().max_msg_per_second;
        #[allow(clippy::expect_used)]
        let mut throttle = self.throttle.lock().expect("lock poisoned");

        let now = Instant::now();
        if now.duration_since(throttle.window_start) >= THROTTLE_WINDOW {
            throttle.window_start = now;
            throttle.count = 0;
        }

        // splitting a huge batch would only lose part of it, so let it through
        if num_messages > max_msg_per_second / 2 {
            info!(
                "throttle allowing oversized batch with <{}> messages",
                num_messages
            );
            return false;
        }

        if throttle.count + num_messages > max_msg_per_second {
            warn!(
                "throttle denying request with <{}> messages. It would exceed max of <{}> messages this second",
                num_messages, max_msg_per_second
            );
            true
        } else {
            throttle.count += num_messages;
            false
        }
    }

    fn resolve(&self, category: &str) -> Vec<Arc<StoreQueue>> {
        let model = {
            #[allow(clippy::expect_used)]
            let table = self.table.read().expect("lock poisoned");
            let Some(table) = table.as_ref() else {
                return Vec::new();
            };
            if let Some(queues) = table.categories.get(category) {
                return queues.clone();
            }
            table.model_for(category)
        };
        match model {
            Some(model) => self.create_category_from_model(category, &model),
            None => Vec::new(),
        }
    }

    fn create_category_from_model(&self, category: &str, model: &Arc<StoreQueue>) -> Vec<Arc<StoreQueue>> {
        if !is_valid_category(category) {
            warn!("Category <{}> is not a valid file name", category);
            return Vec::new();
        }

        #[allow(clippy::expect_used)]
        let mut table = self.table.write().expect("lock poisoned");
        let Some(table) = table.as_mut() else {
            return Vec::new();
        };
        if let Some(queues) = table.categories.get(category) {
            return queues.clone();
        }

        info!(
            "[{}] Creating new category from model {}",
            category,
            model.category()
        );
        let queue = if model.is_model() {
            match StoreQueue::from_model(model, category, Arc::clone(&self.ctx.counters)) {
                Ok(queue) => {
                    queue.open();
                    Arc::new(queue)
                }
                Err(e) => {
                    error!("[{}] failed to create store queue from model: {}", category, e);
                    return Vec::new();
                }
            }
        } else {
            Arc::clone(model)
        };

        let queues = vec![queue];
        table.categories.insert(category.to_string(), queues.clone());
        queues
    }

    /// Stops every queue, flushing what they hold.
    pub async fn shutdown(&self) {
        self.set_status(HealthStatus::Stopping);
        let table = {
            #[allow(clippy::expect_used)]
            let mut table = self.table.write().expect("lock poisoned");
            table.take()
        };
        if let Some(table) = table {
            for queue in table.queues() {
                queue.stop().await;
            }
        }
        self.set_status(HealthStatus::Stopped);
    }
}
