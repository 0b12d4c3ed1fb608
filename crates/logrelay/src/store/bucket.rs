// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spreads messages across `num_buckets + 1` child stores.
//!
//! Bucket 0 catches every message that can't be bucketized; keyed messages
//! land in `1..=num_buckets`.

use async_trait::async_trait;
use fnv::FnvHasher;
use std::hash::Hasher;
use tracing::{debug, error, warn};

use crate::conf::StoreConf;
use crate::entry::LogEntry;
use crate::store::{create_store, Store, StoreBase, StoreContext, StoreType};

pub const DEFAULT_DELIMITER: u8 = b':';
const CONTEXT_LOG_DELIMITER: u8 = 1;
const CONTEXT_LOG_KEY_FIELD: usize = 3;
const BUCKET_WRITE_ERROR: &str = "Failed write to bucket store";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketType {
    /// Decimal id after the third `\x01`, mixed with a 32-bit integer hash.
    ContextLog,
    /// FNV hash of everything before the first delimiter.
    KeyHash,
    /// Decimal key before the first delimiter, modulo the bucket count.
    KeyModulo,
}

impl BucketType {
    fn uses_delimiter(self) -> bool {
        !matches!(self, BucketType::ContextLog)
    }
}

pub struct BucketStore {
    base: StoreBase,
    ctx: StoreContext,
    bucket_type: BucketType,
    delimiter: u8,
    remove_key: bool,
    opened: bool,
    num_buckets: u64,
    buckets: Vec<Box<dyn Store>>,
}

/// Thomas Wang's 32-bit integer mix.
fn hash32(mut key: u32) -> u32 {
    key = key.wrapping_add(!(key << 15));
    key ^= key >> 10;
    key = key.wrapping_add(key << 3);
    key ^= key >> 6;
    key = key.wrapping_add(!(key << 11));
    key ^= key >> 16;
    key
}

fn key_hash(key: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    hasher.finish()
}

/// Leading decimal digits of `digits`, saturating on overflow.
fn leading_decimal(digits: &[u8]) -> u64 {
    digits
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0u64, |acc, b| {
            acc.saturating_mul(10).saturating_add(u64::from(b - b'0'))
        })
}

impl BucketStore {
    #[must_use]
    pub fn new(category: &str, multi_category: bool, ctx: StoreContext) -> Self {
        BucketStore {
            base: StoreBase::new(category, StoreType::Bucket, multi_category),
            ctx,
            bucket_type: BucketType::ContextLog,
            delimiter: DEFAULT_DELIMITER,
            remove_key: false,
            opened: false,
            num_buckets: 1,
            buckets: Vec::new(),
        }
    }

    /// Bucket index for `message`, in `0..=num_buckets`.
    pub fn bucketize(&self, message: &[u8]) -> u64 {
        if self.num_buckets == 0 {
            return 0;
        }
        match self.bucket_type {
            BucketType::ContextLog => {
                let mut pos = 0;
                for _ in 0..CONTEXT_LOG_KEY_FIELD {
                    match message[pos..].iter().position(|b| *b == CONTEXT_LOG_DELIMITER) {
                        Some(offset) if pos + offset + 1 < message.len() => pos += offset + 1,
                        _ => return 0,
                    }
                }
                // strtoul semantics, truncated to 32 bits
                let id = leading_decimal(&message[pos..]) as u32;
                if id == 0 {
                    return 0;
                }
                u64::from(hash32(id)) % self.num_buckets + 1
            }
            BucketType::KeyHash | BucketType::KeyModulo => {
                let Some(pos) = message.iter().position(|b| *b == self.delimiter) else {
                    debug!(
                        "[{}] didn't find delimiter <{}> in message",
                        self.base.category, self.delimiter
                    );
                    return 0;
                };
                let key = &message[..pos];
                if key.is_empty() {
                    debug!("[{}] key is empty, using bucket 0", self.base.category);
                    return 0;
                }
                if self.bucket_type == BucketType::KeyHash {
                    return key_hash(key) % self.num_buckets + 1;
                }
                if key.first() == Some(&b'-') {
                    return 0;
                }
                leading_decimal(key) % self.num_buckets + 1
            }
        }
    }

    /// `message` with everything up to and including the first delimiter removed.
    pub fn message_without_key<'a>(&self, message: &'a [u8]) -> &'a [u8] {
        match message.iter().position(|b| *b == self.delimiter) {
            Some(pos) => &message[pos + 1..],
            None => message,
        }
    }

    fn configure_buckets(&mut self, conf: &StoreConf) -> Result<(), String> {
        self.num_buckets = conf
            .get_unsigned("num_buckets")
            .ok_or("Bad config - bucket store must have num_buckets")?;
        let bucket_conf = conf
            .get_store("bucket")
            .ok_or("Bad config - bucket store must contain another store called <bucket>")?;
        let mut bucket_conf = StoreConf::clone(&bucket_conf);

        self.bucket_type = match conf.get_string("bucket_type") {
            Some("key_hash") => BucketType::KeyHash,
            Some("key_modulo") => BucketType::KeyModulo,
            Some("context_log") | None => BucketType::ContextLog,
            Some(other) => {
                warn!(
                    "[{}] unknown bucket_type <{}>, using context_log",
                    self.base.category, other
                );
                BucketType::ContextLog
            }
        };

        if self.bucket_type.uses_delimiter() {
            let delimiter = conf.get_unsigned("delimiter").unwrap_or(0);
            self.delimiter = match u8::try_from(delimiter) {
                Ok(0) => {
                    warn!("[{}] config warning - delimiter is zero, using default", self.base.category);
                    DEFAULT_DELIMITER
                }
                Ok(delimiter) => delimiter,
                Err(_) => {
                    warn!(
                        "[{}] config warning - delimiter is too large to fit in a char, using default",
                        self.base.category
                    );
                    DEFAULT_DELIMITER
                }
            };
            bucket_conf.set_unsigned("delimiter", u64::from(self.delimiter));
        }

        if conf.get_flag("remove_key") == Some(true) {
            self.remove_key = true;
            if self.bucket_type == BucketType::ContextLog {
                return Err(
                    "Bad config - bucketizer store of type context_log do not support remove_key"
                        .to_string(),
                );
            }
        }

        let store_type = bucket_conf
            .get_string("type")
            .ok_or("Bad config - store contained in a bucket store must have a type")?
            .to_string();

        let file_layout = if store_type == StoreType::File.as_str() {
            let subdir = conf
                .get_string("bucket_subdir")
                .ok_or("Bad config - bucketizer containing file stores must have a bucket_subdir")?;
            let path = bucket_conf
                .get_string("file_path")
                .ok_or("Bad config - file store contained by bucketizer must have a file_path")?;
            Some((path.to_string(), subdir.to_string()))
        } else {
            None
        };

        for i in 0..=self.num_buckets {
            let mut bucket = create_store(
                &store_type,
                &self.base.category,
                false,
                self.base.multi_category,
                &self.ctx,
            )
            .map_err(|e| format!("Bad config - can't create store of type: {store_type} ({e})"))?;

            if let Some((path, subdir)) = &file_layout {
                bucket_conf.set_string("file_path", format!("{path}/{subdir}{i:03}"));
            }
            bucket.configure(&bucket_conf);
            self.buckets.push(bucket);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for BucketStore {
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
        Box::new(BucketStore {
            base: self.base.copy_for(category),
            ctx: self.ctx.clone(),
            bucket_type: self.bucket_type,
            delimiter: self.delimiter,
            remove_key: self.remove_key,
            opened: false,
            num_buckets: self.num_buckets,
            buckets: self.buckets.iter().map(|bucket| bucket.copy(category)).collect(),
        })
    }

    fn configure(&mut self, conf: &StoreConf) {
        self.buckets.clear();
        if let Err(msg) = self.configure_buckets(conf) {
            error!("[{}] {}", self.base.category, msg);
            self.base.set_status(msg);
            self.num_buckets = 0;
            self.buckets.clear();
        }
        self.base.configured = true;
    }

    async fn open(&mut self) -> bool {
        if !self.base.check_configured() {
            return false;
        }
        if self.num_buckets == 0 || self.buckets.len() as u64 != self.num_buckets + 1 {
            error!(
                "[{}] Can't open bucket store with <{}> of <{}> buckets",
                self.base.category,
                self.buckets.len(),
                self.num_buckets
            );
            return false;
        }

        for bucket in &mut self.buckets {
            if !bucket.open().await {
                self.close().await;
                return false;
            }
        }
        self.opened = true;
        true
    }

    fn is_open(&self) -> bool {
        self.opened
    }

    async fn close(&mut self) {
        for bucket in &mut self.buckets {
            bucket.close().await;
        }
        self.opened = false;
    }

    async fn handle_messages(&mut self, messages: &mut Vec<LogEntry>) -> bool {
        if !self.opened {
            error!(
                "[{}] Logic error: BucketStore::handle_messages called on closed store",
                self.base.category
            );
            return false;
        }

        let mut failed = Vec::new();
        for entry in messages.iter() {
            let bucket = self.bucketize(&entry.message);
            let mut single = vec![if self.remove_key {
                LogEntry {
                    category: entry.category.clone(),
                    message: self.message_without_key(&entry.message).to_vec(),
                }
            } else {
                entry.clone()
            }];

            let handled = match self.buckets.get_mut(bucket as usize) {
                Some(store) => store.handle_messages(&mut single).await,
                None => false,
            };
            if !handled {
                error!(
                    "[{}] Failed to write a message to bucket <{}>",
                    self.base.category, bucket
                );
                self.base.set_status(BUCKET_WRITE_ERROR);
                failed.push(entry.clone());
            }
        }

        if failed.is_empty() {
            if self.base.status == BUCKET_WRITE_ERROR {
                self.base.set_status("");
            }
            messages.clear();
            true
        } else {
            *messages = failed;
            false
        }
    }

    async fn periodic_check(&mut self) {
        for bucket in &mut self.buckets {
            bucket.periodic_check().await;
        }
    }

    async fn flush(&mut self) {
        for bucket in &mut self.buckets {
            bucket.flush().await;
        }
    }

    fn status(&self) -> String {
        if !self.base.status.is_empty() {
            return self.base.status.clone();
        }
        self.buckets
            .iter()
            .map(|bucket| bucket.status())
            .find(|status| !status.is_empty())
            .unwrap_or_default()
    }
}
