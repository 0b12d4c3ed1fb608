// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Nested `key=value` configuration blocks.
//!
//! ```text
//! port=1463
//! <store>
//!   category=default
//!   type=buffer
//!   <primary>
//!     type=network
//!     remote_host=central
//!   </primary>
//! </store>
//! ```
//!
//! Top-level blocks named `store` are renamed `store0`, `store1`, ... in the
//! order they appear. Lines are trimmed and `#` starts a comment line.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfError {
    #[error("Failed to open config file <{path}>: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreConf {
    values: BTreeMap<String, String>,
    stores: BTreeMap<String, Arc<StoreConf>>,
}

impl StoreConf {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and parses a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// Parses configuration text. Malformed lines are logged and skipped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut lines = text.lines();
        let mut conf = StoreConf::default();
        conf.parse_block(&mut lines, true);
        conf
    }

    fn parse_block<'a>(&mut self, lines: &mut impl Iterator<Item = &'a str>, top_level: bool) {
        let mut store_index = 0;
        while let Some(raw) = lines.next() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('<') {
                if rest.starts_with('/') {
                    return;
                }
                let Some(end) = rest.find('>') else {
                    warn!("Bad config - line {} has a < but not a >", line);
                    continue;
                };
                let mut name = rest[..end].trim().to_string();
                let mut block = StoreConf::default();
                block.parse_block(lines, false);
                if top_level && name == "store" {
                    name = format!("store{store_index}");
                    store_index += 1;
                }
                if self.stores.contains_key(&name) {
                    warn!("Bad config - duplicate store name {}", name);
                }
                self.stores.insert(name, Arc::new(block));
                continue;
            }

            match line.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if self.values.contains_key(key) {
                        warn!("Bad config - duplicate key {}", key);
                    }
                    self.values.insert(key.to_string(), value.trim().to_string());
                }
                None => warn!("Bad config - line {} is missing an =", line),
            }
        }
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Every `key=value` pair of this block, ordered by key.
    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Unsigned value with C `strtoul` base-0 semantics.
    pub fn get_unsigned(&self, key: &str) -> Option<u64> {
        self.get_string(key).map(|value| {
            let (negative, magnitude) = parse_c_integer(value);
            if negative {
                magnitude.wrapping_neg()
            } else {
                magnitude
            }
        })
    }

    /// Signed value with C `strtol` base-0 semantics.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get_string(key).map(|value| {
            let (negative, magnitude) = parse_c_integer(value);
            let magnitude = i64::try_from(magnitude).unwrap_or(i64::MAX);
            if negative {
                -magnitude
            } else {
                magnitude
            }
        })
    }

    /// `yes`/`no` flag; anything other than `yes` reads as false.
    pub fn get_flag(&self, key: &str) -> Option<bool> {
        self.get_string(key).map(|value| value == "yes")
    }

    pub fn get_store(&self, name: &str) -> Option<Arc<StoreConf>> {
        self.stores.get(name).cloned()
    }

    /// All sub-blocks, ordered by name.
    pub fn get_all_stores(&self) -> Vec<(String, Arc<StoreConf>)> {
        self.stores
            .iter()
            .map(|(name, conf)| (name.clone(), Arc::clone(conf)))
            .collect()
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn set_unsigned(&mut self, key: impl Into<String>, value: u64) {
        self.set_string(key, value.to_string());
    }

    pub fn set_store(&mut self, name: impl Into<String>, conf: StoreConf) {
        self.stores.insert(name.into(), Arc::new(conf));
    }

    /// Builder helper for programmatic configuration.
    #[must_use]
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set_string(key, value);
        self
    }

    /// Builder helper for programmatic configuration.
    #[must_use]
    pub fn with_store(mut self, name: &str, conf: StoreConf) -> Self {
        self.set_store(name, conf);
        self
    }
}

/// Leading integer of `value` the way C's base-0 parsers read it: optional
/// sign, `0x` for hex, a leading `0` for octal, and trailing junk ignored.
fn parse_c_integer(value: &str) -> (bool, u64) {
    let mut rest = value.trim_start();
    let mut negative = false;
    if let Some(stripped) = rest.strip_prefix('-') {
        negative = true;
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped;
    }

    let (radix, digits) = if let Some(hex) = rest
        .strip_prefix("0x")
        .or_else(|| rest.strip_prefix("0X"))
        .filter(|hex| hex.starts_with(|c: char| c.is_ascii_hexdigit()))
    {
        (16, hex)
    } else if rest.len() > 1 && rest.starts_with('0') {
        (8, &rest[1..])
    } else {
        (10, rest)
    };

    let mut result: u64 = 0;
    for digit in digits.chars().map_while(|c| c.to_digit(radix)) {
        result = result
            .saturating_mul(u64::from(radix))
            .saturating_add(u64::from(digit));
    }
    (negative, result)
}
