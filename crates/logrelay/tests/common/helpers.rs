// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use logrelay::conf::StoreConf;
use logrelay::LogEntry;
use std::path::Path;
use std::time::Duration;

/// Top-level config holding `stores` as store0, store1, ...
pub fn router_conf(stores: Vec<StoreConf>) -> StoreConf {
    stores
        .into_iter()
        .enumerate()
        .fold(StoreConf::new(), |conf, (i, store)| {
            conf.with_store(&format!("store{i}"), store)
        })
}

pub fn entries(category: &str, messages: &[&str]) -> Vec<LogEntry> {
    messages
        .iter()
        .map(|message| LogEntry::new(category, *message))
        .collect()
}

pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Split a file written with 4-byte little-endian length prefixes
pub fn read_framed_records(path: impl AsRef<Path>) -> Vec<Vec<u8>> {
    let data = std::fs::read(path.as_ref()).expect("Failed to read store file");
    let mut records = Vec::new();
    let mut rest = data.as_slice();
    while rest.len() >= 4 {
        let (len, tail) = rest.split_at(4);
        let len = u32::from_le_bytes(len.try_into().unwrap()) as usize;
        if len == 0 || tail.len() < len {
            break;
        }
        records.push(tail[..len].to_vec());
        rest = &tail[len..];
    }
    records
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
