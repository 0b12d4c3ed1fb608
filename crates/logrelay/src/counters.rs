// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named counters shared by the router, queues and stores.
//!
//! A single [`Counters`] value is created by the owner of the router and
//! passed down by `Arc`, so tests can observe counts in isolation.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    ReceivedGood,
    ReceivedBad,
    ReceivedBlankCategory,
    DeniedForRate,
    DeniedForQueueSize,
    InvalidRequests,
    Lost,
    Retries,
    Sent,
}

impl Counter {
    pub const ALL: [Counter; 9] = [
        Counter::ReceivedGood,
        Counter::ReceivedBad,
        Counter::ReceivedBlankCategory,
        Counter::DeniedForRate,
        Counter::DeniedForQueueSize,
        Counter::InvalidRequests,
        Counter::Lost,
        Counter::Retries,
        Counter::Sent,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Counter::ReceivedGood => "received good",
            Counter::ReceivedBad => "received bad",
            Counter::ReceivedBlankCategory => "received blank category",
            Counter::DeniedForRate => "denied for rate",
            Counter::DeniedForQueueSize => "denied for queue size",
            Counter::InvalidRequests => "invalid requests",
            Counter::Lost => "lost",
            Counter::Retries => "retries",
            Counter::Sent => "sent",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    values: [AtomicU64; 9],
}

/// Point-in-time copy of every counter, keyed by display name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CountersSnapshot(BTreeMap<&'static str, u64>);

impl CountersSnapshot {
    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.0.get(counter.as_str()).copied().unwrap_or(0)
    }
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, amount: u64) {
        if amount > 0 {
            self.values[counter.index()].fetch_add(amount, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot(
            Counter::ALL
                .iter()
                .map(|counter| (counter.as_str(), self.get(*counter)))
                .collect(),
        )
    }
}
