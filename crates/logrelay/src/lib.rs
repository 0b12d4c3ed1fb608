// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logrelay
//!
//! Store engine for a category-routed log forwarding daemon.
//!
//! Clients hand batches of [`LogEntry`] values to the [`router::Router`], which
//! resolves every category to one or more [`store_queue::StoreQueue`] workers.
//! Each worker owns exactly one [`store::Store`] and batches pending messages
//! into it on size or time thresholds.
//!
//! ```text
//!   Log(batch) ──► Router ──► StoreQueue (one task per category)
//!                                  │
//!                                  ▼
//!                      Store: file | buffer | network | bucket
//!                             | multi | category | multifile | null
//!                                  │
//!                    FileInterface ┴ ConnPool ──► downstream forwarder
//! ```
//!
//! Configuration is read through [`conf::StoreConf`], cross-component counters
//! through [`counters::Counters`], and logical service names are resolved by a
//! [`membership::ServiceResolver`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod conf;
pub mod conn_pool;
pub mod counters;
pub mod entry;
pub mod file;
pub mod membership;
pub mod router;
pub mod store;
pub mod store_queue;
pub mod wire;

pub use entry::{LogEntry, ResultCode};
