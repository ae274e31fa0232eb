// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for convoy-core integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use convoy_core::{KvSnapshot, ResourceHandler};

/// One callback observed by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Added(String, u64),
    Updated(String, u64, u64),
    Deleted(String),
}

/// Handler that records every successful callback and can be told to fail.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
    failing_adds: AtomicUsize,
    failing_deletes: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `on_add` calls fail.
    pub fn fail_next_adds(&self, n: usize) {
        self.failing_adds.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` `on_delete` calls fail.
    pub fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn added(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Added(key, _) => Some(key),
                _ => None,
            })
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Deleted(key) => Some(key),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ResourceHandler for RecordingHandler {
    async fn on_add(&self, kv: &KvSnapshot) -> anyhow::Result<()> {
        if take_failure(&self.failing_adds) {
            anyhow::bail!("injected add failure for {}", kv.key);
        }
        self.push(Event::Added(kv.key.clone(), kv.version));
        Ok(())
    }

    async fn on_update(&self, kv: &KvSnapshot, previous_version: u64) -> anyhow::Result<()> {
        self.push(Event::Updated(kv.key.clone(), previous_version, kv.version));
        Ok(())
    }

    async fn on_delete(&self, key: &str) -> anyhow::Result<()> {
        if take_failure(&self.failing_deletes) {
            anyhow::bail!("injected delete failure for {}", key);
        }
        self.push(Event::Deleted(key.to_string()));
        Ok(())
    }
}

/// Poll `check` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
