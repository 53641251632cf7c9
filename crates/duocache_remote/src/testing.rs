// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock remote tier for testing.
//!
//! This module provides `MockRemote`, an in-memory store with memcached semantics that
//! records all operations and supports failure injection for testing error paths.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use tick::Clock;

use crate::{Entry, Error, ErrorKind, Flags, RemoteStore, Result};

/// Recorded remote operation with full context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    /// A single-key read.
    Get(String),
    /// A batched read of the given keys.
    GetMulti(Vec<String>),
    /// A write of the given entry.
    Set {
        /// The key that was written.
        key: String,
        /// The entry that was written.
        entry: Entry,
    },
    /// A delete of the given key.
    Delete(String),
    /// A counter increment.
    Increment {
        /// The counter key.
        key: String,
        /// The requested delta.
        amount: u64,
    },
    /// A counter decrement.
    Decrement {
        /// The counter key.
        key: String,
        /// The requested delta.
        amount: u64,
    },
    /// A wholesale clear.
    Clear,
}

type FailPredicate = Box<dyn Fn(&RemoteOp) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
struct Stored {
    entry: Entry,
    expires_at: Option<SystemTime>,
}

/// A configurable in-memory remote tier for testing.
///
/// Entries expire according to their TTL as measured by the supplied [`Clock`], so tests
/// can drive expiry with `tick::ClockControl`. Counters follow memcached rules: they
/// operate on decimal text, increments wrap and decrements saturate at zero.
///
/// # Examples
///
/// ```
/// use duocache_remote::{Entry, RemoteStore, testing::{MockRemote, RemoteOp}};
/// use tick::Clock;
///
/// # futures::executor::block_on(async {
/// let remote = MockRemote::new(Clock::new_frozen());
///
/// remote.set("key", Entry::raw("1")).await?;
/// assert_eq!(remote.increment("key", 2).await?, Some(3));
///
/// assert_eq!(remote.operations()[1], RemoteOp::Increment { key: "key".to_string(), amount: 2 });
/// # Ok::<(), duocache_remote::Error>(())
/// # });
/// ```
///
/// # Failure Injection
///
/// ```
/// use duocache_remote::{RemoteStore, testing::{MockRemote, RemoteOp}};
/// use tick::Clock;
///
/// # futures::executor::block_on(async {
/// let remote = MockRemote::new(Clock::new_frozen());
///
/// remote.fail_when(|op| matches!(op, RemoteOp::Get(key) if key == "forbidden"));
/// assert!(remote.get("forbidden").await.is_err());
/// assert!(remote.get("allowed").await.is_ok());
/// # });
/// ```
pub struct MockRemote {
    clock: Clock,
    data: Arc<Mutex<HashMap<String, Stored>>>,
    operations: Arc<Mutex<Vec<RemoteOp>>>,
    fail_when: Arc<Mutex<Option<FailPredicate>>>,
}

impl std::fmt::Debug for MockRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRemote")
            .field("data", &self.data)
            .field("operations", &self.operations)
            .field("fail_when", &self.fail_when.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl Clone for MockRemote {
    fn clone(&self) -> Self {
        Self {
            clock: self.clock.clone(),
            data: Arc::clone(&self.data),
            operations: Arc::clone(&self.operations),
            fail_when: Arc::clone(&self.fail_when),
        }
    }
}

impl MockRemote {
    /// Creates an empty remote tier whose TTLs are measured with `clock`.
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            data: Arc::new(Mutex::new(HashMap::new())),
            operations: Arc::new(Mutex::new(Vec::new())),
            fail_when: Arc::new(Mutex::new(None)),
        }
    }

    /// Sets a predicate that decides which operations fail with
    /// [`ErrorKind::RemoteUnavailable`].
    ///
    /// Failed operations are still recorded.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&RemoteOp) -> bool + Send + Sync + 'static,
    {
        *self.fail_when.lock() = Some(Box::new(predicate));
    }

    /// Clears the failure predicate, allowing all operations to succeed.
    pub fn clear_failures(&self) {
        *self.fail_when.lock() = None;
    }

    /// Returns a clone of all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<RemoteOp> {
        self.operations.lock().clone()
    }

    /// Clears all recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().clear();
    }

    /// Returns how many recorded operations match the predicate.
    #[must_use]
    pub fn count_operations(&self, predicate: impl Fn(&RemoteOp) -> bool) -> usize {
        self.operations.lock().iter().filter(|op| predicate(op)).count()
    }

    /// Returns the stored entry without recording an operation, if present and unexpired.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<Entry> {
        let now = self.clock.system_time();
        self.data
            .lock()
            .get(key)
            .filter(|stored| !is_expired(stored, now))
            .map(|stored| stored.entry.clone())
    }

    /// Returns the number of unexpired entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        let now = self.clock.system_time();
        self.data.lock().values().filter(|stored| !is_expired(stored, now)).count()
    }

    fn record(&self, op: RemoteOp) -> Result<()> {
        let fail = self.fail_when.lock().as_ref().is_some_and(|predicate| predicate(&op));
        let name = op_name(&op);
        self.operations.lock().push(op);
        if fail {
            return Err(Error::caused_by(ErrorKind::RemoteUnavailable, format!("mock: {name} failed")));
        }
        Ok(())
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let now = self.clock.system_time();
        let mut data = self.data.lock();
        match data.get(key) {
            Some(stored) if is_expired(stored, now) => {
                data.remove(key);
                None
            }
            Some(stored) => Some(stored.entry.clone()),
            None => None,
        }
    }

    fn adjust(&self, key: &str, apply: impl FnOnce(u64) -> u64) -> Result<Option<u64>> {
        let now = self.clock.system_time();
        let mut data = self.data.lock();
        let Some(stored) = data.get_mut(key).filter(|stored| !is_expired(stored, now)) else {
            return Ok(None);
        };

        if stored.entry.flags().contains(Flags::COMPRESSED) {
            return Err(Error::caused_by(ErrorKind::CorruptValue, "cannot adjust a compressed value"));
        }
        let current = std::str::from_utf8(stored.entry.payload())
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::caused_by(ErrorKind::CorruptValue, "cannot increment or decrement non-numeric value"))?;

        let next = apply(current);
        stored.entry.set_payload(next.to_string());
        Ok(Some(next))
    }
}

fn is_expired(stored: &Stored, now: SystemTime) -> bool {
    stored.expires_at.is_some_and(|expires_at| now >= expires_at)
}

fn expiry(now: SystemTime, ttl: Option<Duration>) -> Option<SystemTime> {
    ttl.filter(|ttl| !ttl.is_zero()).and_then(|ttl| now.checked_add(ttl))
}

fn op_name(op: &RemoteOp) -> &'static str {
    match op {
        RemoteOp::Get(_) => "get",
        RemoteOp::GetMulti(_) => "get_multi",
        RemoteOp::Set { .. } => "set",
        RemoteOp::Delete(_) => "delete",
        RemoteOp::Increment { .. } => "increment",
        RemoteOp::Decrement { .. } => "decrement",
        RemoteOp::Clear => "clear",
    }
}

impl RemoteStore for MockRemote {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        self.record(RemoteOp::Get(key.to_string()))?;
        Ok(self.live(key))
    }

    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Entry>> {
        self.record(RemoteOp::GetMulti(keys.to_vec()))?;
        Ok(keys
            .iter()
            .filter_map(|key| self.live(key).map(|entry| (key.clone(), entry)))
            .collect())
    }

    async fn set(&self, key: &str, entry: Entry) -> Result<bool> {
        self.record(RemoteOp::Set {
            key: key.to_string(),
            entry: entry.clone(),
        })?;
        let expires_at = expiry(self.clock.system_time(), entry.ttl());
        self.data.lock().insert(key.to_string(), Stored { entry, expires_at });
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.record(RemoteOp::Delete(key.to_string()))?;
        let now = self.clock.system_time();
        Ok(self.data.lock().remove(key).is_some_and(|stored| !is_expired(&stored, now)))
    }

    async fn increment(&self, key: &str, amount: u64) -> Result<Option<u64>> {
        self.record(RemoteOp::Increment {
            key: key.to_string(),
            amount,
        })?;
        self.adjust(key, |current| current.wrapping_add(amount))
    }

    async fn decrement(&self, key: &str, amount: u64) -> Result<Option<u64>> {
        self.record(RemoteOp::Decrement {
            key: key.to_string(),
            amount,
        })?;
        self.adjust(key, |current| current.saturating_sub(amount))
    }

    async fn clear(&self) -> Result<bool> {
        self.record(RemoteOp::Clear)?;
        self.data.lock().clear();
        Ok(true)
    }
}
