// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The trait implemented by remote cache clients.

use std::collections::HashMap;

use crate::{Entry, Result};

/// A network-accessed key/value cache.
///
/// Implementations are shared between concurrent callers and must tolerate concurrent
/// invocation. Every method may block on network I/O; timeouts and retries belong to the
/// implementation. Keys are already normalized when they reach this trait.
///
/// The store is assumed eventually consistent per key, with no cross-key atomicity.
pub trait RemoteStore: Send + Sync {
    /// Reads one entry; `None` when the key is missing or expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Entry>>> + Send;

    /// Reads several entries in one round trip. Missing keys are silently absent from the
    /// returned map.
    ///
    /// The default implementation issues one [`get`](Self::get) per key; clients with a
    /// batched protocol command should override it.
    fn get_multi(&self, keys: &[String]) -> impl Future<Output = Result<HashMap<String, Entry>>> + Send {
        async move {
            let mut found = HashMap::with_capacity(keys.len());
            for key in keys {
                if let Some(entry) = self.get(key).await? {
                    found.insert(key.clone(), entry);
                }
            }
            Ok(found)
        }
    }

    /// Stores an entry, applying [`Entry::ttl`]. Returns whether the store accepted it.
    fn set(&self, key: &str, entry: Entry) -> impl Future<Output = Result<bool>> + Send;

    /// Removes an entry. Returns whether an entry was removed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Atomically adds `amount` to a decimal counter and returns the new count, or `None`
    /// if the key does not exist.
    fn increment(&self, key: &str, amount: u64) -> impl Future<Output = Result<Option<u64>>> + Send;

    /// Atomically subtracts `amount` from a decimal counter, saturating at zero, and returns
    /// the new count, or `None` if the key does not exist.
    fn decrement(&self, key: &str, amount: u64) -> impl Future<Output = Result<Option<u64>>> + Send;

    /// Removes every entry.
    fn clear(&self) -> impl Future<Output = Result<bool>> + Send;
}
