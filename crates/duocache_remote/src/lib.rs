// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! The remote-tier seam for `duocache`.
//!
//! This crate defines the [`RemoteStore`] trait that a network cache client must satisfy,
//! along with the [`Entry`] container exchanged with it and the [`Error`] type shared by
//! every `duocache` crate.
//!
//! # Overview
//!
//! The remote tier is treated as an opaque, memcached-like key/value service: it stores
//! byte payloads tagged with [`Flags`], expires them after an optional TTL, and offers
//! atomic counters. Connection management, server selection, retries and timeouts are the
//! implementation's business; `duocache` layers the process-local overlay, value
//! representation rules and stale-while-revalidate fetches on top.
//!
//! Keys handed to a [`RemoteStore`] are already canonicalized and escaped, and never
//! exceed 250 bytes.
//!
//! # Implementing a Remote Store
//!
//! ```
//! use std::collections::HashMap;
//! use std::sync::RwLock;
//!
//! use duocache_remote::{Entry, RemoteStore, Result};
//!
//! struct Simple(RwLock<HashMap<String, Entry>>);
//!
//! impl RemoteStore for Simple {
//!     async fn get(&self, key: &str) -> Result<Option<Entry>> {
//!         Ok(self.0.read().unwrap().get(key).cloned())
//!     }
//!
//!     async fn set(&self, key: &str, entry: Entry) -> Result<bool> {
//!         self.0.write().unwrap().insert(key.to_string(), entry);
//!         Ok(true)
//!     }
//!
//!     async fn delete(&self, key: &str) -> Result<bool> {
//!         Ok(self.0.write().unwrap().remove(key).is_some())
//!     }
//!
//!     async fn increment(&self, _key: &str, _amount: u64) -> Result<Option<u64>> {
//!         Ok(None)
//!     }
//!
//!     async fn decrement(&self, _key: &str, _amount: u64) -> Result<Option<u64>> {
//!         Ok(None)
//!     }
//!
//!     async fn clear(&self) -> Result<bool> {
//!         self.0.write().unwrap().clear();
//!         Ok(true)
//!     }
//! }
//! ```

mod entry;
pub mod error;
mod store;
#[cfg(any(feature = "test-util", test))]
pub mod testing;

#[doc(inline)]
pub use entry::{Entry, Flags};
#[doc(inline)]
pub use error::{Error, ErrorKind, Result};
#[doc(inline)]
pub use store::RemoteStore;
