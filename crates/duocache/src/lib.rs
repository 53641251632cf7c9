// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A two-tier read-through cache client.
//!
//! A [`TwoTierStore`] sits in front of a shared remote key/value store (any
//! [`RemoteStore`]) and adds an optional process-local overlay that lives for one unit of
//! work. Within that activation, repeated reads of a key cost one round trip, misses are
//! remembered, and concurrent fetches of the same key run their producer once.
//!
//! The crate provides:
//! - Structured values through a pluggable [`Codec`] and raw string values for counters
//! - Batched reads, atomic counters and optional payload compression
//! - Canonical keys built from strings, numbers, sequences and maps via [`CacheKey`]
//! - Stale-while-revalidate fetches that serve an expired value while one caller
//!   regenerates it
//! - A silenced mode in which remote failures read as misses
//! - Per-operation events, optionally logged with `tracing` or recorded as OpenTelemetry
//!   metrics
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use duocache::{Options, TwoTierStore, Value};
//! use duocache_remote::testing::MockRemote;
//! use tick::Clock;
//! # futures::executor::block_on(async {
//!
//! let clock = Clock::new_frozen();
//! let store = TwoTierStore::builder(MockRemote::new(clock.clone()), clock)
//!     .defaults(Options::new().expires_in(Duration::from_secs(60)))
//!     .build();
//!
//! let profile = store
//!     .with_local_overlay(|scope| async move {
//!         scope.write(&("user", 7), "ada", &Options::new()).await?;
//!         // Answered from the overlay without a second round trip.
//!         scope.read::<String, _>(&("user", 7), &Options::new()).await
//!     })
//!     .await?;
//! assert_eq!(profile, Some(Value::Structured("ada".to_string())));
//!
//! store.write_raw("visits", 0, &Options::new()).await?;
//! assert_eq!(store.increment("visits", 1).await?, Some(1));
//! # Ok::<(), duocache::Error>(())
//! # });
//! ```

pub mod builder;
mod codec;
mod guard;
mod key;
mod options;
mod overlay;
mod store;
mod telemetry;
mod value;

#[doc(inline)]
pub use builder::StoreBuilder;
#[doc(inline)]
pub use codec::{Codec, PostcardCodec};
#[doc(inline)]
pub use duocache_remote::{Entry, Error, ErrorKind, Flags, RemoteStore, Result};
#[doc(inline)]
pub use key::{CacheKey, MAX_KEY_LENGTH, remote_key};
#[doc(inline)]
pub use options::{DEFAULT_COMPRESS_THRESHOLD, Options};
#[doc(inline)]
pub use store::{Scope, TwoTierStore};
#[doc(inline)]
pub use telemetry::{CacheActivity, CacheEvent, CacheName, CacheOperation};
#[doc(inline)]
pub use value::Value;
