// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The two-tier store and its scope handle.

use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Debug, Display},
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use serde::{Serialize, de::DeserializeOwned};
use tick::Clock;

use crate::{
    CacheKey, Entry, Error, ErrorKind, Flags, Options, RemoteStore, Result, Value,
    builder::StoreBuilder,
    codec::{self, Codec, PostcardCodec},
    guard::{Claims, Envelope},
    key::remote_key,
    options::Settings,
    overlay::{LocalOverlay, Lookup, Resolved},
    telemetry::{
        CacheActivity, CacheOperation, Telemetry,
        ext::{ClockExt, TimedResult},
    },
};

/// A read-through cache client layering a process-local overlay over a remote store.
///
/// Operations called directly on the store go straight to the remote tier. Operations
/// called on the [`Scope`] handed out by [`with_local_overlay`](Self::with_local_overlay)
/// consult a private overlay first, so repeated lookups within one unit of work (one
/// request, one batch job) cost a single round trip per key.
///
/// Values are stored in one of two representations. Structured values go through the
/// store's [`Codec`]; raw values are stored as their text. A raw read always returns the
/// stored bytes, so reading a structured value in raw mode yields the codec's bytes, and a
/// structured read of a raw-written value yields [`Value::Raw`].
///
/// In silenced mode remote failures read as misses. That makes an unreachable remote tier
/// indistinguishable from an empty one; the failures are still reported as
/// [`CacheActivity::Error`] events.
///
/// # Examples
///
/// ```
/// use duocache::{Options, TwoTierStore, Value};
/// use duocache_remote::testing::MockRemote;
/// use tick::Clock;
///
/// # futures::executor::block_on(async {
/// let clock = Clock::new_frozen();
/// let store = TwoTierStore::builder(MockRemote::new(clock.clone()), clock).build();
///
/// store.write("answer", &42_u32, &Options::new()).await?;
/// let value = store.read::<u32, _>("answer", &Options::new()).await?;
/// assert_eq!(value, Some(Value::Structured(42)));
///
/// let total = store
///     .with_local_overlay(|scope| async move {
///         let first = scope.fetch("total", &Options::new(), || async { 7_u64 }).await?;
///         let again = scope.fetch("total", &Options::new(), || async { 8_u64 }).await?;
///         assert_eq!(first, again);
///         Ok::<_, duocache::Error>(first)
///     })
///     .await?;
/// assert_eq!(total, Value::Structured(7));
/// # Ok::<(), duocache::Error>(())
/// # });
/// ```
pub struct TwoTierStore<R, C = PostcardCodec> {
    pub(crate) remote: R,
    pub(crate) codec: C,
    pub(crate) clock: Clock,
    pub(crate) defaults: Options,
    pub(crate) silence: bool,
    pub(crate) telemetry: Telemetry,
    pub(crate) claims: Claims,
}

impl<R, C> Debug for TwoTierStore<R, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoTierStore")
            .field("name", &self.telemetry.name())
            .field("defaults", &self.defaults)
            .field("silence", &self.silence)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteStore> TwoTierStore<R> {
    /// Creates a builder for a store in front of `remote`.
    ///
    /// The clock is the time source for stale-guard expiry and operation timing.
    #[must_use]
    pub fn builder(remote: R, clock: Clock) -> StoreBuilder<R> {
        StoreBuilder::new(remote, clock)
    }
}

impl<R, C> TwoTierStore<R, C>
where
    R: RemoteStore,
    C: Codec,
{
    /// Returns the remote tier.
    #[must_use]
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Returns the store's clock.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Returns a handle that runs operations without a local overlay.
    #[must_use]
    pub fn detached(&self) -> Scope<'_, R, C> {
        Scope {
            store: self,
            overlay: None,
        }
    }

    /// Runs `work` with a fresh local overlay and returns its output.
    ///
    /// The overlay is shared by every clone of the [`Scope`] passed to `work` and is
    /// discarded when the work completes, fails, panics or is dropped. Nothing cached in it
    /// is visible to other activations.
    pub async fn with_local_overlay<'s, F, Fut, T>(&'s self, work: F) -> T
    where
        F: FnOnce(Scope<'s, R, C>) -> Fut,
        Fut: Future<Output = T>,
    {
        let overlay = Arc::new(LocalOverlay::new());
        let _teardown = Teardown(Arc::clone(&overlay));
        work(Scope {
            store: self,
            overlay: Some(overlay),
        })
        .await
    }

    /// Reads a value. See [`Scope::read`].
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if the stored
    /// bytes cannot be decoded.
    pub async fn read<V, K>(&self, key: &K, options: &Options) -> Result<Option<Value<V>>>
    where
        V: DeserializeOwned,
        K: CacheKey + ?Sized,
    {
        self.detached().read(key, options).await
    }

    /// Writes a structured value. See [`Scope::write`].
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized, or if the remote tier fails
    /// outside silenced mode.
    pub async fn write<K, V>(&self, key: &K, value: &V, options: &Options) -> Result<bool>
    where
        K: CacheKey + ?Sized,
        V: Serialize + ?Sized,
    {
        self.detached().write(key, value, options).await
    }

    /// Writes a value as raw text. See [`Scope::write_raw`].
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode.
    pub async fn write_raw<K, T>(&self, key: &K, value: T, options: &Options) -> Result<bool>
    where
        K: CacheKey + ?Sized,
        T: Display,
    {
        self.detached().write_raw(key, value, options).await
    }

    /// Reads several keys in one round trip. See [`Scope::read_multi`].
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if any stored
    /// value cannot be decoded.
    pub async fn read_multi<V, K>(&self, keys: &[K], options: &Options) -> Result<HashMap<String, Value<V>>>
    where
        V: DeserializeOwned,
        K: CacheKey,
    {
        self.detached().read_multi(keys, options).await
    }

    /// Reads a value or computes and writes it. See [`Scope::fetch`].
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if a value cannot
    /// be encoded or decoded.
    pub async fn fetch<V, K, F, Fut>(&self, key: &K, options: &Options, producer: F) -> Result<Value<V>>
    where
        V: Serialize + DeserializeOwned,
        K: CacheKey + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        self.detached().fetch(key, options, producer).await
    }

    /// Reads raw bytes or computes and writes them. See [`Scope::fetch_raw`].
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if a stored value
    /// cannot be decompressed.
    pub async fn fetch_raw<K, F, Fut, T>(&self, key: &K, options: &Options, producer: F) -> Result<Vec<u8>>
    where
        K: CacheKey + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        T: Display,
    {
        self.detached().fetch_raw(key, options, producer).await
    }

    /// Increments a counter. See [`Scope::increment`].
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if the stored
    /// value is not a counter.
    pub async fn increment<K: CacheKey + ?Sized>(&self, key: &K, amount: u64) -> Result<Option<u64>> {
        self.detached().increment(key, amount).await
    }

    /// Decrements a counter. See [`Scope::decrement`].
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if the stored
    /// value is not a counter.
    pub async fn decrement<K: CacheKey + ?Sized>(&self, key: &K, amount: u64) -> Result<Option<u64>> {
        self.detached().decrement(key, amount).await
    }

    /// Deletes a key. See [`Scope::delete`].
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode.
    pub async fn delete<K: CacheKey + ?Sized>(&self, key: &K) -> Result<bool> {
        self.detached().delete(key).await
    }

    /// Checks whether a key exists. See [`Scope::exist`].
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode.
    pub async fn exist<K: CacheKey + ?Sized>(&self, key: &K) -> Result<bool> {
        self.detached().exist(key).await
    }

    /// Clears the remote tier. See [`Scope::clear`].
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode.
    pub async fn clear(&self) -> Result<bool> {
        self.detached().clear().await
    }
}

struct Teardown(Arc<LocalOverlay>);

impl Drop for Teardown {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// A handle for running operations within one activation.
///
/// A scope created by [`TwoTierStore::with_local_overlay`] consults and maintains that
/// activation's overlay; one created by [`TwoTierStore::detached`] has none. Cloning a scope
/// shares its overlay, so cooperating futures of one unit of work see the same local
/// state. Once the activation ends the overlay is gone and the scope behaves as detached.
pub struct Scope<'a, R, C = PostcardCodec> {
    store: &'a TwoTierStore<R, C>,
    overlay: Option<Arc<LocalOverlay>>,
}

impl<R, C> Clone for Scope<'_, R, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store,
            overlay: self.overlay.clone(),
        }
    }
}

impl<R, C> Debug for Scope<'_, R, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("store", &self.store)
            .field("overlay", &self.overlay)
            .finish()
    }
}

/// The outcome of resolving a fetch before it is turned into a caller value.
pub(crate) struct Fetched<T> {
    pub entry: Entry,
    pub produced: Option<T>,
    pub activity: CacheActivity,
}

impl<T> Fetched<T> {
    pub fn cached(entry: Entry, activity: CacheActivity) -> Self {
        Self {
            entry,
            produced: None,
            activity,
        }
    }
}

/// Turns a produced value into a logical payload and its flags.
pub(crate) type Encoder<'e, T> = &'e (dyn Fn(&T) -> Result<(Vec<u8>, Flags)> + Sync);

impl<'a, R, C> Scope<'a, R, C>
where
    R: RemoteStore,
    C: Codec,
{
    /// Returns the store this scope belongs to.
    #[must_use]
    pub fn store(&self) -> &'a TwoTierStore<R, C> {
        self.store
    }

    /// Returns `true` while this scope has a live local overlay.
    #[must_use]
    pub fn has_local_overlay(&self) -> bool {
        self.overlay().is_some()
    }

    /// Reads a value.
    ///
    /// A key the overlay already knows about, present or absent, is answered locally.
    /// Otherwise the remote tier is asked and the answer, including absence, is recorded in
    /// the overlay. With [`Options::raw`] the stored bytes are returned as [`Value::Raw`];
    /// values written raw are always returned that way.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if the stored
    /// bytes cannot be decoded.
    pub async fn read<V, K>(&self, key: &K, options: &Options) -> Result<Option<Value<V>>>
    where
        V: DeserializeOwned,
        K: CacheKey + ?Sized,
    {
        let canonical = key.cache_key();
        let settings = self.settings(options);

        let work = async {
            let normalized = remote_key(&canonical);
            let (resolved, local) = self.resolve(&normalized).await?;
            match resolved {
                Resolved::Present(entry) => {
                    let activity = if local { CacheActivity::LocalHit } else { CacheActivity::Hit };
                    Ok((Some(self.decode(entry, settings.raw)?), activity))
                }
                Resolved::Absent => Ok((None, CacheActivity::Miss)),
            }
        };

        let result = self.observe(CacheOperation::Read, Some(&canonical), work).await;
        self.absorb(result, || None)
    }

    /// Writes a structured value through the codec.
    ///
    /// On success the overlay records the entry as stored, so a later read in this
    /// activation sees the write without a round trip. Returns whether the remote tier
    /// accepted the value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized, or if the remote tier fails
    /// outside silenced mode.
    pub async fn write<K, V>(&self, key: &K, value: &V, options: &Options) -> Result<bool>
    where
        K: CacheKey + ?Sized,
        V: Serialize + ?Sized,
    {
        let canonical = key.cache_key();
        let settings = self.settings(options);

        let work = async {
            let payload = self.store.codec.serialize(value)?;
            let entry = self.seal(payload, Flags::NONE, settings.expires_in, &settings)?;
            self.put(&remote_key(&canonical), entry).await
        };

        let result = self.observe(CacheOperation::Write, Some(&canonical), work).await;
        self.absorb(result, || false)
    }

    /// Writes a value as raw text, bypassing the codec.
    ///
    /// The value's [`Display`] form is stored, so a counter written as `0` can later be
    /// incremented. The overlay records the text exactly as stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode.
    pub async fn write_raw<K, T>(&self, key: &K, value: T, options: &Options) -> Result<bool>
    where
        K: CacheKey + ?Sized,
        T: Display,
    {
        let canonical = key.cache_key();
        let settings = self.settings(options);

        let work = async {
            let entry = self.seal(value.to_string().into_bytes(), Flags::RAW, settings.expires_in, &settings)?;
            self.put(&remote_key(&canonical), entry).await
        };

        let result = self.observe(CacheOperation::Write, Some(&canonical), work).await;
        self.absorb(result, || false)
    }

    /// Reads several keys, keyed by canonical key in the result.
    ///
    /// Keys the overlay already knows about are answered locally; the rest are fetched in
    /// a single batched remote call, and every answer, including absence, is recorded in
    /// the overlay. No remote call is made when the overlay knows every key. Absent keys
    /// are omitted from the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if any stored
    /// value cannot be decoded.
    pub async fn read_multi<V, K>(&self, keys: &[K], options: &Options) -> Result<HashMap<String, Value<V>>>
    where
        V: DeserializeOwned,
        K: CacheKey,
    {
        let settings = self.settings(options);

        let work = async {
            let mut seen = HashSet::with_capacity(keys.len());
            let requested: Vec<(String, String)> = keys
                .iter()
                .map(CacheKey::cache_key)
                .filter(|canonical| seen.insert(canonical.clone()))
                .map(|canonical| {
                    let normalized = remote_key(&canonical);
                    (canonical, normalized)
                })
                .collect();

            let overlay = self.overlay();
            let mut found = HashMap::with_capacity(requested.len());
            let mut unknown = Vec::new();
            for (canonical, normalized) in requested {
                match overlay.map_or(Lookup::NotChecked, |o| o.lookup(&normalized)) {
                    Lookup::Present(entry) => {
                        found.insert(canonical, entry);
                    }
                    Lookup::Absent => {}
                    Lookup::NotChecked => unknown.push((canonical, normalized)),
                }
            }

            let activity = if unknown.is_empty() {
                if found.is_empty() { CacheActivity::Miss } else { CacheActivity::LocalHit }
            } else {
                let names: Vec<String> = unknown.iter().map(|(_, normalized)| normalized.clone()).collect();
                match self.store.remote.get_multi(&names).await {
                    Ok(mut fetched) => {
                        for (canonical, normalized) in unknown {
                            let entry = fetched.remove(&normalized);
                            if let Some(overlay) = overlay {
                                let resolved = entry.clone().map_or(Resolved::Absent, Resolved::Present);
                                overlay.publish_if_vacant(&normalized, resolved);
                            }
                            if let Some(entry) = entry {
                                found.insert(canonical, entry);
                            }
                        }
                        if found.is_empty() { CacheActivity::Miss } else { CacheActivity::Hit }
                    }
                    // Keys the overlay already answered are still returned; nothing is remembered
                    // about the rest.
                    Err(error) if self.silences(&error) => {
                        self.store
                            .telemetry
                            .record(CacheOperation::ReadMulti, CacheActivity::Error, None, None, Some(&error));
                        if found.is_empty() { CacheActivity::Miss } else { CacheActivity::LocalHit }
                    }
                    Err(error) => return Err(error),
                }
            };

            let values = found
                .into_iter()
                .map(|(canonical, entry)| Ok((canonical, self.decode(entry, settings.raw)?)))
                .collect::<Result<HashMap<_, _>>>()?;
            Ok((values, activity))
        };

        self.observe(CacheOperation::ReadMulti, None, work).await
    }

    /// Reads a structured value, or computes it with `producer` and writes it.
    ///
    /// With [`Options::force`] the read is skipped. Within an activation, concurrent
    /// fetches of the same key run `producer` once and share its value. A producer that
    /// resolves its own key fails with [`ErrorKind::ReentrantFetch`].
    ///
    /// When both [`Options::expires_in`] and [`Options::race_condition_ttl`] are set, an
    /// expired value is still served for up to `race_condition_ttl` while a single caller
    /// regenerates it.
    ///
    /// The produced value is returned even if writing it fails in silenced mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if a value cannot
    /// be encoded or decoded.
    pub async fn fetch<V, K, F, Fut>(&self, key: &K, options: &Options, producer: F) -> Result<Value<V>>
    where
        V: Serialize + DeserializeOwned,
        K: CacheKey + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let canonical = key.cache_key();
        let settings = self.settings(options);
        let encode = |value: &V| -> Result<(Vec<u8>, Flags)> { Ok((self.store.codec.serialize(value)?, Flags::NONE)) };

        let work = async {
            let fetched = self
                .resolve_fetch(&canonical, &settings, settings.guard_window(), producer, &encode)
                .await?;
            let value = match fetched.produced {
                Some(value) => Value::Structured(value),
                None => self.decode(fetched.entry, settings.raw)?,
            };
            Ok((value, fetched.activity))
        };

        self.observe(CacheOperation::Fetch, Some(&canonical), work).await
    }

    /// Reads raw bytes, or computes a value with `producer` and writes its text.
    ///
    /// Behaves like [`fetch`](Self::fetch) in raw mode; the stale guard does not apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if a stored value
    /// cannot be decompressed.
    pub async fn fetch_raw<K, F, Fut, T>(&self, key: &K, options: &Options, producer: F) -> Result<Vec<u8>>
    where
        K: CacheKey + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        T: Display,
    {
        let canonical = key.cache_key();
        let settings = self.settings(options);
        let encode = |value: &T| -> Result<(Vec<u8>, Flags)> { Ok((value.to_string().into_bytes(), Flags::RAW)) };

        let work = async {
            let fetched = self.resolve_fetch(&canonical, &settings, None, producer, &encode).await?;
            let bytes = match fetched.produced {
                Some(value) => value.to_string().into_bytes(),
                None => self.payload(fetched.entry)?,
            };
            Ok((bytes, fetched.activity))
        };

        self.observe(CacheOperation::Fetch, Some(&canonical), work).await
    }

    /// Atomically increments a counter and returns the new count.
    ///
    /// Returns `None` without error when the key does not exist. The overlay records the
    /// count as text, the same representation a fresh remote read would produce.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if the stored
    /// value is not a counter.
    pub async fn increment<K: CacheKey + ?Sized>(&self, key: &K, amount: u64) -> Result<Option<u64>> {
        let canonical = key.cache_key();
        let work = async {
            let normalized = remote_key(&canonical);
            let result = self.store.remote.increment(&normalized, amount).await;
            self.settle_counter(&normalized, result)
        };

        let result = self.observe(CacheOperation::Increment, Some(&canonical), work).await;
        self.absorb(result, || None)
    }

    /// Atomically decrements a counter, saturating at zero, and returns the new count.
    ///
    /// Behaves like [`increment`](Self::increment) otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode, or if the stored
    /// value is not a counter.
    pub async fn decrement<K: CacheKey + ?Sized>(&self, key: &K, amount: u64) -> Result<Option<u64>> {
        let canonical = key.cache_key();
        let work = async {
            let normalized = remote_key(&canonical);
            let result = self.store.remote.decrement(&normalized, amount).await;
            self.settle_counter(&normalized, result)
        };

        let result = self.observe(CacheOperation::Decrement, Some(&canonical), work).await;
        self.absorb(result, || None)
    }

    /// Deletes a key and records it as absent in the overlay.
    ///
    /// Returns whether the remote tier removed an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode.
    pub async fn delete<K: CacheKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let canonical = key.cache_key();
        let work = async {
            let normalized = remote_key(&canonical);
            let result = self.store.remote.delete(&normalized).await;
            if let Some(overlay) = self.overlay() {
                match result {
                    Ok(_) => overlay.publish(&normalized, Resolved::Absent),
                    Err(_) => overlay.forget(&normalized),
                }
            }
            let deleted = result?;
            Ok((deleted, if deleted { CacheActivity::Deleted } else { CacheActivity::Miss }))
        };

        let result = self.observe(CacheOperation::Delete, Some(&canonical), work).await;
        self.absorb(result, || false)
    }

    /// Checks whether a key exists.
    ///
    /// A value present in the overlay answers `true` locally; otherwise the remote tier is
    /// asked. The answer is not recorded in the overlay, since presence alone says nothing
    /// about the value.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode.
    pub async fn exist<K: CacheKey + ?Sized>(&self, key: &K) -> Result<bool> {
        let canonical = key.cache_key();
        let work = async {
            let normalized = remote_key(&canonical);
            if let Some(Lookup::Present(_)) = self.overlay().map(|o| o.lookup(&normalized)) {
                return Ok((true, CacheActivity::LocalHit));
            }
            let exists = self.store.remote.get(&normalized).await?.is_some();
            Ok((exists, if exists { CacheActivity::Hit } else { CacheActivity::Miss }))
        };

        let result = self.observe(CacheOperation::Exist, Some(&canonical), work).await;
        self.absorb(result, || false)
    }

    /// Clears the remote tier and everything this scope's overlay knows.
    ///
    /// This is the one global mutation: it affects every client of the remote tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote tier fails outside silenced mode.
    pub async fn clear(&self) -> Result<bool> {
        let work = async {
            let result = self.store.remote.clear().await;
            if let Some(overlay) = self.overlay() {
                overlay.clear();
            }
            Ok((result?, CacheActivity::Ok))
        };

        let result = self.observe(CacheOperation::Clear, None, work).await;
        self.absorb(result, || false)
    }

    pub(crate) fn overlay(&self) -> Option<&LocalOverlay> {
        self.overlay.as_deref().filter(|overlay| !overlay.is_closed())
    }

    fn settings(&self, options: &Options) -> Settings {
        options.over(&self.store.defaults)
    }

    /// Resolves a key through the overlay, reporting whether it was answered locally.
    async fn resolve(&self, normalized: &str) -> Result<(Resolved, bool)> {
        let Some(overlay) = self.overlay() else {
            return Ok((self.remote_get(normalized).await?, false));
        };

        match overlay.lookup(normalized) {
            Lookup::Present(entry) => Ok((Resolved::Present(entry), true)),
            Lookup::Absent => Ok((Resolved::Absent, true)),
            Lookup::NotChecked => {
                let resolved = overlay.fetch_or_compute(normalized, || self.remote_get(normalized)).await?;
                Ok((resolved, false))
            }
        }
    }

    /// Runs a fetch through the overlay's single-flight slot when there is one.
    async fn resolve_fetch<T, F, Fut>(
        &self,
        canonical: &str,
        settings: &Settings,
        guard: Option<(Duration, Duration)>,
        producer: F,
        encode: Encoder<'_, T>,
    ) -> Result<Fetched<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let normalized = remote_key(canonical);
        let overlay = match self.overlay() {
            Some(overlay) if !settings.force => overlay,
            _ => return self.fetch_entry(canonical, &normalized, settings, guard, producer, encode).await,
        };

        match overlay.lookup(&normalized) {
            Lookup::Present(entry) => return Ok(Fetched::cached(entry, CacheActivity::LocalHit)),
            // A remembered miss does not answer a fetch; compute it in a fresh slot.
            Lookup::Absent => overlay.reopen(&normalized),
            Lookup::NotChecked => {}
        }

        let mut producer = Some(producer);
        let mut outcome = None;
        let (pending, slot, key) = (&mut producer, &mut outcome, normalized.as_str());
        let resolved = overlay
            .fetch_or_compute(key, move || async move {
                let Some(producer) = pending.take() else {
                    return Ok(Resolved::Absent);
                };
                let fetched = self.fetch_entry(canonical, key, settings, guard, producer, encode).await?;
                let entry = fetched.entry.clone();
                *slot = Some(fetched);
                Ok::<_, Error>(Resolved::Present(entry))
            })
            .await?;

        match (outcome, resolved, producer) {
            (Some(fetched), _, _) => Ok(fetched),
            (None, Resolved::Present(entry), _) => Ok(Fetched::cached(entry, CacheActivity::LocalHit)),
            // A delete tombstoned the key after it was reopened, so nothing was run for us.
            (None, Resolved::Absent, Some(producer)) => {
                self.fetch_entry(canonical, &normalized, settings, guard, producer, encode)
                    .await
            }
            (None, Resolved::Absent, None) => Err(Error::from_cause(
                ErrorKind::ReentrantFetch,
                format!("producer for key '{canonical}' was consumed without a result"),
            )),
        }
    }

    /// Reads the key unless forced, otherwise produces, writes and returns a value.
    async fn fetch_entry<T, F, Fut>(
        &self,
        canonical: &str,
        normalized: &str,
        settings: &Settings,
        guard: Option<(Duration, Duration)>,
        producer: F,
        encode: Encoder<'_, T>,
    ) -> Result<Fetched<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(window) = guard {
            return self
                .guarded_fetch(canonical, normalized, settings, window, producer, encode)
                .await;
        }

        if !settings.force {
            let current = self.tolerate(CacheOperation::Fetch, canonical, self.remote_get(normalized).await, || {
                Resolved::Absent
            })?;
            if let Resolved::Present(entry) = current {
                return Ok(Fetched::cached(entry, CacheActivity::Hit));
            }
        }

        let value = producer().await;
        let (payload, flags) = encode(&value)?;
        let entry = self.seal(payload, flags, settings.expires_in, settings)?;
        self.tolerate(CacheOperation::Fetch, canonical, self.put(normalized, entry.clone()).await, || {
            (false, CacheActivity::Error)
        })?;

        Ok(Fetched {
            entry,
            produced: Some(value),
            activity: CacheActivity::Miss,
        })
    }

    pub(crate) async fn remote_get(&self, normalized: &str) -> Result<Resolved> {
        Ok(self
            .store
            .remote
            .get(normalized)
            .await?
            .map_or(Resolved::Absent, Resolved::Present))
    }

    /// Writes an entry and keeps the overlay in step with the outcome.
    pub(crate) async fn put(&self, normalized: &str, entry: Entry) -> Result<(bool, CacheActivity)> {
        let published = self.overlay().map(|_| entry.clone());
        let result = self.store.remote.set(normalized, entry).await;

        if let Some(overlay) = self.overlay() {
            match (&result, published) {
                (Ok(true), Some(entry)) => overlay.publish(normalized, Resolved::Present(entry)),
                _ => overlay.forget(normalized),
            }
        }

        let accepted = result?;
        Ok((accepted, if accepted { CacheActivity::Written } else { CacheActivity::Ok }))
    }

    /// Compresses a logical payload as configured and attaches the remote TTL.
    pub(crate) fn seal(&self, payload: Vec<u8>, flags: Flags, ttl: Option<Duration>, settings: &Settings) -> Result<Entry> {
        let (payload, flags) = codec::compress(payload, flags, settings)?;
        Ok(Entry::new(payload).with_flags(flags).with_ttl(ttl))
    }

    /// Returns the logical payload of an entry: decompressed and outside any guard envelope.
    pub(crate) fn payload(&self, entry: Entry) -> Result<Vec<u8>> {
        let flags = entry.flags();
        let payload = codec::decompress(entry.into_payload(), flags)?;
        if flags.contains(Flags::GUARDED) {
            return Ok(Envelope::decode(&payload)?.body);
        }
        Ok(payload)
    }

    fn decode<V: DeserializeOwned>(&self, entry: Entry, raw: bool) -> Result<Value<V>> {
        let is_raw = raw || entry.flags().contains(Flags::RAW);
        let payload = self.payload(entry)?;
        if is_raw {
            return Ok(Value::Raw(payload));
        }
        Ok(Value::Structured(self.store.codec.deserialize(&payload)?))
    }

    fn settle_counter(&self, normalized: &str, result: Result<Option<u64>>) -> Result<(Option<u64>, CacheActivity)> {
        if let Some(overlay) = self.overlay() {
            match &result {
                Ok(Some(count)) => overlay.publish(normalized, Resolved::Present(Entry::raw(count.to_string()))),
                Ok(None) => overlay.publish(normalized, Resolved::Absent),
                Err(_) => overlay.forget(normalized),
            }
        }

        let count = result?;
        Ok((count, if count.is_some() { CacheActivity::Ok } else { CacheActivity::Miss }))
    }

    /// Times `work` and records its outcome as one event.
    async fn observe<T>(
        &self,
        operation: CacheOperation,
        key: Option<&str>,
        work: impl Future<Output = Result<(T, CacheActivity)>>,
    ) -> Result<T> {
        let TimedResult { result, duration } = self.store.clock.timed_async(work).await;
        match result {
            Ok((value, activity)) => {
                self.store.telemetry.record(operation, activity, key, Some(duration), None);
                Ok(value)
            }
            Err(error) => {
                self.store
                    .telemetry
                    .record(operation, CacheActivity::Error, key, Some(duration), Some(&error));
                Err(error)
            }
        }
    }

    fn silences(&self, error: &Error) -> bool {
        self.store.silence && error.is_remote_unavailable()
    }

    /// Replaces a silenced failure with the operation's neutral result.
    fn absorb<T>(&self, result: Result<T>, neutral: impl FnOnce() -> T) -> Result<T> {
        match result {
            Err(error) if self.silences(&error) => Ok(neutral()),
            other => other,
        }
    }

    /// Like [`absorb`](Self::absorb) for a step inside a larger operation, reporting the
    /// silenced failure as its own event.
    pub(crate) fn tolerate<T>(
        &self,
        operation: CacheOperation,
        key: &str,
        result: Result<T>,
        neutral: impl FnOnce() -> T,
    ) -> Result<T> {
        match result {
            Err(error) if self.silences(&error) => {
                self.store
                    .telemetry
                    .record(operation, CacheActivity::Error, Some(key), None, Some(&error));
                Ok(neutral())
            }
            other => other,
        }
    }

    /// Milliseconds since the Unix epoch according to the store's clock.
    pub(crate) fn now_millis(&self) -> u64 {
        self.store
            .clock
            .system_time()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
    }
}
