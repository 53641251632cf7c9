// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

/// Payloads at least this long are compressed when compression is enabled.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 4096;

/// Per-call options for cache operations.
///
/// Every option is unset by default. Options passed to an operation are layered over the
/// store-wide defaults configured with
/// [`StoreBuilder::defaults`](crate::StoreBuilder::defaults): a value set on the call wins,
/// an unset value falls back to the default.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use duocache::Options;
///
/// let options = Options::new()
///     .expires_in(Duration::from_secs(60))
///     .race_condition_ttl(Duration::from_secs(5))
///     .compress(true);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    raw: Option<bool>,
    expires_in: Option<Duration>,
    race_condition_ttl: Option<Duration>,
    force: Option<bool>,
    compress: Option<bool>,
    compress_threshold: Option<usize>,
}

impl Options {
    /// Creates options with nothing set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores and reads values as string scalars, bypassing the codec.
    #[must_use]
    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Sets how long written values live. A zero duration means they never expire.
    #[must_use]
    pub fn expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    /// Sets how long past expiry a fetched value may still be served while a single caller
    /// regenerates it.
    ///
    /// Only takes effect on [`fetch`](crate::TwoTierStore::fetch) together with
    /// [`expires_in`](Self::expires_in).
    #[must_use]
    pub fn race_condition_ttl(mut self, race_condition_ttl: Duration) -> Self {
        self.race_condition_ttl = Some(race_condition_ttl);
        self
    }

    /// Makes [`fetch`](crate::TwoTierStore::fetch) recompute even when a value is cached.
    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = Some(force);
        self
    }

    /// Compresses payloads that reach the compression threshold.
    #[must_use]
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    /// Sets the payload length, in bytes, at which compression kicks in.
    ///
    /// Defaults to [`DEFAULT_COMPRESS_THRESHOLD`].
    #[must_use]
    pub fn compress_threshold(mut self, bytes: usize) -> Self {
        self.compress_threshold = Some(bytes);
        self
    }

    /// Resolves these options over `defaults`.
    pub(crate) fn over(&self, defaults: &Self) -> Settings {
        Settings {
            raw: self.raw.or(defaults.raw).unwrap_or(false),
            expires_in: self.expires_in.or(defaults.expires_in).filter(|d| !d.is_zero()),
            race_condition_ttl: self
                .race_condition_ttl
                .or(defaults.race_condition_ttl)
                .filter(|d| !d.is_zero()),
            force: self.force.or(defaults.force).unwrap_or(false),
            compress: self.compress.or(defaults.compress).unwrap_or(false),
            compress_threshold: self
                .compress_threshold
                .or(defaults.compress_threshold)
                .unwrap_or(DEFAULT_COMPRESS_THRESHOLD),
        }
    }
}

/// Fully resolved options for one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Settings {
    pub raw: bool,
    pub expires_in: Option<Duration>,
    pub race_condition_ttl: Option<Duration>,
    pub force: bool,
    pub compress: bool,
    pub compress_threshold: usize,
}

impl Settings {
    /// Returns the expiry and tolerance when both are set, which enables the stale guard.
    pub fn guard_window(&self) -> Option<(Duration, Duration)> {
        self.expires_in.zip(self.race_condition_ttl)
    }
}
