// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for [`TwoTierStore`].

use std::{
    fmt::{self, Debug},
    sync::Arc,
};

#[cfg(any(feature = "metrics", test))]
use opentelemetry::metrics::{Meter, MeterProvider};
use tick::Clock;

#[cfg(any(feature = "metrics", test))]
use crate::telemetry::metrics;
use crate::{
    Options, RemoteStore, TwoTierStore,
    codec::{Codec, PostcardCodec},
    guard::Claims,
    telemetry::{CacheEvent, CacheName, DEFAULT_NAME, Listener, Telemetry},
};

/// Configures and creates a [`TwoTierStore`].
///
/// Created by [`TwoTierStore::builder`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use duocache::{Options, TwoTierStore};
/// use duocache_remote::testing::MockRemote;
/// use tick::Clock;
///
/// let clock = Clock::new_frozen();
/// let store = TwoTierStore::builder(MockRemote::new(clock.clone()), clock)
///     .name("sessions")
///     .defaults(Options::new().expires_in(Duration::from_secs(300)))
///     .silence()
///     .build();
/// ```
pub struct StoreBuilder<R, C = PostcardCodec> {
    remote: R,
    clock: Clock,
    codec: C,
    name: CacheName,
    defaults: Options,
    silence: bool,
    listeners: Vec<Listener>,
    #[cfg(any(feature = "logs", test))]
    logs: bool,
    #[cfg(any(feature = "metrics", test))]
    meter: Option<Meter>,
}

impl<R: RemoteStore> StoreBuilder<R> {
    pub(crate) fn new(remote: R, clock: Clock) -> Self {
        Self {
            remote,
            clock,
            codec: PostcardCodec,
            name: DEFAULT_NAME,
            defaults: Options::default(),
            silence: false,
            listeners: Vec::new(),
            #[cfg(any(feature = "logs", test))]
            logs: false,
            #[cfg(any(feature = "metrics", test))]
            meter: None,
        }
    }
}

impl<R: RemoteStore, C: Codec> StoreBuilder<R, C> {
    /// Names the store in telemetry. Defaults to `duocache`.
    #[must_use]
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Replaces the codec used for structured values.
    #[must_use]
    pub fn codec<C2: Codec>(self, codec: C2) -> StoreBuilder<R, C2> {
        StoreBuilder {
            remote: self.remote,
            clock: self.clock,
            codec,
            name: self.name,
            defaults: self.defaults,
            silence: self.silence,
            listeners: self.listeners,
            #[cfg(any(feature = "logs", test))]
            logs: self.logs,
            #[cfg(any(feature = "metrics", test))]
            meter: self.meter,
        }
    }

    /// Sets options applied to every operation unless the call overrides them.
    #[must_use]
    pub fn defaults(mut self, defaults: Options) -> Self {
        self.defaults = defaults;
        self
    }

    /// Treats remote failures as misses instead of returning them.
    ///
    /// Reads then return nothing, writes and deletes return `false` and fetches compute
    /// their value. Failures are still reported to telemetry.
    #[must_use]
    pub fn silence(mut self) -> Self {
        self.silence = true;
        self
    }

    /// Emits one `tracing` event per operation.
    #[cfg(any(feature = "logs", test))]
    #[cfg_attr(docsrs, doc(cfg(feature = "logs")))]
    #[must_use]
    pub fn logs(mut self) -> Self {
        self.logs = true;
        self
    }

    /// Records operation counts and durations with the given meter provider.
    #[cfg(any(feature = "metrics", test))]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    #[must_use]
    pub fn metrics(mut self, meter_provider: &dyn MeterProvider) -> Self {
        self.meter = Some(metrics::create_meter(meter_provider));
        self
    }

    /// Calls `listener` with every event the store records.
    ///
    /// Listeners run inline on the calling task and should return quickly.
    #[must_use]
    pub fn on_event(mut self, listener: impl Fn(&CacheEvent<'_>) + Send + Sync + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Creates the store.
    #[must_use]
    pub fn build(self) -> TwoTierStore<R, C> {
        let telemetry = Telemetry::new(self.name, self.listeners);
        #[cfg(any(feature = "logs", test))]
        let telemetry = telemetry.with_logs(self.logs);
        #[cfg(any(feature = "metrics", test))]
        let telemetry = telemetry.with_meter(self.meter.as_ref());

        TwoTierStore {
            remote: self.remote,
            codec: self.codec,
            clock: self.clock,
            defaults: self.defaults,
            silence: self.silence,
            telemetry,
            claims: Claims::default(),
        }
    }
}

impl<R, C> Debug for StoreBuilder<R, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .field("silence", &self.silence)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use duocache_remote::testing::MockRemote;

    use super::*;

    #[test]
    fn builder_carries_configuration() {
        let clock = Clock::new_frozen();
        let store = TwoTierStore::builder(MockRemote::new(clock.clone()), clock)
            .name("orders")
            .defaults(Options::new().expires_in(Duration::from_secs(60)))
            .silence()
            .build();

        assert_eq!(store.telemetry.name(), "orders");
        assert!(store.silence);
        assert_eq!(store.defaults, Options::new().expires_in(Duration::from_secs(60)));
    }

    #[test]
    fn debug_output_names_the_store() {
        let clock = Clock::new_frozen();
        let builder = TwoTierStore::builder(MockRemote::new(clock.clone()), clock);
        let rendered = format!("{builder:?}");
        assert!(rendered.contains("duocache"), "{rendered}");
    }
}
