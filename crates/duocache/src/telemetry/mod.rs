// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache events, structured logging and OpenTelemetry metrics.
//!
//! Every store operation produces one [`CacheEvent`]. Events always reach the listeners
//! registered with [`StoreBuilder::on_event`](crate::StoreBuilder::on_event); with the
//! `logs` feature they are also emitted through `tracing`, and with the `metrics` feature
//! they are counted and timed through OpenTelemetry.

use std::{fmt, sync::Arc, time::Duration};

#[cfg(any(feature = "metrics", test))]
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

use crate::Error;

pub(crate) mod attributes;
pub(crate) mod ext;
#[cfg(any(feature = "metrics", test))]
pub(crate) mod metrics;
#[cfg(test)]
pub(crate) mod testing;

/// Name identifying a store in telemetry.
pub type CacheName = &'static str;

pub(crate) const DEFAULT_NAME: CacheName = "duocache";

/// The operation an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CacheOperation {
    /// A single-key read.
    Read,
    /// A batched read.
    ReadMulti,
    /// A structured or raw write.
    Write,
    /// A read-or-compute-and-write.
    Fetch,
    /// A counter increment.
    Increment,
    /// A counter decrement.
    Decrement,
    /// A delete.
    Delete,
    /// An existence check.
    Exist,
    /// A wholesale clear.
    Clear,
}

impl CacheOperation {
    /// Returns the telemetry name of the operation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "cache.read",
            Self::ReadMulti => "cache.read_multi",
            Self::Write => "cache.write",
            Self::Fetch => "cache.fetch",
            Self::Increment => "cache.increment",
            Self::Decrement => "cache.decrement",
            Self::Delete => "cache.delete",
            Self::Exist => "cache.exist",
            Self::Clear => "cache.clear",
        }
    }
}

/// What happened during an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CacheActivity {
    /// The remote tier had the value.
    Hit,
    /// The local overlay answered without touching the remote tier.
    LocalHit,
    /// Nothing was cached.
    Miss,
    /// The remote tier accepted a write.
    Written,
    /// The remote tier removed an entry.
    Deleted,
    /// An expired value was served while another caller regenerates it.
    Stale,
    /// This caller claimed an expired value and regenerated it.
    Regenerated,
    /// The operation completed without a more specific outcome.
    Ok,
    /// The operation failed, or a failure was silenced.
    Error,
}

impl CacheActivity {
    /// Returns the telemetry name of the activity.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "cache.hit",
            Self::LocalHit => "cache.local_hit",
            Self::Miss => "cache.miss",
            Self::Written => "cache.written",
            Self::Deleted => "cache.deleted",
            Self::Stale => "cache.stale",
            Self::Regenerated => "cache.regenerated",
            Self::Ok => "cache.ok",
            Self::Error => "cache.error",
        }
    }

    #[cfg(any(feature = "logs", test))]
    fn severity(self) -> Severity {
        match self {
            Self::Hit | Self::LocalHit | Self::Miss | Self::Ok => Severity::Debug,
            Self::Written | Self::Deleted | Self::Stale | Self::Regenerated => Severity::Info,
            Self::Error => Severity::Error,
        }
    }
}

#[cfg(any(feature = "logs", test))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Debug,
    Info,
    Error,
}

/// A single observation of a store operation.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
///
/// use duocache::{CacheActivity, CacheOperation, Options, TwoTierStore};
/// use duocache_remote::testing::MockRemote;
/// use tick::Clock;
///
/// # futures::executor::block_on(async {
/// let seen = Arc::new(Mutex::new(Vec::new()));
/// let sink = Arc::clone(&seen);
///
/// let clock = Clock::new_frozen();
/// let store = TwoTierStore::builder(MockRemote::new(clock.clone()), clock)
///     .on_event(move |event| sink.lock().unwrap().push((event.operation(), event.activity())))
///     .build();
///
/// store.read::<i32, _>("missing", &Options::new()).await?;
/// assert_eq!(seen.lock().unwrap()[0], (CacheOperation::Read, CacheActivity::Miss));
/// # Ok::<(), duocache::Error>(())
/// # });
/// ```
#[derive(Debug, Clone, Copy)]
pub struct CacheEvent<'a> {
    name: CacheName,
    operation: CacheOperation,
    activity: CacheActivity,
    key: Option<&'a str>,
    duration: Option<Duration>,
    error: Option<&'a Error>,
}

impl<'a> CacheEvent<'a> {
    /// Returns the name of the store that produced the event.
    #[must_use]
    pub fn name(&self) -> CacheName {
        self.name
    }

    /// Returns the operation.
    #[must_use]
    pub fn operation(&self) -> CacheOperation {
        self.operation
    }

    /// Returns what happened.
    #[must_use]
    pub fn activity(&self) -> CacheActivity {
        self.activity
    }

    /// Returns the canonical key, for single-key operations.
    #[must_use]
    pub fn key(&self) -> Option<&'a str> {
        self.key
    }

    /// Returns how long the operation took, when it was timed.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Returns the failure behind an [`CacheActivity::Error`] event.
    #[must_use]
    pub fn error(&self) -> Option<&'a Error> {
        self.error
    }
}

pub(crate) type Listener = Arc<dyn Fn(&CacheEvent<'_>) + Send + Sync>;

/// Fans events out to listeners, logs and metrics.
#[derive(Clone)]
pub(crate) struct Telemetry {
    name: CacheName,
    listeners: Vec<Listener>,
    #[cfg(any(feature = "logs", test))]
    logging_enabled: bool,
    #[cfg(any(feature = "metrics", test))]
    event_counter: Option<Counter<u64>>,
    #[cfg(any(feature = "metrics", test))]
    operation_duration: Option<Histogram<f64>>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("name", &self.name)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    pub fn new(name: CacheName, listeners: Vec<Listener>) -> Self {
        Self {
            name,
            listeners,
            #[cfg(any(feature = "logs", test))]
            logging_enabled: false,
            #[cfg(any(feature = "metrics", test))]
            event_counter: None,
            #[cfg(any(feature = "metrics", test))]
            operation_duration: None,
        }
    }

    #[cfg(any(feature = "logs", test))]
    #[must_use]
    pub fn with_logs(mut self, enabled: bool) -> Self {
        self.logging_enabled = enabled;
        self
    }

    #[cfg(any(feature = "metrics", test))]
    #[must_use]
    pub fn with_meter(mut self, meter: Option<&Meter>) -> Self {
        self.event_counter = meter.map(metrics::create_event_counter);
        self.operation_duration = meter.map(metrics::create_operation_duration_histogram);
        self
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    pub fn record(
        &self,
        operation: CacheOperation,
        activity: CacheActivity,
        key: Option<&str>,
        duration: Option<Duration>,
        error: Option<&Error>,
    ) {
        let event = CacheEvent {
            name: self.name,
            operation,
            activity,
            key,
            duration,
            error,
        };

        for listener in &self.listeners {
            listener(&event);
        }

        #[cfg(any(feature = "metrics", test))]
        self.record_metrics(&event);

        #[cfg(any(feature = "logs", test))]
        if self.logging_enabled {
            Self::emit(&event);
        }
    }

    #[cfg(any(feature = "metrics", test))]
    fn record_metrics(&self, event: &CacheEvent<'_>) {
        let attrs = [
            KeyValue::new(attributes::CACHE_NAME, event.name),
            KeyValue::new(attributes::CACHE_OPERATION_NAME, event.operation.as_str()),
            KeyValue::new(attributes::CACHE_ACTIVITY_NAME, event.activity.as_str()),
        ];

        if let Some(counter) = &self.event_counter {
            counter.add(1, &attrs);
        }

        if let (Some(duration), Some(histogram)) = (event.duration, &self.operation_duration) {
            histogram.record(duration.as_secs_f64(), &attrs);
        }
    }

    #[cfg(any(feature = "logs", test))]
    fn emit(event: &CacheEvent<'_>) {
        let name = event.name;
        let op = event.operation.as_str();
        let activity = event.activity.as_str();
        let key = event.key;
        let duration_ns = event.duration.map(|d| d.as_nanos());
        let error = event.error.map(ToString::to_string);

        // Tracing levels must be constant, so each level gets its own expansion.
        // Field names must match the constants in attributes.rs.
        macro_rules! emit_event {
            ($level:ident) => {
                tracing::$level!(
                    cache.name = name,
                    cache.operation = op,
                    cache.activity = activity,
                    cache.key = ?key,
                    cache.duration_ns = ?duration_ns,
                    cache.error = ?error,
                    "cache.event"
                )
            };
        }

        match event.activity.severity() {
            Severity::Error => emit_event!(error),
            Severity::Info => emit_event!(info),
            Severity::Debug => emit_event!(debug),
        }
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::metrics::MeterProvider;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        ErrorKind,
        telemetry::testing::{LogCapture, MetricTester},
    };

    #[test]
    fn operation_names() {
        assert_eq!(CacheOperation::Read.as_str(), "cache.read");
        assert_eq!(CacheOperation::ReadMulti.as_str(), "cache.read_multi");
        assert_eq!(CacheOperation::Write.as_str(), "cache.write");
        assert_eq!(CacheOperation::Fetch.as_str(), "cache.fetch");
        assert_eq!(CacheOperation::Increment.as_str(), "cache.increment");
        assert_eq!(CacheOperation::Decrement.as_str(), "cache.decrement");
        assert_eq!(CacheOperation::Delete.as_str(), "cache.delete");
        assert_eq!(CacheOperation::Exist.as_str(), "cache.exist");
        assert_eq!(CacheOperation::Clear.as_str(), "cache.clear");
    }

    #[test]
    fn activity_names() {
        assert_eq!(CacheActivity::Hit.as_str(), "cache.hit");
        assert_eq!(CacheActivity::LocalHit.as_str(), "cache.local_hit");
        assert_eq!(CacheActivity::Miss.as_str(), "cache.miss");
        assert_eq!(CacheActivity::Written.as_str(), "cache.written");
        assert_eq!(CacheActivity::Deleted.as_str(), "cache.deleted");
        assert_eq!(CacheActivity::Stale.as_str(), "cache.stale");
        assert_eq!(CacheActivity::Regenerated.as_str(), "cache.regenerated");
        assert_eq!(CacheActivity::Ok.as_str(), "cache.ok");
        assert_eq!(CacheActivity::Error.as_str(), "cache.error");
    }

    #[test]
    fn activity_severity() {
        assert_eq!(CacheActivity::Hit.severity(), Severity::Debug);
        assert_eq!(CacheActivity::LocalHit.severity(), Severity::Debug);
        assert_eq!(CacheActivity::Stale.severity(), Severity::Info);
        assert_eq!(CacheActivity::Regenerated.severity(), Severity::Info);
        assert_eq!(CacheActivity::Error.severity(), Severity::Error);
    }

    #[test]
    fn listeners_receive_every_field() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Listener = Arc::new(move |event: &CacheEvent<'_>| {
            sink.lock().push((
                event.name(),
                event.operation(),
                event.activity(),
                event.key().map(str::to_string),
                event.duration(),
                event.error().map(Error::kind),
            ));
        });

        let telemetry = Telemetry::new("listened", vec![listener]);
        let error = Error::with_kind(ErrorKind::RemoteUnavailable);
        telemetry.record(
            CacheOperation::Delete,
            CacheActivity::Error,
            Some("k"),
            Some(Duration::from_millis(3)),
            Some(&error),
        );

        assert_eq!(
            seen.lock().as_slice(),
            [(
                "listened",
                CacheOperation::Delete,
                CacheActivity::Error,
                Some("k".to_string()),
                Some(Duration::from_millis(3)),
                Some(ErrorKind::RemoteUnavailable),
            )]
        );
    }

    #[test]
    fn metrics_record_emits_correct_attributes() {
        let tester = MetricTester::new();
        let meter = tester.meter_provider().meter("cache");
        let telemetry = Telemetry::new("my_cache", Vec::new()).with_meter(Some(&meter));

        telemetry.record(
            CacheOperation::Fetch,
            CacheActivity::Stale,
            Some("k"),
            Some(Duration::from_millis(5)),
            None,
        );

        tester.assert_attributes_contain(&[
            KeyValue::new(attributes::CACHE_NAME, "my_cache"),
            KeyValue::new(attributes::CACHE_OPERATION_NAME, CacheOperation::Fetch.as_str()),
            KeyValue::new(attributes::CACHE_ACTIVITY_NAME, CacheActivity::Stale.as_str()),
        ]);
    }

    #[test]
    fn logs_contain_all_fields_and_values() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        let telemetry = Telemetry::new("my_test_cache", Vec::new()).with_logs(true);
        telemetry.record(
            CacheOperation::Increment,
            CacheActivity::Error,
            Some("counter"),
            Some(Duration::from_nanos(12345)),
            Some(&Error::from_cause(ErrorKind::CorruptValue, "not a number")),
        );

        capture.assert_contains(attributes::CACHE_NAME);
        capture.assert_contains(attributes::CACHE_OPERATION_NAME);
        capture.assert_contains(attributes::CACHE_ACTIVITY_NAME);
        capture.assert_contains(attributes::CACHE_KEY_NAME);
        capture.assert_contains(attributes::CACHE_DURATION_NAME);
        capture.assert_contains(attributes::CACHE_EVENT_NAME);

        capture.assert_contains("my_test_cache");
        capture.assert_contains("cache.increment");
        capture.assert_contains("counter");
        capture.assert_contains("not a number");
        capture.assert_contains("ERROR");
    }

    #[test]
    fn logs_use_activity_severity() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        Telemetry::emit(&event(CacheActivity::Regenerated));
        capture.assert_contains("INFO");

        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        Telemetry::emit(&event(CacheActivity::LocalHit));
        capture.assert_contains("DEBUG");
    }

    #[test]
    fn disabled_logs_emit_nothing() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        Telemetry::new("quiet", Vec::new()).record(CacheOperation::Read, CacheActivity::Hit, Some("k"), None, None);

        assert!(capture.output().is_empty());
    }

    fn event(activity: CacheActivity) -> CacheEvent<'static> {
        CacheEvent {
            name: "cache",
            operation: CacheOperation::Fetch,
            activity,
            key: None,
            duration: None,
            error: None,
        }
    }
}
