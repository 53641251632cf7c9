// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stale-while-revalidate fetches.
//!
//! A guarded value is written inside an [`Envelope`] that records its nominal expiry. The
//! remote tier keeps the entry for `expires_in + race_condition_ttl`, so for a while after
//! the nominal expiry the old value is still readable. During that window the first caller
//! to notice the expiry claims the key and pushes the envelope's expiry out by
//! `race_condition_ttl` before regenerating the value; everyone else keeps getting the stale
//! value without waiting until that claim deadline passes. Past the window the entry is
//! treated as missing and recomputed synchronously.

use std::{collections::HashSet, time::Duration};

use parking_lot::Mutex;

use crate::{
    Codec, Entry, Error, ErrorKind, Flags, RemoteStore, Result,
    codec,
    options::Settings,
    overlay::Resolved,
    store::{Encoder, Fetched, Scope},
    telemetry::{CacheActivity, CacheOperation},
};

const HEADER_LEN: usize = 9;

/// The stored form of a guarded value.
///
/// Layout: expiry as big-endian Unix milliseconds, one byte set when a caller has claimed
/// regeneration, then the value's payload. For a claimed envelope the expiry is the claim
/// deadline rather than the value's nominal expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Envelope {
    pub expires_at_ms: u64,
    pub extended: bool,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.body.len());
        bytes.extend_from_slice(&self.expires_at_ms.to_be_bytes());
        bytes.push(u8::from(self.extended));
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let Some((expiry, rest)) = bytes.split_first_chunk::<8>() else {
            return Err(too_short(bytes.len()));
        };
        let Some((marker, body)) = rest.split_first() else {
            return Err(too_short(bytes.len()));
        };
        let extended = match marker {
            0 => false,
            1 => true,
            other => {
                return Err(Error::from_cause(
                    ErrorKind::CorruptValue,
                    format!("unknown guard marker {other}"),
                ));
            }
        };

        Ok(Self {
            expires_at_ms: u64::from_be_bytes(*expiry),
            extended,
            body: body.to_vec(),
        })
    }

    /// Places this envelope on the state machine at time `now_ms`.
    ///
    /// A claim that outlives its deadline becomes claimable again for another
    /// `race_condition_ttl`, so a regenerating caller that died does not pin the old value.
    pub fn state(&self, now_ms: u64, race_condition_ttl: Duration) -> Freshness {
        if now_ms < self.expires_at_ms {
            return if self.extended { Freshness::Claimed } else { Freshness::Fresh };
        }

        if now_ms < self.expires_at_ms.saturating_add(millis(race_condition_ttl)) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Returns this envelope claimed until `now_ms + race_condition_ttl`.
    pub fn claimed(self, now_ms: u64, race_condition_ttl: Duration) -> Self {
        Self {
            expires_at_ms: now_ms.saturating_add(millis(race_condition_ttl)),
            extended: true,
            ..self
        }
    }
}

/// Where a guarded value stands relative to its expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Freshness {
    /// Not yet at nominal expiry.
    Fresh,
    /// Past expiry, within tolerance, and nobody has claimed regeneration.
    Stale,
    /// Another caller is regenerating it and its claim deadline has not passed.
    Claimed,
    /// Past the tolerance window.
    Expired,
}

fn too_short(len: usize) -> Error {
    Error::from_cause(
        ErrorKind::CorruptValue,
        format!("guarded payload is {len} bytes, shorter than its {HEADER_LEN} byte header"),
    )
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Keys this process is currently regenerating.
#[derive(Debug, Default)]
pub(crate) struct Claims {
    in_flight: Mutex<HashSet<String>>,
}

impl Claims {
    /// Returns a claim on `key`, or `None` if another caller holds it.
    pub fn try_claim(&self, key: &str) -> Option<Claim<'_>> {
        self.in_flight.lock().insert(key.to_string()).then(|| Claim {
            claims: self,
            key: key.to_string(),
        })
    }

    #[cfg(test)]
    fn is_claimed(&self, key: &str) -> bool {
        self.in_flight.lock().contains(key)
    }
}

/// Releases its key when dropped, including when the regenerating future is cancelled.
#[derive(Debug)]
pub(crate) struct Claim<'a> {
    claims: &'a Claims,
    key: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims.in_flight.lock().remove(&self.key);
    }
}

impl<R, C> Scope<'_, R, C>
where
    R: RemoteStore,
    C: Codec,
{
    /// Fetches through the stale guard with the given `(expires_in, race_condition_ttl)`.
    pub(crate) async fn guarded_fetch<T, F, Fut>(
        &self,
        canonical: &str,
        normalized: &str,
        settings: &Settings,
        window: (Duration, Duration),
        producer: F,
        encode: Encoder<'_, T>,
    ) -> Result<Fetched<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (_, race_condition_ttl) = window;
        let current = if settings.force {
            Resolved::Absent
        } else {
            self.tolerate(CacheOperation::Fetch, canonical, self.remote_get(normalized).await, || {
                Resolved::Absent
            })?
        };

        let Resolved::Present(entry) = current else {
            return self
                .regenerate(canonical, normalized, settings, window, producer, encode, CacheActivity::Miss)
                .await;
        };

        if !entry.flags().contains(Flags::GUARDED) {
            return Ok(Fetched::cached(entry, CacheActivity::Hit));
        }

        let envelope = Envelope::decode(&codec::decompress(entry.payload().to_vec(), entry.flags())?)?;
        match envelope.state(self.now_millis(), race_condition_ttl) {
            Freshness::Fresh => Ok(Fetched::cached(entry, CacheActivity::Hit)),
            Freshness::Claimed => Ok(Fetched::cached(entry, CacheActivity::Stale)),
            Freshness::Stale => {
                let Some(_claim) = self.store().claims.try_claim(normalized) else {
                    return Ok(Fetched::cached(entry, CacheActivity::Stale));
                };

                // Without the marker other processes may regenerate too; recompute anyway.
                let marked = self
                    .mark_extended(canonical, normalized, envelope, entry.flags(), settings, race_condition_ttl)
                    .await;
                let activity = if marked { CacheActivity::Regenerated } else { CacheActivity::Miss };
                self.regenerate(canonical, normalized, settings, window, producer, encode, activity)
                    .await
            }
            Freshness::Expired => {
                self.regenerate(canonical, normalized, settings, window, producer, encode, CacheActivity::Miss)
                    .await
            }
        }
    }

    /// Writes the envelope back claimed until `now + race_condition_ttl`, returning whether
    /// it stuck.
    ///
    /// The marker lives for twice the tolerance so a claim that overruns its deadline can
    /// still be taken over by the next caller.
    async fn mark_extended(
        &self,
        canonical: &str,
        normalized: &str,
        envelope: Envelope,
        flags: Flags,
        settings: &Settings,
        race_condition_ttl: Duration,
    ) -> bool {
        let marked = envelope.claimed(self.now_millis(), race_condition_ttl);
        let flags = flags.without(Flags::COMPRESSED);
        let ttl = race_condition_ttl.saturating_mul(2);
        let Ok(entry) = self.seal(marked.encode(), flags, Some(ttl), settings) else {
            return false;
        };

        match self.store().remote.set(normalized, entry).await {
            Ok(accepted) => accepted,
            Err(error) => {
                self.store()
                    .telemetry
                    .record(CacheOperation::Fetch, CacheActivity::Error, Some(canonical), None, Some(&error));
                false
            }
        }
    }

    /// Produces a value and writes it in a fresh envelope.
    #[expect(clippy::too_many_arguments, reason = "internal step sharing the fetch context")]
    async fn regenerate<T, F, Fut>(
        &self,
        canonical: &str,
        normalized: &str,
        settings: &Settings,
        (expires_in, race_condition_ttl): (Duration, Duration),
        producer: F,
        encode: Encoder<'_, T>,
        activity: CacheActivity,
    ) -> Result<Fetched<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let value = producer().await;
        let (body, flags) = encode(&value)?;
        let envelope = Envelope {
            expires_at_ms: self.now_millis().saturating_add(millis(expires_in)),
            extended: false,
            body,
        };
        let entry: Entry = self.seal(
            envelope.encode(),
            flags | Flags::GUARDED,
            Some(expires_in.saturating_add(race_condition_ttl)),
            settings,
        )?;

        self.tolerate(CacheOperation::Fetch, canonical, self.put(normalized, entry.clone()).await, || {
            (false, CacheActivity::Error)
        })?;

        Ok(Fetched {
            entry,
            produced: Some(value),
            activity,
        })
    }
}
