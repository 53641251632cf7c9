// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{fmt, ops::BitOr, time::Duration};

/// Storage flags attached to a remote [`Entry`].
///
/// Flags travel with the payload the same way memcached item flags do: the remote tier
/// stores them verbatim and hands them back on every read.
///
/// # Examples
///
/// ```
/// use duocache_remote::Flags;
///
/// let flags = Flags::RAW | Flags::COMPRESSED;
/// assert!(flags.contains(Flags::RAW));
/// assert!(!flags.contains(Flags::GUARDED));
/// assert_eq!(flags.without(Flags::RAW), Flags::COMPRESSED);
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
    /// No flags: the payload holds codec output.
    pub const NONE: Self = Self(0);
    /// The payload is a string scalar written in raw mode.
    pub const RAW: Self = Self(1);
    /// The payload is zstd-compressed.
    pub const COMPRESSED: Self = Self(1 << 1);
    /// The payload is a stale-guard envelope around codec output.
    pub const GUARDED: Self = Self(1 << 2);

    /// Creates flags from their wire representation.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the wire representation.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns these flags with every flag in `other` cleared.
    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (flag, name) in [(Self::RAW, "RAW"), (Self::COMPRESSED, "COMPRESSED"), (Self::GUARDED, "GUARDED")] {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// The value container exchanged with the remote tier.
///
/// An `Entry` is a byte payload plus the [`Flags`] describing how to interpret it, and an
/// optional TTL the remote tier applies when the entry is written. The TTL is write-side
/// metadata only: remote stores do not report the remaining lifetime back on reads.
///
/// # Examples
///
/// ```
/// use duocache_remote::{Entry, Flags};
/// use std::time::Duration;
///
/// let entry = Entry::raw("42").with_ttl(Some(Duration::from_secs(60)));
/// assert_eq!(entry.payload(), b"42");
/// assert_eq!(entry.flags(), Flags::RAW);
/// assert_eq!(entry.ttl(), Some(Duration::from_secs(60)));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    payload: Vec<u8>,
    flags: Flags,
    ttl: Option<Duration>,
}

impl Entry {
    /// Creates an entry holding codec output, without flags or TTL.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            flags: Flags::NONE,
            ttl: None,
        }
    }

    /// Creates a raw entry holding the given text.
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            payload: text.into().into_bytes(),
            flags: Flags::RAW,
            ttl: None,
        }
    }

    /// Returns this entry with the given flags replacing the current ones.
    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Returns this entry with the given TTL; `None` means the entry never expires.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the entry and returns the payload bytes.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Replaces the payload, keeping flags and TTL.
    pub fn set_payload(&mut self, payload: impl Into<Vec<u8>>) {
        self.payload = payload.into();
    }

    /// Returns the storage flags.
    #[must_use]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Returns the TTL requested for this entry, if any.
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}
