// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Cache key canonicalization and remote key normalization.

use std::{
    collections::{BTreeMap, HashMap},
    hash::BuildHasher,
};

use xxhash_rust::xxh3::xxh3_128;

/// The longest key the remote tier accepts, in bytes.
pub const MAX_KEY_LENGTH: usize = 250;

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";
const DIGEST_MARKER: &str = ":hash:";
const DIGEST_HEX_LENGTH: usize = 32;
const DIGEST_PREFIX_LENGTH: usize = MAX_KEY_LENGTH - DIGEST_MARKER.len() - DIGEST_HEX_LENGTH;

/// A value that can be reduced to a canonical cache key.
///
/// Canonicalization is deterministic: equal logical keys always produce the same string.
/// Scalars render as their text, sequences join their elements with `/`, and maps render
/// `key=value` pairs sorted by key text and joined with `/`. Keys are case sensitive.
///
/// Implement this trait for domain types that know how to name themselves in a cache.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
///
/// use duocache::CacheKey;
///
/// assert_eq!("users".cache_key(), "users");
/// assert_eq!(["fu", "foo"].cache_key(), "fu/foo");
/// assert_eq!(("user", 42).cache_key(), "user/42");
///
/// let map = BTreeMap::from([("fu", 2), ("foo", 1)]);
/// assert_eq!(map.cache_key(), "foo=1/fu=2");
/// ```
///
/// ```
/// use duocache::CacheKey;
///
/// struct Account {
///     id: u64,
/// }
///
/// impl CacheKey for Account {
///     fn cache_key(&self) -> String {
///         format!("account/{}", self.id)
///     }
/// }
///
/// assert_eq!(Account { id: 7 }.cache_key(), "account/7");
/// ```
pub trait CacheKey {
    /// Returns the canonical key string.
    fn cache_key(&self) -> String;
}

impl CacheKey for str {
    fn cache_key(&self) -> String {
        self.to_string()
    }
}

impl CacheKey for String {
    fn cache_key(&self) -> String {
        self.clone()
    }
}

impl<T: CacheKey + ?Sized> CacheKey for &T {
    fn cache_key(&self) -> String {
        (**self).cache_key()
    }
}

macro_rules! display_cache_key {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CacheKey for $ty {
                fn cache_key(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

display_cache_key!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, bool, char);

impl<T: CacheKey> CacheKey for [T] {
    fn cache_key(&self) -> String {
        join(self.iter().map(CacheKey::cache_key))
    }
}

impl<T: CacheKey> CacheKey for Vec<T> {
    fn cache_key(&self) -> String {
        self.as_slice().cache_key()
    }
}

impl<T: CacheKey, const N: usize> CacheKey for [T; N] {
    fn cache_key(&self) -> String {
        self.as_slice().cache_key()
    }
}

impl<A: CacheKey, B: CacheKey> CacheKey for (A, B) {
    fn cache_key(&self) -> String {
        join([self.0.cache_key(), self.1.cache_key()])
    }
}

impl<A: CacheKey, B: CacheKey, C: CacheKey> CacheKey for (A, B, C) {
    fn cache_key(&self) -> String {
        join([self.0.cache_key(), self.1.cache_key(), self.2.cache_key()])
    }
}

impl<K: CacheKey, V: CacheKey> CacheKey for BTreeMap<K, V> {
    fn cache_key(&self) -> String {
        pairs(self.iter())
    }
}

impl<K: CacheKey, V: CacheKey, S: BuildHasher> CacheKey for HashMap<K, V, S> {
    fn cache_key(&self) -> String {
        pairs(self.iter())
    }
}

fn join(parts: impl IntoIterator<Item = String>) -> String {
    parts.into_iter().collect::<Vec<_>>().join("/")
}

fn pairs<'a, K, V>(entries: impl Iterator<Item = (&'a K, &'a V)>) -> String
where
    K: CacheKey + 'a,
    V: CacheKey + 'a,
{
    let mut rendered: Vec<(String, String)> = entries.map(|(k, v)| (k.cache_key(), v.cache_key())).collect();
    rendered.sort();
    join(rendered.into_iter().map(|(k, v)| format!("{k}={v}")))
}

/// Converts a canonical key into the form handed to the remote tier.
///
/// Control bytes, whitespace, `%` and non-ASCII bytes are percent-escaped so arbitrary text
/// is a legal remote key. Escaped keys longer than [`MAX_KEY_LENGTH`] are shortened to a
/// prefix followed by an xxh3-128 digest of the full escaped key, so the same logical key
/// always maps to the same remote key.
///
/// # Examples
///
/// ```
/// use duocache::{MAX_KEY_LENGTH, remote_key};
///
/// assert_eq!(remote_key("a b%"), "a%20b%25");
///
/// let long = "x".repeat(1000);
/// let normalized = remote_key(&long);
/// assert_eq!(normalized.len(), MAX_KEY_LENGTH);
/// assert_eq!(normalized, remote_key(&long));
/// ```
#[must_use]
pub fn remote_key(canonical: &str) -> String {
    let mut escaped = String::with_capacity(canonical.len());
    for byte in canonical.bytes() {
        if byte <= 0x20 || byte == b'%' || byte >= 0x7F {
            escaped.push('%');
            escaped.push(char::from(HEX_DIGITS[usize::from(byte >> 4)]));
            escaped.push(char::from(HEX_DIGITS[usize::from(byte & 0x0F)]));
        } else {
            escaped.push(char::from(byte));
        }
    }

    if escaped.len() <= MAX_KEY_LENGTH {
        return escaped;
    }

    let digest = xxh3_128(escaped.as_bytes());
    // The escaped key is pure ASCII, so any byte index is a char boundary.
    format!("{}{DIGEST_MARKER}{digest:032x}", &escaped[..DIGEST_PREFIX_LENGTH])
}
