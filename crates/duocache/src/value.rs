// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// A value read from the cache.
///
/// Structured values were written through the codec and have been deserialized. Raw values
/// are the stored bytes exactly as another client speaking the remote protocol would see
/// them: the text of a raw write or counter, or the codec bytes of a structured write read
/// in raw mode.
///
/// # Examples
///
/// ```
/// use duocache::Value;
///
/// let value: Value<i32> = Value::Raw(b"2".to_vec());
/// assert_eq!(value.as_str(), Some("2"));
/// assert_eq!(value.into_structured(), None);
///
/// let value = Value::Structured(2);
/// assert_eq!(value.into_structured(), Some(2));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value<V> {
    /// A deserialized structured value.
    Structured(V),
    /// Stored bytes returned without deserialization.
    Raw(Vec<u8>),
}

impl<V> Value<V> {
    /// Returns the structured value, or `None` for raw bytes.
    #[must_use]
    pub fn into_structured(self) -> Option<V> {
        match self {
            Self::Structured(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    /// Returns the structured value by reference, or `None` for raw bytes.
    #[must_use]
    pub fn as_structured(&self) -> Option<&V> {
        match self {
            Self::Structured(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    /// Returns the raw bytes, or `None` for a structured value.
    #[must_use]
    pub fn as_raw(&self) -> Option<&[u8]> {
        match self {
            Self::Structured(_) => None,
            Self::Raw(bytes) => Some(bytes),
        }
    }

    /// Returns the raw bytes as text when they are valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_raw().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// Returns `true` for raw bytes.
    #[must_use]
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw(_))
    }
}
