// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for cache operations.

use std::fmt;

/// The class of failure behind an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The remote tier could not be reached or answered with a protocol failure.
    RemoteUnavailable,
    /// Stored bytes could not be decoded, decompressed, or used as a counter.
    CorruptValue,
    /// A producer tried to resolve the very key it is producing.
    ReentrantFetch,
    /// A caller value could not be serialized.
    Codec,
}

impl ErrorKind {
    /// Returns a stable, human-readable name for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoteUnavailable => "remote unavailable",
            Self::CorruptValue => "corrupt value",
            Self::ReentrantFetch => "reentrant fetch",
            Self::Codec => "codec failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error from a cache operation.
///
/// Errors are opaque apart from their [`ErrorKind`]; use [`std::error::Error::source()`]
/// to reach the underlying cause.
///
/// # Example
///
/// ```
/// use duocache_remote::{Error, ErrorKind};
///
/// let error = Error::from_cause(ErrorKind::RemoteUnavailable, "connection refused");
/// assert_eq!(error.kind(), ErrorKind::RemoteUnavailable);
/// ```
#[ohno::error]
#[display("cache operation failed: {kind}")]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    /// Creates an error of the given kind without an underlying cause.
    ///
    /// This is the public API for reporting failures from remote stores and codecs
    /// implemented in other crates.
    ///
    /// # Examples
    ///
    /// ```
    /// use duocache_remote::{Error, ErrorKind};
    ///
    /// let error = Error::with_kind(ErrorKind::CorruptValue);
    /// assert_eq!(error.kind(), ErrorKind::CorruptValue);
    /// ```
    #[must_use]
    pub fn with_kind(kind: ErrorKind) -> Self {
        Self::new(kind)
    }

    /// Creates an error of the given kind wrapping `cause`.
    ///
    /// # Examples
    ///
    /// ```
    /// use duocache_remote::{Error, ErrorKind};
    ///
    /// let error = Error::from_cause(ErrorKind::RemoteUnavailable, "connection reset");
    /// assert!(error.is_remote_unavailable());
    /// assert!(error.to_string().contains("connection reset"));
    /// ```
    pub fn from_cause(kind: ErrorKind, cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(kind, cause)
    }

    /// Returns the class of failure.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns `true` for failures of the remote tier itself.
    #[must_use]
    pub fn is_remote_unavailable(&self) -> bool {
        self.kind == ErrorKind::RemoteUnavailable
    }
}

/// A specialized [`Result`] type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
