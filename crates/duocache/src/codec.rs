// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured value serialization and the optional compression stage.

use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, ErrorKind, Flags, Result, options::Settings};

/// Converts structured values to and from the bytes stored in the remote tier.
///
/// The codec is only consulted for structured values; raw values bypass it entirely.
/// Serialization failures surface as [`ErrorKind::Codec`], and bytes that cannot be
/// deserialized surface as [`ErrorKind::CorruptValue`].
pub trait Codec: Send + Sync {
    /// Serializes a value to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented by this codec.
    fn serialize<V: Serialize + ?Sized>(&self, value: &V) -> Result<Vec<u8>>;

    /// Deserializes a value from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding of `V`.
    fn deserialize<V: DeserializeOwned>(&self, bytes: &[u8]) -> Result<V>;
}

/// The default codec, a compact binary encoding based on `postcard`.
///
/// # Examples
///
/// ```
/// use duocache::{Codec, PostcardCodec};
///
/// let codec = PostcardCodec;
/// let bytes = codec.serialize(&1_i32)?;
/// assert_eq!(bytes, [2]);
/// assert_eq!(codec.deserialize::<i32>(&bytes)?, 1);
/// # Ok::<(), duocache::Error>(())
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    fn serialize<V: Serialize + ?Sized>(&self, value: &V) -> Result<Vec<u8>> {
        postcard::to_allocvec(value).map_err(|e| Error::from_cause(ErrorKind::Codec, e))
    }

    fn deserialize<V: DeserializeOwned>(&self, bytes: &[u8]) -> Result<V> {
        postcard::from_bytes(bytes).map_err(|e| Error::from_cause(ErrorKind::CorruptValue, e))
    }
}

/// Compresses `payload` when the settings ask for it and it reaches the threshold.
pub(crate) fn compress(payload: Vec<u8>, flags: Flags, settings: &Settings) -> Result<(Vec<u8>, Flags)> {
    if !settings.compress || payload.len() < settings.compress_threshold {
        return Ok((payload, flags));
    }

    let compressed = zstd::encode_all(payload.as_slice(), 0).map_err(|e| Error::from_cause(ErrorKind::Codec, e))?;
    Ok((compressed, flags | Flags::COMPRESSED))
}

/// Reverses [`compress`] for a payload read back from the remote tier.
pub(crate) fn decompress(payload: Vec<u8>, flags: Flags) -> Result<Vec<u8>> {
    if !flags.contains(Flags::COMPRESSED) {
        return Ok(payload);
    }

    zstd::decode_all(payload.as_slice()).map_err(|e| Error::from_cause(ErrorKind::CorruptValue, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Options;

    fn settings(options: &Options) -> Settings {
        options.over(&Options::default())
    }

    #[test]
    fn postcard_round_trips_structured_values() {
        let codec = PostcardCodec;
        let value = (String::from("name"), vec![1_u32, 2, 3], Some(true));
        let bytes = codec.serialize(&value).expect("serialize");
        let back: (String, Vec<u32>, Option<bool>) = codec.deserialize(&bytes).expect("deserialize");
        assert_eq!(back, value);
    }

    #[test]
    fn truncated_bytes_are_corrupt() {
        let codec = PostcardCodec;
        let bytes = codec.serialize("a longer string").expect("serialize");
        let error = codec.deserialize::<String>(&bytes[..3]).expect_err("truncated input");
        assert_eq!(error.kind(), ErrorKind::CorruptValue);
    }

    #[test]
    fn compression_is_off_by_default() {
        let payload = vec![7_u8; 10_000];
        let (out, flags) = compress(payload.clone(), Flags::NONE, &settings(&Options::new())).expect("compress");
        assert_eq!(out, payload);
        assert_eq!(flags, Flags::NONE);
    }

    #[test]
    fn compression_respects_threshold() {
        let options = Options::new().compress(true).compress_threshold(100);

        let (small, flags) = compress(vec![1; 99], Flags::RAW, &settings(&options)).expect("compress");
        assert_eq!(small.len(), 99);
        assert_eq!(flags, Flags::RAW);

        let (large, flags) = compress(vec![1; 100], Flags::RAW, &settings(&options)).expect("compress");
        assert!(large.len() < 100);
        assert_eq!(flags, Flags::RAW | Flags::COMPRESSED);

        assert_eq!(decompress(large, flags).expect("decompress"), vec![1; 100]);
    }

    #[test]
    fn default_threshold_is_four_kib() {
        let options = Options::new().compress(true);
        let (_, below) = compress(vec![0; 4095], Flags::NONE, &settings(&options)).expect("compress");
        let (_, at) = compress(vec![0; 4096], Flags::NONE, &settings(&options)).expect("compress");
        assert_eq!(below, Flags::NONE);
        assert_eq!(at, Flags::COMPRESSED);
    }

    #[test]
    fn garbage_compressed_payload_is_corrupt() {
        let error = decompress(vec![1, 2, 3], Flags::COMPRESSED).expect_err("not zstd");
        assert_eq!(error.kind(), ErrorKind::CorruptValue);
    }
}
