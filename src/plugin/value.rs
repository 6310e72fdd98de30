//! Opaque value transport.
//!
//! User messages and aggregatable values cross actor boundaries as tagged
//! byte blobs; the plugin's marshalers are the only code that looks inside.
//! The codec helpers below cover the primitive payloads most plugins need.

use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A marshaled user value: a type tag plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnyValue {
    /// Identifies the payload encoding, checked on decode.
    pub type_url: String,
    /// Opaque serialized payload.
    pub value: Vec<u8>,
}

impl AnyValue {
    /// Build a value from a tag and an already-encoded payload.
    pub fn new(type_url: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            type_url: type_url.into(),
            value,
        }
    }
}

const U32_TYPE_URL: &str = "grapnel/u32";
const U64_TYPE_URL: &str = "grapnel/u64";
const STRING_TYPE_URL: &str = "grapnel/string";

fn encode<T: Serialize>(type_url: &str, v: &T) -> AnyValue {
    // serde_json never fails on these primitive payloads
    let value = serde_json::to_vec(v).expect("primitive payload serializes");
    AnyValue::new(type_url, value)
}

fn decode<T: DeserializeOwned>(type_url: &str, pb: &AnyValue) -> anyhow::Result<T> {
    if pb.type_url != type_url {
        bail!(
            "type mismatch: expected {}, got {}",
            type_url,
            pb.type_url
        );
    }
    serde_json::from_slice(&pb.value).with_context(|| format!("decoding {type_url}"))
}

/// Encode a `u32` payload.
pub fn encode_u32(v: u32) -> AnyValue {
    encode(U32_TYPE_URL, &v)
}

/// Decode a `u32` payload, checking the type tag.
pub fn decode_u32(pb: &AnyValue) -> anyhow::Result<u32> {
    decode(U32_TYPE_URL, pb)
}

/// Encode a `u64` payload.
pub fn encode_u64(v: u64) -> AnyValue {
    encode(U64_TYPE_URL, &v)
}

/// Decode a `u64` payload, checking the type tag.
pub fn decode_u64(pb: &AnyValue) -> anyhow::Result<u64> {
    decode(U64_TYPE_URL, pb)
}

/// Encode a string payload.
pub fn encode_string(v: &str) -> AnyValue {
    encode(STRING_TYPE_URL, &v)
}

/// Decode a string payload, checking the type tag.
pub fn decode_string(pb: &AnyValue) -> anyhow::Result<String> {
    decode(STRING_TYPE_URL, pb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trips() {
        assert_eq!(decode_u32(&encode_u32(42)).unwrap(), 42);
        assert_eq!(decode_u64(&encode_u64(u64::MAX)).unwrap(), u64::MAX);
        assert_eq!(decode_string(&encode_string("v1")).unwrap(), "v1");
    }

    #[test]
    fn type_tag_is_checked() {
        let v = encode_u32(1);
        assert!(decode_u64(&v).is_err());
        assert!(decode_string(&v).is_err());
    }
}
