//! Diff Codec: one mutation to and from a compact, versioned byte form.
//!
//! ```text
//! ┌─────────┬──────────────────────────────┐
//! │ version │ bincode(Mutation)            │
//! │ 1 byte  │ variable (varint lengths)    │
//! └─────────┴──────────────────────────────┘
//! ```
//!
//! The version byte is checked before anything else is parsed; an
//! unknown version is rejected outright. `ChildMove` carries two indices,
//! so it encodes to a handful of bytes regardless of subtree size.

use bincode::config;
use strata_core::Mutation;

use crate::error::{DecodeError, EncodeError};

/// Leading tag of every encoded mutation.
pub const FORMAT_VERSION: u8 = 0x01;

pub fn encode(mutation: &Mutation) -> Result<Vec<u8>, EncodeError> {
    let mut out = vec![FORMAT_VERSION];
    let body = bincode::serde::encode_to_vec(mutation, config::standard())
        .map_err(|e| EncodeError(e.to_string()))?;
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<Mutation, DecodeError> {
    let (&version, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let (mutation, read): (Mutation, usize) =
        bincode::serde::decode_from_slice(body, config::standard())
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    if read != body.len() {
        return Err(DecodeError::TrailingBytes(body.len() - read));
    }
    Ok(mutation)
}

/// Encode each mutation separately; used for snapshot payloads.
pub fn encode_batch(mutations: &[Mutation]) -> Result<Vec<Vec<u8>>, EncodeError> {
    mutations.iter().map(encode).collect()
}

/// Decode a batch, failing on the first bad entry.
pub fn decode_batch<B: AsRef<[u8]>>(encoded: &[B]) -> Result<Vec<Mutation>, DecodeError> {
    encoded.iter().map(|bytes| decode(bytes.as_ref())).collect()
}
