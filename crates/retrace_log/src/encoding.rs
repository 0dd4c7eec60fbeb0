//! Canonical encoding for payload sections.
//!
//! Uses postcard for byte-stable encoding.

use serde::{Deserialize, Serialize};

/// Trait for canonical serialization
pub trait CanonicalEncode: Serialize {
    /// Encode to canonical bytes
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized
    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        postcard::to_allocvec(self).map_err(|_| EncodeError::Unserializable)
    }
}

/// Trait for canonical deserialization
pub trait CanonicalDecode<'de>: Deserialize<'de> {
    /// Decode from canonical bytes
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid encoding
    fn decode(data: &'de [u8]) -> Result<Self, DecodeError>
    where
        Self: Sized,
    {
        postcard::from_bytes(data).map_err(|_| DecodeError::InvalidEncoding)
    }
}

impl<'de, T: Deserialize<'de>> CanonicalDecode<'de> for T {}

/// Encoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// Value could not be serialized
    #[error("Value cannot be canonically encoded")]
    Unserializable,
}

/// Decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Invalid encoding
    #[error("Invalid canonical encoding")]
    InvalidEncoding,
}

impl From<DecodeError> for retrace_core::CoreError {
    fn from(_: DecodeError) -> Self {
        retrace_core::CoreError::InvalidEncoding
    }
}

impl From<EncodeError> for retrace_core::CoreError {
    fn from(_: EncodeError) -> Self {
        retrace_core::CoreError::InvalidEncoding
    }
}
