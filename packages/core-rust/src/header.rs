//! Request header block as delivered by the transport.
//!
//! Transports may hand over headers before the request body is decoded, so
//! the header is either an already-decoded string map or the raw `MsgPack`
//! bytes of one. Decoding is fallible and callers treat failure as "no
//! header", never as a request failure.

use std::borrow::Cow;
use std::collections::HashMap;

use bytes::Bytes;

/// Primary header key carrying the target service identifier.
pub const SERVICE: &str = "service";
/// Fallback header key consulted when `SERVICE` is absent.
pub const TARGET_SERVICE: &str = "target_service";

/// Errors from decoding a raw header block.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("malformed header block: {0}")]
    Malformed(#[from] rmp_serde::decode::Error),
}

#[derive(Debug, Clone)]
pub enum RequestHeader {
    Decoded(HashMap<String, String>),
    /// `MsgPack`-encoded `map<string, string>`.
    Raw(Bytes),
}

impl RequestHeader {
    /// Borrow or decode the header map.
    ///
    /// # Errors
    ///
    /// Returns `HeaderError::Malformed` if raw bytes are not a `MsgPack`
    /// string map.
    pub fn decode(&self) -> Result<Cow<'_, HashMap<String, String>>, HeaderError> {
        match self {
            Self::Decoded(map) => Ok(Cow::Borrowed(map)),
            Self::Raw(bytes) => Ok(Cow::Owned(rmp_serde::from_slice(bytes)?)),
        }
    }

    /// The declared target service, preferring `SERVICE` over `TARGET_SERVICE`.
    ///
    /// # Errors
    ///
    /// Propagates decoding failures from [`RequestHeader::decode`].
    pub fn service_id(&self) -> Result<Option<String>, HeaderError> {
        let map = self.decode()?;
        Ok(service_id_of(&map).map(str::to_owned))
    }
}

impl From<HashMap<String, String>> for RequestHeader {
    fn from(map: HashMap<String, String>) -> Self {
        Self::Decoded(map)
    }
}

/// Service id lookup over an already-decoded map.
#[must_use]
pub fn service_id_of(map: &HashMap<String, String>) -> Option<&str> {
    map.get(SERVICE)
        .or_else(|| map.get(TARGET_SERVICE))
        .map(String::as_str)
}
