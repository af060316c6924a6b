//! Loading configuration files and key material.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Read a JSON file into `T`. Fields missing from the file take the
/// type's serde defaults.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Serialization(format!("{}: {}", path.display(), e)))
}

/// Parse a 32-byte key written as 64 hex digits.
pub fn parse_hex_key(text: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(text.trim()).map_err(Error::crypto)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| Error::crypto(format!("expected 32 key bytes, got {}", b.len())))
}
