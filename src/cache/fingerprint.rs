//! Content fingerprints for deriving cache keys from structured inputs.

use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;

/// Hashes the JSON form of `input` with XXH3-64.
pub fn fingerprint<T: Serialize + ?Sized>(input: &T) -> Result<u64> {
    let bytes = serde_json::to_vec(input)?;
    Ok(xxh3_64(&bytes))
}

/// Builds a `namespace:<16 hex digits>` cache key for `input`.
pub fn fingerprint_key<T: Serialize + ?Sized>(namespace: &str, input: &T) -> Result<String> {
    Ok(format!("{}:{:016x}", namespace, fingerprint(input)?))
}
