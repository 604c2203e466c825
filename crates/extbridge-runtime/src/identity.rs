//! Content hashing used to name and deduplicate artifacts.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let data = tokio::fs::read(path).await?;
    Ok(sha256_hex(&data))
}

/// Stable repository id: hash of the upper-cased normalized URL.
pub fn repository_id(normalized_url: &str) -> String {
    sha256_hex(normalized_url.to_uppercase().as_bytes())
}
