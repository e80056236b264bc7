//! Content hashing, path-alias keys and download tokens

use crate::error::StorageError;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncReadExt;

/// Read buffer used while hashing files
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Operator-selected content hash. Not negotiated per request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    /// Hex digest of an in-memory buffer
    pub fn hash_bytes(self, data: &[u8]) -> String {
        match self {
            HashAlgorithm::Md5 => hex::encode(Md5::digest(data)),
            HashAlgorithm::Sha1 => hex::encode(Sha1::digest(data)),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }

    /// Hex digest of a file, read in chunks
    pub async fn hash_file(self, path: &Path) -> Result<String, StorageError> {
        match self {
            HashAlgorithm::Md5 => digest_file::<Md5>(path).await,
            HashAlgorithm::Sha1 => digest_file::<Sha1>(path).await,
            HashAlgorithm::Sha256 => digest_file::<Sha256>(path).await,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        };
        f.write_str(name)
    }
}

async fn digest_file<D: Digest>(path: &Path) -> Result<String, StorageError> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex MD5 of a string
pub fn md5_hex(s: &str) -> String {
    hex::encode(Md5::digest(s.as_bytes()))
}

/// Alias key for a relative full path (`files/.../name`).
///
/// Always MD5 regardless of the content algorithm, so aliases stay stable
/// when the operator switches algorithms.
pub fn path_key(full_path: &str) -> String {
    md5_hex(full_path)
}

/// Token granting a download of `content_hash` at `timestamp`
pub fn download_token(content_hash: &str, timestamp: &str) -> String {
    md5_hex(&format!("{}{}", content_hash, timestamp))
}

/// Check a download token. `timestamp` must lie within `expire_secs` of `now`.
pub fn verify_token(
    token: &str,
    content_hash: &str,
    timestamp: &str,
    now: i64,
    expire_secs: u64,
) -> Result<(), StorageError> {
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| StorageError::Forbidden("invalid timestamp".to_string()))?;
    let window = i64::try_from(expire_secs).unwrap_or(i64::MAX);
    if ts.saturating_sub(now).saturating_abs() > window {
        return Err(StorageError::Forbidden("timestamp expired".to_string()));
    }
    if download_token(content_hash, timestamp) != token {
        return Err(StorageError::Forbidden("invalid token".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            HashAlgorithm::Md5.hash_bytes(b"hello"),
            "5d41402abc4b2a76b9719d911017c592"
        );
        assert_eq!(
            HashAlgorithm::Sha1.hash_bytes(b"hello"),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(HashAlgorithm::Sha256.hash_bytes(b"hello").len(), 64);
    }

    #[tokio::test]
    async fn test_file_digest_matches_buffer_digest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blob.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        for alg in [HashAlgorithm::Md5, HashAlgorithm::Sha1, HashAlgorithm::Sha256] {
            assert_eq!(alg.hash_file(&path).await.unwrap(), alg.hash_bytes(&data));
        }
    }

    #[test]
    fn test_token_window() {
        let token = download_token("abc123", "1000");

        assert!(verify_token(&token, "abc123", "1000", 1100, 600).is_ok());
        assert!(verify_token(&token, "abc123", "1000", 2000, 600).is_err());
        assert!(verify_token(&token, "other", "1000", 1100, 600).is_err());
        assert!(verify_token(&token, "abc123", "soon", 1100, 600).is_err());
    }

    #[test]
    fn test_token_window_extremes() {
        let token = download_token("abc123", "1000");
        assert!(verify_token(&token, "abc123", "1000", 1100, u64::MAX).is_ok());
        assert!(verify_token(&token, "abc123", "1000", i64::MAX, 600).is_err());

        let far_past = i64::MIN.to_string();
        let token = download_token("abc123", &far_past);
        assert!(verify_token(&token, "abc123", &far_past, i64::MAX, u64::MAX).is_ok());
        assert!(verify_token(&token, "abc123", &far_past, 1100, 600).is_err());
    }
}
