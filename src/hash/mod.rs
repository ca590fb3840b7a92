//! Streaming content digest with cooperative cancellation.
//!
//! Streams a file in fixed-size blocks through a collision-resistant
//! cryptographic hash (SHA-256, fixed throughout the system per spec §4.1)
//! and produces a hex digest. The same algorithm is used for source and
//! destination verification so the two sides are always comparable.

use crate::error::FileOpError;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Block size used when streaming a file through the hasher.
const BLOCK_SIZE: usize = 1024 * 1024; // 1 MiB

/// The fixed digest algorithm identifier, used in CSV manifests (spec §6).
pub const ALGORITHM_NAME: &str = "SHA256";

/// Stream `path` and produce its hex digest, checking `cancel` between
/// blocks. Returns [`FileOpError::Cancelled`] if cancellation is observed
/// before the read completes. No partial digest is ever returned.
pub async fn digest(path: &Path, cancel: &CancellationToken) -> Result<String, FileOpError> {
    let file = tokio::fs::File::open(path).await.map_err(map_io_err)?;
    let mut reader = tokio::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BLOCK_SIZE];

    loop {
        if cancel.is_cancelled() {
            return Err(FileOpError::Cancelled);
        }

        let n = tokio::select! {
            result = reader.read(&mut buf) => result.map_err(map_io_err)?,
            _ = cancel.cancelled() => return Err(FileOpError::Cancelled),
        };

        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    if cancel.is_cancelled() {
        return Err(FileOpError::Cancelled);
    }

    Ok(hex_encode(&hasher.finalize()))
}

/// Synchronous variant for contexts that are already off the async
/// executor (e.g. `spawn_blocking` bodies in the Scanner).
pub fn digest_blocking(path: &Path) -> Result<String, FileOpError> {
    use std::io::Read;

    let file = std::fs::File::open(path).map_err(map_io_err)?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BLOCK_SIZE];

    loop {
        let n = reader.read(&mut buf).map_err(map_io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(&mut s, "{:02x}", b).expect("writing into a String cannot fail");
    }
    s
}

fn map_io_err(e: std::io::Error) -> FileOpError {
    match e.kind() {
        std::io::ErrorKind::NotFound => FileOpError::InvalidSource(e.to_string()),
        std::io::ErrorKind::PermissionDenied => FileOpError::PermissionDenied(e.to_string()),
        std::io::ErrorKind::TimedOut => FileOpError::Timeout(std::time::Duration::from_secs(30)),
        _ => FileOpError::Internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn digest_matches_known_sha256() {
        let mut file = NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(b"aaaaaaaaaa").unwrap();
        file.flush().unwrap();

        let cancel = CancellationToken::new();
        let d = digest(file.path(), &cancel).await.unwrap();
        // sha256("aaaaaaaaaa")
        assert_eq!(
            d,
            "bf2cb58a68f684d95a3b78ef8f661c9a4e5b09e82cc8f9cc88cce90528caeb27"
        );
    }

    #[tokio::test]
    async fn same_content_same_digest_different_paths() {
        let mut f1 = NamedTempFile::new().unwrap();
        let mut f2 = NamedTempFile::new().unwrap();
        use std::io::Write;
        f1.write_all(b"identical content").unwrap();
        f2.write_all(b"identical content").unwrap();
        f1.flush().unwrap();
        f2.flush().unwrap();

        let cancel = CancellationToken::new();
        let d1 = digest(f1.path(), &cancel).await.unwrap();
        let d2 = digest(f2.path(), &cancel).await.unwrap();
        assert_eq!(d1, d2);
    }

    #[tokio::test]
    async fn cancelled_token_yields_cancelled_error() {
        let mut file = NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(&vec![0u8; 1024 * 1024 * 8]).unwrap();
        file.flush().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = digest(file.path(), &cancel).await;
        assert!(matches!(result, Err(FileOpError::Cancelled)));
    }

    #[test]
    fn blocking_and_async_agree() {
        let mut file = NamedTempFile::new().unwrap();
        use std::io::Write;
        file.write_all(b"bbbbb").unwrap();
        file.flush().unwrap();

        let blocking = digest_blocking(file.path()).unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let cancel = CancellationToken::new();
        let async_digest = rt.block_on(digest(file.path(), &cancel)).unwrap();

        assert_eq!(blocking, async_digest);
    }
}
