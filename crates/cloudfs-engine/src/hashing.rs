//! SHA-256 content fingerprints.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use cloudfs_core::CloudfsResult;

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streaming file fingerprint; never loads the whole file.
pub fn sha256_file(path: &Path) -> CloudfsResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
