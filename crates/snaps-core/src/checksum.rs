use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::snap::SnapManifest;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("\"snap.manifest.json\" \"shasum\" field does not match computed shasum")]
pub struct ChecksumMismatch {
    pub expected: String,
    pub actual: String,
}

/// Base64 SHA-256 of the bundled source, as carried in `manifest.source.shasum`.
pub fn source_shasum(source_code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_code.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

pub fn verify_source(manifest: &SnapManifest, source_code: &str) -> Result<(), ChecksumMismatch> {
    let actual = source_shasum(source_code);
    if actual == manifest.source.shasum {
        return Ok(());
    }
    Err(ChecksumMismatch {
        expected: manifest.source.shasum.clone(),
        actual,
    })
}
