//! Content fingerprints for folder image sets.
//!
//! A fingerprint is the cache key for a folder's analysis. It is derived
//! from the folder's direct image children only:
//!
//! ```text
//! per image:  "{name}:{sha256(head ++ tail)}:{byte_size}:{last_modified_ms}"
//!             (just "{name}" when the blob is not available)
//! manifest:   sorted descriptors joined with '\n'
//! result:     sha256(manifest), lowercase hex
//! ```
//!
//! Only the first and last [`SAMPLE_WINDOW`] bytes of each blob are hashed.
//! Two files that differ only in bytes outside those windows (and share
//! name, size, and mtime) produce the same fingerprint; this is accepted in
//! exchange for not reading whole photos on every run.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{FolderNode, LeafFile};

/// Bytes sampled from each end of a blob.
pub const SAMPLE_WINDOW: usize = 64 * 1024;

/// Digest recorded for zero-byte files instead of hashing empty input.
pub const EMPTY_BLOB_DIGEST: &str = "empty";

const MANIFEST_SEPARATOR: &str = "\n";

/// SHA-256 fingerprint of a folder's image set, as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint of `folder`'s direct images.
///
/// Nested subfolders do not contribute; each analyzed folder owns its own
/// cache entry.
pub fn fingerprint(folder: &FolderNode) -> Fingerprint {
    let mut descriptors: Vec<String> = folder.direct_images().map(|f| file_descriptor(f)).collect();
    descriptors.sort();

    let manifest = descriptors.join(MANIFEST_SEPARATOR);
    Fingerprint(sha256_hex(manifest.as_bytes()))
}

/// Descriptor string for one image.
pub fn file_descriptor(file: &LeafFile) -> String {
    match &file.blob {
        Some(blob) => format!(
            "{}:{}:{}:{}",
            file.name,
            sample_digest(blob.bytes()),
            blob.len(),
            blob.last_modified_ms()
        ),
        None => file.name.clone(),
    }
}

/// Hash of the head and tail windows of `data`.
///
/// Blobs no larger than [`SAMPLE_WINDOW`] are hashed whole.
pub fn sample_digest(data: &[u8]) -> String {
    if data.is_empty() {
        return EMPTY_BLOB_DIGEST.to_string();
    }
    if data.len() <= SAMPLE_WINDOW {
        return sha256_hex(data);
    }

    let mut hasher = Sha256::new();
    hasher.update(&data[..SAMPLE_WINDOW]);
    hasher.update(&data[data.len() - SAMPLE_WINDOW..]);
    format!("{:x}", hasher.finalize())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
