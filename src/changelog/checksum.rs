//! Checksum calculation for changesets

use super::change::Change;
use sha2::{Digest, Sha256};

/// Calculate the SHA-256 checksum of a changeset's changes
///
/// Used to detect a changeset whose content was edited after it was
/// recorded as applied. Returns the lowercase hexadecimal digest.
pub fn calculate_checksum(changes: &[Change]) -> String {
    let mut hasher = Sha256::new();
    for (idx, change) in changes.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"\n");
        }
        hasher.update(change.canonical_text().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Compare a stored checksum with the one computed from the current changelog
pub fn checksums_match(stored_checksum: &str, current_checksum: &str) -> bool {
    stored_checksum.trim().eq_ignore_ascii_case(current_checksum.trim())
}
