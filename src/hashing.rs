// 🔑 Key Derivation - deterministic hub keys and satellite hash diffs
//
// Both digests are SHA-256, hex encoded (64 lowercase characters). They are
// pure functions of their input so that re-running a load recognizes rows
// written by earlier runs.

use sha2::{Digest, Sha256};

/// Stand-in for a missing value inside a hash diff.
pub const NULL_SENTINEL: &str = "<null>";

/// Separator placed between attribute values before digesting.
///
/// Without it ("ab", "c") and ("a", "bc") would collide.
pub const DIFF_DELIMITER: &str = "||";

/// Hash key of a natural (business) key.
pub fn derive_hash_key(natural_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(natural_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash diff over descriptive attribute values, in registry order.
///
/// `None` maps to [`NULL_SENTINEL`] so the digest never depends on how a
/// missing value happened to be represented upstream.
pub fn derive_hash_diff<I, S>(ordered_values: I) -> String
where
    I: IntoIterator<Item = Option<S>>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();

    for (i, value) in ordered_values.into_iter().enumerate() {
        if i > 0 {
            hasher.update(DIFF_DELIMITER.as_bytes());
        }
        match value {
            Some(v) => hasher.update(v.as_ref().as_bytes()),
            None => hasher.update(NULL_SENTINEL.as_bytes()),
        }
    }

    format!("{:x}", hasher.finalize())
}
