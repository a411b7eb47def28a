//! Content fingerprint used as the sole change-detection signal.

use sha2::{Digest, Sha256};

use crate::{FINGERPRINT_COLUMN, TIMESTAMP_COLUMN};

/// Rendering of an absent value. Participates in the hash, so changing it
/// changes every fingerprint in an existing log.
pub const NULL_TOKEN: &str = "";

/// Columns that never feed the fingerprint: the fingerprint itself and the
/// observation time. Any volatile column added to the schema must join this
/// list or re-runs stop being idempotent.
pub const FINGERPRINT_EXCLUDED: [&str; 2] = [FINGERPRINT_COLUMN, TIMESTAMP_COLUMN];

/// SHA-256 over the ordered `(name, value)` tuple, skipping `exclude`.
///
/// Names and values are length-prefixed (u64 LE) so distinct tuples cannot
/// produce the same byte stream. Returns 64 lowercase hex characters.
pub fn fingerprint<'n, 'v, I>(fields: I, exclude: &[&str]) -> String
where
    I: IntoIterator<Item = (&'n str, Option<&'v str>)>,
{
    let mut hasher = Sha256::new();
    for (name, value) in fields {
        if exclude.iter().any(|excluded| *excluded == name) {
            continue;
        }
        absorb(&mut hasher, name);
        absorb(&mut hasher, value.unwrap_or(NULL_TOKEN));
    }
    hex::encode(hasher.finalize())
}

fn absorb(hasher: &mut Sha256, text: &str) {
    hasher.update((text.len() as u64).to_le_bytes());
    hasher.update(text.as_bytes());
}
