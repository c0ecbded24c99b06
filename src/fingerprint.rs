//! Deterministic cache fingerprints.
//!
//! The fingerprint covers exactly the work-defining fields of a request:
//! family, script and input bytes. Id, timeout, requester identity and the
//! echoed caller context are excluded, so byte-identical work submitted by
//! different callers (or re-submitted with a different budget) shares one
//! cache entry. Fields are length-prefixed before hashing so no two field
//! combinations can collide by concatenation.

use std::fmt;
use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::types::TaskRequest;

/// A cache key derived from a request's work-defining fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The fingerprint as a lowercase hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the fingerprint for a request.
///
/// # Examples
///
/// ```
/// use taskmill::fingerprint::fingerprint;
/// use taskmill::types::TaskRequest;
///
/// let a = TaskRequest::new("echo", "echo", b"x".to_vec());
/// let b = TaskRequest::new("echo", "echo", b"x".to_vec()).with_user("someone-else");
/// assert_eq!(fingerprint(&a), fingerprint(&b));
/// ```
pub fn fingerprint(request: &TaskRequest) -> Fingerprint {
    let mut hasher = Sha256::new();
    for field in [
        request.family.as_bytes(),
        request.script.as_bytes(),
        request.input.as_slice(),
    ] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Fingerprint(hex)
}
