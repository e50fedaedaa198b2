//! Argument signatures for `${sign(args)}` keys.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::invocation::canonicalize;

/// Number of digest bytes kept in a signature (rendered as twice as many hex
/// characters).
const SIGNATURE_BYTES: usize = 16;

/// Deterministic digest of a whole argument list.
///
/// The list is serialized as a canonical JSON array (object keys sorted at
/// every depth) and hashed with SHA-256. Equal arguments always produce the
/// same signature; reordering arguments changes it.
pub struct ArgumentSignature;

impl ArgumentSignature {
    /// Length of a rendered signature in characters.
    pub const LEN: usize = SIGNATURE_BYTES * 2;

    pub fn compute(args: &[Value]) -> String {
        let canonical = canonicalize(Value::Array(args.to_vec()));
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        let digest = hasher.finalize().to_vec();
        hex::encode(&digest[..SIGNATURE_BYTES])
    }
}
