//! Log-safe key identifiers

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// Length of the rendered fingerprint.
const FINGERPRINT_LEN: usize = 12;

/// Short, stable identifier for an API key.
///
/// `BASE64URL(SHA256(value))` truncated to 12 characters. Used wherever a key
/// has to be named in logs or admin output.
pub fn fingerprint(value: &str) -> String {
    let hash = Sha256::digest(value.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(hash);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}
