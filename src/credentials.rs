//! API credential issuance.
//!
//! Keys are opaque: the limiter only uses them to partition counters and
//! never checks them against a registry.

use rand::RngCore;

/// Random bytes per key.
pub const API_KEY_BYTES: usize = 32;

/// Generate a random API key as lowercase hex.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
