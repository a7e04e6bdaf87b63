//! Common helper functions for Tether.

/// Performs a constant-time comparison of two byte strings.
///
/// Used when comparing key material so that the position of the first
/// differing byte is not observable through timing.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Short hex fingerprint of a public key for log lines.
///
/// Only ever pass public material here.
pub fn key_fingerprint(public_key: &[u8]) -> String {
    let shown = public_key.len().min(6);
    hex::encode(&public_key[..shown])
}
