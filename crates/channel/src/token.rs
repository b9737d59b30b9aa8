//! One-shot connection tokens.
//!
//! The offering peer mints a token and carries it in its session
//! description. A dialing peer must present the token before any frames
//! are exchanged, which keeps strangers who portscan the ephemeral
//! listener from attaching to the session.

/// Raw token length in bytes before hex encoding.
const TOKEN_BYTES: usize = 16;

/// Generate a fresh random token as a lowercase hex string.
pub fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    hex::encode(bytes)
}

/// Compare a presented token against the expected one in constant time.
pub fn validate_token(expected: &str, presented: &str) -> bool {
    let a = expected.as_bytes();
    let b = presented.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
