//! Chat payload encryption boundary.
//!
//! The relay forwards chat messages without inspecting them, so the
//! payload format is entirely between the two peers. Sessions take the
//! cipher as a trait object; swapping in a real E2E scheme does not
//! touch the session logic.

use crate::error::SessionError;

/// Encrypts and decrypts chat payloads.
pub trait MessageCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, SessionError>;
    fn decrypt(&self, payload: &str) -> Result<String, SessionError>;
}

/// Identity cipher. Payloads travel as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextCipher;

impl MessageCipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, SessionError> {
        Ok(plaintext.to_owned())
    }

    fn decrypt(&self, payload: &str) -> Result<String, SessionError> {
        Ok(payload.to_owned())
    }
}
