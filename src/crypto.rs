//! Payload encryption between two identities.
//!
//! * **Layered**: NIP-44 version 2, used for seals and gift wraps. The ECDH
//!   conversation key is stretched per payload from a random nonce into
//!   ChaCha20 and HMAC-SHA256 keys; plaintext is padded to a size class.
//! * **Legacy**: NIP-04 AES-256-CBC, rendered as
//!   `base64(ciphertext)?iv=base64(iv)`. Decrypt-only in practice; encryption
//!   is kept for tests and tooling.
//!
//! Both come from `nostr::nips`; this module only narrows the error types.

use nostr::nips::{nip04, nip44};

use crate::event::{PublicKey, SecretKey};

/// Longest plaintext the layered scheme accepts.
pub const MAX_PLAINTEXT_SIZE: usize = 65_535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    EmptyPlaintext,
    TooLong(usize),
    Layered(String),
    Legacy(String),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::EmptyPlaintext => write!(f, "plaintext is empty"),
            CryptoError::TooLong(len) => {
                write!(f, "plaintext of {len} bytes exceeds {MAX_PLAINTEXT_SIZE}")
            }
            CryptoError::Layered(e) => write!(f, "layered payload: {e}"),
            CryptoError::Legacy(e) => write!(f, "legacy payload: {e}"),
        }
    }
}

impl std::error::Error for CryptoError {}

pub fn encrypt(
    secret: &SecretKey,
    counterparty: &PublicKey,
    plaintext: &str,
) -> Result<String, CryptoError> {
    if plaintext.is_empty() {
        return Err(CryptoError::EmptyPlaintext);
    }
    if plaintext.len() > MAX_PLAINTEXT_SIZE {
        return Err(CryptoError::TooLong(plaintext.len()));
    }
    nip44::encrypt(secret, counterparty, plaintext, nip44::Version::V2)
        .map_err(|e| CryptoError::Layered(e.to_string()))
}

pub fn decrypt(
    secret: &SecretKey,
    counterparty: &PublicKey,
    payload: &str,
) -> Result<String, CryptoError> {
    nip44::decrypt(secret, counterparty, payload).map_err(|e| CryptoError::Layered(e.to_string()))
}

pub fn legacy_encrypt(
    secret: &SecretKey,
    counterparty: &PublicKey,
    plaintext: &str,
) -> Result<String, CryptoError> {
    nip04::encrypt(secret, counterparty, plaintext).map_err(|e| CryptoError::Legacy(e.to_string()))
}

pub fn legacy_decrypt(
    secret: &SecretKey,
    counterparty: &PublicKey,
    payload: &str,
) -> Result<String, CryptoError> {
    nip04::decrypt(secret, counterparty, payload).map_err(|e| CryptoError::Legacy(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Keys;

    fn keys_from_scalar(last: u8) -> Keys {
        let mut bytes = [0u8; 32];
        bytes[31] = last;
        Keys::new(SecretKey::from_slice(&bytes).unwrap())
    }

    #[test]
    fn decrypts_published_fixture() {
        // sec1 = 1, sec2 = 2, nonce = 1, plaintext "a".
        let sec1 = keys_from_scalar(1);
        let sec2 = keys_from_scalar(2);
        let payload = "AgAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAABee0G5VSK0/9YypIObAtDKfYEAjD35uVkHyB0F4DwrcNaCXlCWZKaArsGrY6M9wnuTMxWfp1RTN9Xga8no+kF5Vsb";
        assert_eq!(decrypt(sec2.secret_key(), &sec1.public_key(), payload).unwrap(), "a");
        assert_eq!(decrypt(sec1.secret_key(), &sec2.public_key(), payload).unwrap(), "a");
    }

    #[test]
    fn rejects_tampering_and_wrong_keys() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();

        let payload = encrypt(alice.secret_key(), &bob.public_key(), "meet at noon").unwrap();
        assert_eq!(
            decrypt(bob.secret_key(), &alice.public_key(), &payload).unwrap(),
            "meet at noon"
        );
        assert!(decrypt(carol.secret_key(), &alice.public_key(), &payload).is_err());
        assert!(decrypt(bob.secret_key(), &carol.public_key(), &payload).is_err());

        // Flip one base64 digit inside the ciphertext.
        let mut chars: Vec<char> = payload.chars().collect();
        chars[60] = if chars[60] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();
        assert!(decrypt(bob.secret_key(), &alice.public_key(), &tampered).is_err());
        assert!(decrypt(bob.secret_key(), &alice.public_key(), "#not-supported").is_err());
    }

    #[test]
    fn rejects_empty_and_oversized_plaintext() {
        let alice = Keys::generate();
        let bob = Keys::generate().public_key();
        assert_eq!(
            encrypt(alice.secret_key(), &bob, ""),
            Err(CryptoError::EmptyPlaintext)
        );
        let long = "x".repeat(MAX_PLAINTEXT_SIZE + 1);
        assert_eq!(
            encrypt(alice.secret_key(), &bob, &long),
            Err(CryptoError::TooLong(MAX_PLAINTEXT_SIZE + 1))
        );
        assert!(encrypt(alice.secret_key(), &bob, &long[1..]).is_ok());
    }

    #[test]
    fn legacy_round_trip_and_corruption() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let payload = legacy_encrypt(alice.secret_key(), &bob.public_key(), "old school").unwrap();
        assert!(payload.contains("?iv="));
        assert_eq!(
            legacy_decrypt(bob.secret_key(), &alice.public_key(), &payload).unwrap(),
            "old school"
        );
        assert!(legacy_decrypt(bob.secret_key(), &alice.public_key(), "garbage").is_err());
        assert!(legacy_decrypt(bob.secret_key(), &alice.public_key(), "AAAA?iv=AAAA").is_err());
    }
}
