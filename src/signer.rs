//! The signing and encryption capability used by the messaging core.
//!
//! A [`Signer`] is chosen once at login (in-process key, external daemon, ...)
//! and handed to the service. Nothing downstream branches on how the key is
//! held.

use async_trait::async_trait;

use crate::crypto::{self, CryptoError};
use crate::event::{self, Event, EventError, Keys, PublicKey, UnsignedEvent};

#[derive(Debug)]
pub enum SignerError {
    Crypto(CryptoError),
    Event(EventError),
    Backend(String),
    Unavailable(String),
}

impl std::fmt::Display for SignerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignerError::Crypto(e) => write!(f, "crypto error: {e}"),
            SignerError::Event(e) => write!(f, "event error: {e}"),
            SignerError::Backend(e) => write!(f, "signer backend error: {e}"),
            SignerError::Unavailable(e) => write!(f, "signer unavailable: {e}"),
        }
    }
}

impl std::error::Error for SignerError {}

impl From<CryptoError> for SignerError {
    fn from(e: CryptoError) -> Self {
        SignerError::Crypto(e)
    }
}

impl From<EventError> for SignerError {
    fn from(e: EventError) -> Self {
        SignerError::Event(e)
    }
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// Public key of the identity.
    fn public_key(&self) -> PublicKey;

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError>;

    /// Layered-scheme encryption to `counterparty`.
    async fn encrypt(&self, plaintext: &str, counterparty: &PublicKey)
        -> Result<String, SignerError>;

    /// Layered-scheme decryption of a payload exchanged with `counterparty`.
    async fn decrypt(&self, payload: &str, counterparty: &PublicKey)
        -> Result<String, SignerError>;

    /// Legacy single-layer decryption.
    async fn legacy_decrypt(
        &self,
        payload: &str,
        counterparty: &PublicKey,
    ) -> Result<String, SignerError>;
}

/// Signer backed by a secret key held in process memory.
pub struct LocalKeySigner {
    keys: Keys,
}

impl LocalKeySigner {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    /// From a hex or `nsec` secret key.
    pub fn from_secret(secret: &str) -> Result<Self, SignerError> {
        Ok(Self::new(event::keys_from_secret(secret)?))
    }
}

#[async_trait]
impl Signer for LocalKeySigner {
    fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    async fn sign_event(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        Ok(event::sign(&self.keys, unsigned)?)
    }

    async fn encrypt(
        &self,
        plaintext: &str,
        counterparty: &PublicKey,
    ) -> Result<String, SignerError> {
        Ok(crypto::encrypt(self.keys.secret_key(), counterparty, plaintext)?)
    }

    async fn decrypt(
        &self,
        payload: &str,
        counterparty: &PublicKey,
    ) -> Result<String, SignerError> {
        Ok(crypto::decrypt(self.keys.secret_key(), counterparty, payload)?)
    }

    async fn legacy_decrypt(
        &self,
        payload: &str,
        counterparty: &PublicKey,
    ) -> Result<String, SignerError> {
        Ok(crypto::legacy_decrypt(self.keys.secret_key(), counterparty, payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_signers_interoperate() {
        let alice = LocalKeySigner::new(Keys::generate());
        let bob = LocalKeySigner::new(Keys::generate());

        let payload = alice.encrypt("hello bob", &bob.public_key()).await.unwrap();
        let plain = bob.decrypt(&payload, &alice.public_key()).await.unwrap();
        assert_eq!(plain, "hello bob");

        let note = event::unsigned(alice.public_key(), 5, 1, vec![], "note");
        let signed = alice.sign_event(note).await.unwrap();
        signed.verify().unwrap();
    }

    #[tokio::test]
    async fn refuses_foreign_events_and_bad_secrets() {
        let alice = LocalKeySigner::new(Keys::generate());
        let bob = Keys::generate();
        let forged = event::unsigned(bob.public_key(), 5, 1, vec![], "not mine");
        assert!(matches!(
            alice.sign_event(forged).await,
            Err(SignerError::Event(EventError::ForeignAuthor))
        ));
        assert!(matches!(
            LocalKeySigner::from_secret("not-hex"),
            Err(SignerError::Event(EventError::InvalidKey(_)))
        ));
    }
}
