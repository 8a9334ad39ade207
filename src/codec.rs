//! The three-layer direct-message envelope.
//!
//! ```text
//! Rumor (kind 14, unsigned, real time)
//!   -> encrypted to recipient by sender -> Seal (kind 13, signed by sender, no tags)
//!   -> encrypted to recipient by a one-time key -> Gift Wrap (kind 1059, ["p", recipient])
//! ```
//!
//! Both outer timestamps are pushed back by independent random offsets of up
//! to [`MAX_TIMESTAMP_SKEW_SECS`]; only the Rumor carries the real time. The
//! one-time key lives on the stack for the duration of one [`MessageCodec::wrap`]
//! call.
//!
//! Legacy kind-4 events are decoded here too so the sync layer routes both
//! formats through one place.

use std::sync::Arc;

use rand::Rng;

use crate::crypto::{self, CryptoError};
use crate::event::{
    self, first_tag_value, now_secs, parse_pubkey, tag, Event, EventError, Keys, PublicKey,
    UnsignedEvent, KIND_GIFT_WRAP, KIND_LEGACY_DM, KIND_RUMOR, KIND_SEAL,
};
use crate::logging;
use crate::signer::{Signer, SignerError};
use crate::{tlog_debug, tlog_security};

/// Seal and Gift Wrap timestamps are at most this far in the past.
pub const MAX_TIMESTAMP_SKEW_SECS: u64 = 2 * 24 * 60 * 60;

#[derive(Debug)]
pub enum CodecError {
    /// The rumor is not authored by the signer's identity.
    AuthorMismatch,
    InvalidRecipient(EventError),
    Signer(SignerError),
    Crypto(CryptoError),
    Event(EventError),
    Serialize(serde_json::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::AuthorMismatch => write!(f, "rumor author is not the signing identity"),
            CodecError::InvalidRecipient(e) => write!(f, "invalid recipient: {e}"),
            CodecError::Signer(e) => write!(f, "signer error: {e}"),
            CodecError::Crypto(e) => write!(f, "crypto error: {e}"),
            CodecError::Event(e) => write!(f, "event error: {e}"),
            CodecError::Serialize(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<SignerError> for CodecError {
    fn from(e: SignerError) -> Self {
        CodecError::Signer(e)
    }
}

impl From<CryptoError> for CodecError {
    fn from(e: CryptoError) -> Self {
        CodecError::Crypto(e)
    }
}

impl From<EventError> for CodecError {
    fn from(e: EventError) -> Self {
        CodecError::Event(e)
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Serialize(e)
    }
}

/// A decoded kind-4 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyMessage {
    pub counterparty: PublicKey,
    pub content: String,
    pub is_mine: bool,
}

/// `created_at` minus a random offset in `[0, MAX_TIMESTAMP_SKEW_SECS)`.
fn randomized_timestamp(now: u64) -> u64 {
    now.saturating_sub(rand::thread_rng().gen_range(0..MAX_TIMESTAMP_SKEW_SECS))
}

pub struct MessageCodec {
    signer: Arc<dyn Signer>,
}

impl MessageCodec {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }

    pub fn identity(&self) -> PublicKey {
        self.signer.public_key()
    }

    /// Kind 14 rumor from `author` to `recipient`, stamped with the real time.
    pub fn build_rumor(
        author: PublicKey,
        content: &str,
        recipient: &PublicKey,
        reply_to: Option<&str>,
        subject: Option<&str>,
    ) -> Result<UnsignedEvent, CodecError> {
        let mut tags = vec![tag(&["p", &recipient.to_hex()])?];
        if let Some(parent) = reply_to {
            tags.push(tag(&["e", parent, "", "reply"])?);
        }
        if let Some(subject) = subject {
            tags.push(tag(&["subject", subject])?);
        }
        Ok(event::unsigned(author, now_secs(), KIND_RUMOR, tags, content))
    }

    /// Seal `rumor` and wrap it for `recipient`.
    pub async fn wrap(
        &self,
        rumor: &UnsignedEvent,
        recipient: &PublicKey,
    ) -> Result<Event, CodecError> {
        if rumor.pubkey != self.signer.public_key() {
            return Err(CodecError::AuthorMismatch);
        }
        self.seal_and_wrap(rumor, recipient).await
    }

    async fn seal_and_wrap(
        &self,
        rumor: &UnsignedEvent,
        recipient: &PublicKey,
    ) -> Result<Event, CodecError> {
        let now = now_secs();

        let rumor_json = serde_json::to_string(rumor)?;
        let sealed = self.signer.encrypt(&rumor_json, recipient).await?;
        let seal = event::unsigned(
            self.signer.public_key(),
            randomized_timestamp(now),
            KIND_SEAL,
            Vec::new(),
            sealed,
        );
        let seal = self.signer.sign_event(seal).await?;
        let seal_json = serde_json::to_string(&seal)?;

        let one_time = Keys::generate();
        let wrapped = crypto::encrypt(one_time.secret_key(), recipient, &seal_json)?;
        let wrap = event::unsigned(
            one_time.public_key(),
            randomized_timestamp(now),
            KIND_GIFT_WRAP,
            vec![tag(&["p", &recipient.to_hex()])?],
            wrapped,
        );
        Ok(event::sign(&one_time, wrap)?)
    }

    /// Open a Gift Wrap addressed to this identity.
    ///
    /// Anything that is not a well-formed envelope for us yields `None`. A
    /// rumor whose author differs from the seal signer is also dropped and
    /// reported on the security channel. The returned rumor carries its
    /// recomputed id.
    pub async fn unwrap(&self, wrap: &Event) -> Option<UnsignedEvent> {
        let wrap_id = wrap.id.to_hex();
        if wrap.kind.as_u16() != KIND_GIFT_WRAP {
            tlog_debug!(
                "codec: {} is kind {}, not a gift wrap",
                logging::event_id(&wrap_id),
                wrap.kind.as_u16()
            );
            return None;
        }

        let seal_json = match self.signer.decrypt(&wrap.content, &wrap.pubkey).await {
            Ok(json) => json,
            Err(e) => {
                tlog_debug!("codec: cannot open wrap {}: {e}", logging::event_id(&wrap_id));
                return None;
            }
        };
        let seal: Event = match serde_json::from_str(&seal_json) {
            Ok(seal) => seal,
            Err(e) => {
                tlog_debug!("codec: wrap {} holds no seal: {e}", logging::event_id(&wrap_id));
                return None;
            }
        };
        if seal.kind.as_u16() != KIND_SEAL {
            tlog_debug!(
                "codec: wrap {} holds kind {}",
                logging::event_id(&wrap_id),
                seal.kind.as_u16()
            );
            return None;
        }
        if let Err(e) = seal.verify() {
            tlog_debug!("codec: seal in wrap {} does not verify: {e}", logging::event_id(&wrap_id));
            return None;
        }

        let seal_id = seal.id.to_hex();
        let rumor_json = match self.signer.decrypt(&seal.content, &seal.pubkey).await {
            Ok(json) => json,
            Err(e) => {
                tlog_debug!("codec: cannot open seal {}: {e}", logging::event_id(&seal_id));
                return None;
            }
        };
        let mut rumor: UnsignedEvent = match serde_json::from_str(&rumor_json) {
            Ok(rumor) => rumor,
            Err(e) => {
                tlog_debug!("codec: seal {} holds no rumor: {e}", logging::event_id(&seal_id));
                return None;
            }
        };
        if rumor.kind.as_u16() != KIND_RUMOR {
            tlog_debug!(
                "codec: seal {} holds kind {}",
                logging::event_id(&seal_id),
                rumor.kind.as_u16()
            );
            return None;
        }

        if rumor.pubkey != seal.pubkey {
            tlog_security!(
                "codec: dropped wrap {}: rumor claims author {} but seal is signed by {}",
                logging::event_id(&wrap_id),
                logging::pubkey(&rumor.pubkey.to_hex()),
                logging::pubkey(&seal.pubkey.to_hex())
            );
            return None;
        }
        event::canonical_id(&mut rumor).ok()?;
        Some(rumor)
    }

    /// Decode a kind-4 event sent to or by this identity.
    pub async fn unwrap_legacy(&self, message: &Event) -> Option<LegacyMessage> {
        if message.kind.as_u16() != KIND_LEGACY_DM || message.verify().is_err() {
            return None;
        }
        let is_mine = message.pubkey == self.signer.public_key();
        let counterparty = if is_mine {
            parse_pubkey(first_tag_value(message.tags.iter(), "p")?).ok()?
        } else {
            message.pubkey
        };
        let content = self
            .signer
            .legacy_decrypt(&message.content, &counterparty)
            .await
            .ok()?;
        Some(LegacyMessage {
            counterparty,
            content,
            is_mine,
        })
    }
}
