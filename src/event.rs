//! Relay event model.
//!
//! The types are the `nostr` crate's: an [`Event`] is identified by the hex
//! SHA-256 of `[0, pubkey, created_at, kind, tags, content]` and carries a
//! BIP-340 signature over that id, and an [`UnsignedEvent`] is the shape of a
//! Rumor. This module adds the kinds used for direct messages and small
//! helpers for building events from plain values and reading tags.

pub use nostr::{
    Event, EventBuilder, EventId, Filter, Keys, Kind, PublicKey, SecretKey, Tag, Timestamp,
    UnsignedEvent,
};

pub const KIND_LEGACY_DM: u16 = 4;
pub const KIND_SEAL: u16 = 13;
pub const KIND_RUMOR: u16 = 14;
pub const KIND_GIFT_WRAP: u16 = 1059;
pub const KIND_INBOX_RELAYS: u16 = 10050;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    InvalidKey(String),
    InvalidTag(String),
    /// The event is authored by a different key than the one signing it.
    ForeignAuthor,
    MissingId,
    Sign(String),
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventError::InvalidKey(e) => write!(f, "invalid key: {e}"),
            EventError::InvalidTag(e) => write!(f, "invalid tag: {e}"),
            EventError::ForeignAuthor => write!(f, "event pubkey does not belong to this key"),
            EventError::MissingId => write!(f, "event has no id"),
            EventError::Sign(e) => write!(f, "signing failed: {e}"),
        }
    }
}

impl std::error::Error for EventError {}

pub fn now_secs() -> u64 {
    Timestamp::now().as_u64()
}

pub fn kind(value: u16) -> Kind {
    Kind::from(value)
}

/// Parse a lowercase-hex x-only public key.
pub fn parse_pubkey(hex_key: &str) -> Result<PublicKey, EventError> {
    PublicKey::from_hex(hex_key).map_err(|e| EventError::InvalidKey(e.to_string()))
}

/// Keys from a hex (or `nsec`) secret key.
pub fn keys_from_secret(secret: &str) -> Result<Keys, EventError> {
    Keys::parse(secret.trim()).map_err(|e| EventError::InvalidKey(e.to_string()))
}

pub fn tag(values: &[&str]) -> Result<Tag, EventError> {
    Tag::parse(values.iter().copied()).map_err(|e| EventError::InvalidTag(e.to_string()))
}

/// An unsigned event with its id computed.
pub fn unsigned(
    pubkey: PublicKey,
    created_at: u64,
    kind: u16,
    tags: Vec<Tag>,
    content: impl Into<String>,
) -> UnsignedEvent {
    let content: String = content.into();
    let mut event = EventBuilder::new(Kind::from(kind), content)
        .tags(tags)
        .custom_created_at(Timestamp::from(created_at))
        .build(pubkey);
    event.ensure_id();
    event
}

/// The id of `event`, recomputed from its fields.
///
/// Rumors arrive unsigned, so a claimed id proves nothing.
pub fn canonical_id(event: &mut UnsignedEvent) -> Result<EventId, EventError> {
    event.id = None;
    event.ensure_id();
    event.id.ok_or(EventError::MissingId)
}

/// Sign `event` with `keys`, refusing events authored by anyone else.
pub fn sign(keys: &Keys, event: UnsignedEvent) -> Result<Event, EventError> {
    if event.pubkey != keys.public_key() {
        return Err(EventError::ForeignAuthor);
    }
    event
        .sign_with_keys(keys)
        .map_err(|e| EventError::Sign(e.to_string()))
}

/// Second element of the first tag named `name`.
pub fn first_tag_value<'a>(tags: impl IntoIterator<Item = &'a Tag>, name: &str) -> Option<&'a str> {
    tags.into_iter()
        .map(Tag::as_slice)
        .find(|t| t.first().map(String::as_str) == Some(name))
        .and_then(|t| t.get(1))
        .map(String::as_str)
}

/// Second elements of all tags named `name`.
pub fn tag_values<'a, I>(tags: I, name: &'a str) -> impl Iterator<Item = &'a str> + 'a
where
    I: IntoIterator<Item = &'a Tag>,
    I::IntoIter: 'a,
{
    tags.into_iter()
        .map(Tag::as_slice)
        .filter(move |t| t.first().map(String::as_str) == Some(name))
        .filter_map(|t| t.get(1).map(String::as_str))
}
