//! Canonical serialization of authenticated message metadata.
//!
//! Every signed message binds its context (scheme, domain, personalization,
//! epoch, expiry, counter) by feeding `{tag}{len}{value}` triples into a
//! hash before the message itself. The encoding is injective: tags are
//! ordered, lengths are explicit, and the tag list is terminated by a
//! sentinel before the free-form message bytes begin.

use fleetlink_model::Domain;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

pub type HmacSha256 = Hmac<Sha256>;

/// Metadata tags in their canonical order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Tag {
    SignatureType = 0,
    Domain = 1,
    Personalization = 2,
    Epoch = 3,
    ExpiresAt = 4,
    Counter = 5,
    Challenge = 6,
    Flags = 7,
    RequestHash = 8,
    Fault = 9,
    End = 255,
}

/// Scheme discriminators mixed into the metadata under
/// [`Tag::SignatureType`]. Wire-stable; gaps belong to retired schemes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SignatureType {
    AesGcmPersonalized = 5,
    SessionInfoTag = 6,
    HmacPersonalized = 8,
}

enum Context {
    Digest(Sha256),
    Mac(HmacSha256),
}

/// An in-progress metadata checksum.
///
/// Misuse (a value over 255 bytes, tags out of order, adding after the
/// terminator) is a programming error, therefore panic and not error.
pub struct Metadata {
    context: Context,
    last_tag: Option<u8>,
}

impl Metadata {
    /// A plain SHA-256 context; produces the associated data for AES-GCM.
    pub fn new() -> Self {
        Self {
            context: Context::Digest(Sha256::new()),
            last_tag: None,
        }
    }

    /// A keyed context; produces an HMAC-SHA-256 authentication tag.
    pub fn keyed(mac: HmacSha256) -> Self {
        Self {
            context: Context::Mac(mac),
            last_tag: None,
        }
    }

    pub fn add(&mut self, tag: Tag, value: &[u8]) {
        assert!(tag != Tag::End, "the terminator is written by checksum()");
        assert!(
            value.len() <= u8::MAX as usize,
            "metadata values are limited to 255 bytes"
        );
        if let Some(last) = self.last_tag {
            assert!(
                tag as u8 >= last,
                "metadata tags must be added in canonical order"
            );
        }
        self.last_tag = Some(tag as u8);

        self.update(&[tag as u8, value.len() as u8]);
        self.update(value);
    }

    pub fn add_u32(&mut self, tag: Tag, value: u32) {
        self.add(tag, &value.to_be_bytes());
    }

    /// Terminates the tag list, appends `message` and finalizes.
    pub fn checksum(mut self, message: &[u8]) -> [u8; 32] {
        self.update(&[Tag::End as u8]);
        self.update(message);

        let mut out = [0u8; 32];
        match self.context {
            Context::Digest(digest) => out.copy_from_slice(&digest.finalize()),
            Context::Mac(mac) => out.copy_from_slice(&mac.finalize().into_bytes()),
        }

        out
    }

    fn update(&mut self, bytes: &[u8]) {
        match &mut self.context {
            Context::Digest(digest) => digest.update(bytes),
            Context::Mac(mac) => mac.update(bytes),
        }
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

/// The canonical metadata recipe for a personalized command. Signer and
/// verifier must compute byte-identical contexts or nothing authenticates.
pub(crate) struct CommandContext<'a> {
    pub signature_type: SignatureType,
    pub domain: Domain,
    pub verifier_id: &'a [u8],
    pub epoch: &'a [u8],
    pub expires_at: u32,
    pub counter: u32,
    pub flags: u32,
}

impl CommandContext<'_> {
    pub fn fill(&self, meta: &mut Metadata) {
        meta.add(Tag::SignatureType, &[self.signature_type as u8]);
        meta.add(Tag::Domain, &[self.domain as u8]);
        meta.add(Tag::Personalization, self.verifier_id);
        meta.add(Tag::Epoch, self.epoch);
        meta.add_u32(Tag::ExpiresAt, self.expires_at);
        meta.add_u32(Tag::Counter, self.counter);
        if self.flags != 0 {
            meta.add_u32(Tag::Flags, self.flags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum_of(build: impl FnOnce(&mut Metadata), message: &[u8]) -> [u8; 32] {
        let mut meta = Metadata::new();
        build(&mut meta);
        meta.checksum(message)
    }

    #[test]
    fn encoding_is_injective_across_value_boundaries() {
        // Moving a byte between two adjacent values must change the digest.
        let a = checksum_of(
            |m| {
                m.add(Tag::Personalization, b"ab");
                m.add(Tag::Epoch, b"c");
            },
            b"",
        );
        let b = checksum_of(
            |m| {
                m.add(Tag::Personalization, b"a");
                m.add(Tag::Epoch, b"bc");
            },
            b"",
        );

        assert_ne!(a, b);
    }

    #[test]
    fn terminator_separates_tags_from_message() {
        let a = checksum_of(|m| m.add(Tag::Personalization, b"vin"), b"payload");
        let b = checksum_of(|m| m.add(Tag::Personalization, b"vin"), b"payloae");

        assert_ne!(a, b);
    }

    #[test]
    fn repeated_tag_is_allowed() {
        // Equal tags are in order; only regressions are rejected.
        let mut meta = Metadata::new();
        meta.add(Tag::Personalization, b"a");
        meta.add(Tag::Personalization, b"b");
        meta.checksum(b"");
    }

    #[test]
    #[should_panic(expected = "canonical order")]
    fn out_of_order_tag_panics() {
        let mut meta = Metadata::new();
        meta.add(Tag::Counter, &[1]);
        meta.add(Tag::Domain, &[2]);
    }

    #[test]
    #[should_panic(expected = "255 bytes")]
    fn oversized_value_panics() {
        let mut meta = Metadata::new();
        meta.add(Tag::Personalization, &[0u8; 256]);
    }

    #[test]
    fn keyed_context_differs_from_digest() {
        use hmac::Mac as _;

        let mac = HmacSha256::new_from_slice(b"key").expect("HMAC can take key of any size");
        let mut keyed = Metadata::keyed(mac);
        keyed.add(Tag::Personalization, b"vin");
        let keyed = keyed.checksum(b"message");

        let plain = checksum_of(|m| m.add(Tag::Personalization, b"vin"), b"message");

        assert_ne!(keyed, plain);
    }
}
