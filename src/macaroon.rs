use crate::caveat::{Caveat, Satisfier};
use base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use itertools::Itertools;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The serialization format version emitted and understood by this crate.
const FORMAT_VERSION: u8 = 2;

/// The largest field a u16 length prefix can carry.
const MAX_FIELD_SIZE: usize = u16::MAX as usize;

/// A first-party macaroon.
///
/// The signature is an HMAC-SHA256 chain: the root key signs the identifier,
/// and every appended caveat re-derives the signature from the previous one.
/// The chain is append-only; attenuation can only restrict what the macaroon
/// authorizes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Macaroon {
    location: String,
    identifier: Vec<u8>,
    caveats: Vec<String>,
    signature: [u8; 32],
}

impl Macaroon {
    /// Bake a new macaroon for the given identifier, signed with the root key.
    pub fn bake(location: &str, root_key: &[u8], identifier: &[u8]) -> Result<Self, InvalidMacaroon> {
        if location.len() > MAX_FIELD_SIZE {
            return Err(InvalidMacaroon::FieldTooLong(location.len()));
        }
        if identifier.len() > MAX_FIELD_SIZE {
            return Err(InvalidMacaroon::FieldTooLong(identifier.len()));
        }
        let signature = hmac_sha256(root_key, identifier);
        Ok(Self { location: location.into(), identifier: identifier.to_vec(), caveats: vec![], signature })
    }

    /// The location this macaroon was baked for.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The identifier bytes embedded in this macaroon.
    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    /// The raw caveat texts in this macaroon, in the order they were added.
    pub fn caveats(&self) -> &[String] {
        &self.caveats
    }

    /// The signature tag over the identifier and caveat chain.
    pub fn signature(&self) -> &[u8; 32] {
        &self.signature
    }

    /// Produce a new macaroon with the given first-party caveat appended.
    ///
    /// The receiver is left untouched; the returned macaroon carries a
    /// strictly longer caveat chain and a re-derived signature.
    pub fn attenuate(&self, caveat: &Caveat) -> Result<Self, CaveatError> {
        let text = caveat.encode();
        if text.len() > MAX_FIELD_SIZE {
            return Err(CaveatError::TooLong(text.len()));
        }
        if self.caveats.len() >= MAX_FIELD_SIZE {
            return Err(CaveatError::ChainFull);
        }
        let mut attenuated = self.clone();
        attenuated.signature = hmac_sha256(&self.signature, text.as_bytes());
        attenuated.caveats.push(text);
        Ok(attenuated)
    }

    /// Serialize this macaroon into its url-safe base64 form.
    pub fn serialize(&self) -> String {
        let mut buffer = Vec::new();
        buffer.push(FORMAT_VERSION);
        push_field(&mut buffer, self.location.as_bytes());
        push_field(&mut buffer, &self.identifier);
        buffer.extend_from_slice(&(self.caveats.len() as u16).to_be_bytes());
        for caveat in &self.caveats {
            push_field(&mut buffer, caveat.as_bytes());
        }
        buffer.extend_from_slice(&self.signature);
        BASE64_URL_SAFE_NO_PAD.encode(buffer)
    }

    /// Deserialize a macaroon from its url-safe base64 form.
    pub fn deserialize(input: &str) -> Result<Self, InvalidMacaroon> {
        let bytes = BASE64_URL_SAFE_NO_PAD.decode(input).map_err(InvalidMacaroon::Base64)?;
        let mut reader = Reader::new(&bytes);
        let version = reader.take_u8()?;
        if version != FORMAT_VERSION {
            return Err(InvalidMacaroon::UnknownVersion(version));
        }
        let location =
            String::from_utf8(reader.take_field()?.to_vec()).map_err(|_| InvalidMacaroon::LocationUtf8)?;
        let identifier = reader.take_field()?.to_vec();
        let caveat_count = reader.take_u16()?;
        let mut caveats = Vec::with_capacity(caveat_count as usize);
        for _ in 0..caveat_count {
            let caveat =
                String::from_utf8(reader.take_field()?.to_vec()).map_err(|_| InvalidMacaroon::CaveatUtf8)?;
            caveats.push(caveat);
        }
        let mut signature = [0; 32];
        signature.copy_from_slice(reader.take(32)?);
        if !reader.finished() {
            return Err(InvalidMacaroon::TrailingBytes);
        }
        Ok(Self { location, identifier, caveats, signature })
    }

    /// Verify this macaroon against a root key and a set of satisfiers.
    ///
    /// The signature chain is recomputed from the root key, and every caveat
    /// must be accepted by a satisfier with a matching condition. A caveat
    /// that does not decode, or that no satisfier covers, fails the whole
    /// verification.
    pub fn verify(&self, root_key: &[u8], satisfiers: &[&dyn Satisfier]) -> bool {
        self.verify_signature(root_key) && self.caveats_satisfied(satisfiers)
    }

    fn verify_signature(&self, root_key: &[u8]) -> bool {
        let mut signature = hmac_sha256(root_key, &self.identifier);
        for caveat in &self.caveats {
            signature = hmac_sha256(&signature, caveat.as_bytes());
        }
        signature == self.signature
    }

    fn caveats_satisfied(&self, satisfiers: &[&dyn Satisfier]) -> bool {
        let mut caveats = Vec::with_capacity(self.caveats.len());
        for raw in &self.caveats {
            match raw.parse::<Caveat>() {
                Ok(caveat) => caveats.push(caveat),
                Err(_) => return false,
            }
        }
        for caveat in &caveats {
            let Some(satisfier) = satisfiers.iter().find(|s| s.condition() == caveat.condition) else {
                return false;
            };
            if !satisfier.satisfy_final(caveat) {
                return false;
            }
        }
        // Pairwise checks within each condition: attenuation must tighten.
        let groups = caveats.iter().into_group_map_by(|caveat| caveat.condition.clone());
        for (condition, group) in groups {
            // SAFETY: every caveat passed the satisfier lookup above.
            let satisfier = satisfiers.iter().find(|s| s.condition() == condition).unwrap();
            for (previous, current) in group.into_iter().tuple_windows() {
                if !satisfier.satisfy_previous(previous, current) {
                    return false;
                }
            }
        }
        true
    }
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    // SAFETY: HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(message);
    mac.finalize().into_bytes().into()
}

fn push_field(buffer: &mut Vec<u8>, field: &[u8]) {
    buffer.extend_from_slice(&(field.len() as u16).to_be_bytes());
    buffer.extend_from_slice(field);
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], InvalidMacaroon> {
        let end = self.offset.checked_add(count).ok_or(InvalidMacaroon::Truncated)?;
        let chunk = self.data.get(self.offset..end).ok_or(InvalidMacaroon::Truncated)?;
        self.offset = end;
        Ok(chunk)
    }

    fn take_u8(&mut self) -> Result<u8, InvalidMacaroon> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, InvalidMacaroon> {
        let chunk = self.take(2)?;
        Ok(u16::from_be_bytes([chunk[0], chunk[1]]))
    }

    fn take_field(&mut self) -> Result<&'a [u8], InvalidMacaroon> {
        let length = self.take_u16()?;
        self.take(length as usize)
    }

    fn finished(&self) -> bool {
        self.offset == self.data.len()
    }
}

/// An error when constructing or deserializing a macaroon.
#[derive(Debug, thiserror::Error)]
pub enum InvalidMacaroon {
    #[error("invalid base64: {0}")]
    Base64(base64::DecodeError),

    #[error("macaroon is truncated")]
    Truncated,

    #[error("unknown macaroon version {0}")]
    UnknownVersion(u8),

    #[error("location is not valid utf-8")]
    LocationUtf8,

    #[error("caveat is not valid utf-8")]
    CaveatUtf8,

    #[error("trailing bytes after signature")]
    TrailingBytes,

    #[error("field of {0} bytes exceeds encoding limit")]
    FieldTooLong(usize),
}

/// An error when appending a caveat to a macaroon.
#[derive(Debug, thiserror::Error)]
pub enum CaveatError {
    #[error("caveat of {0} bytes exceeds encoding limit")]
    TooLong(usize),

    #[error("caveat chain is full")]
    ChainFull,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caveat::{Comparator, ExpirationSatisfier};
    use crate::test_utils::FixedTimeProvider;
    use rstest::rstest;

    const ROOT_KEY: &[u8] = b"root key for macaroon tests";

    fn baked() -> Macaroon {
        Macaroon::bake("https://example.com", ROOT_KEY, b"identifier bytes").expect("bake failed")
    }

    #[test]
    fn roundtrip() {
        let macaroon = baked()
            .attenuate(&Caveat::new("service", Comparator::Equal, "lsat"))
            .expect("attenuate failed");
        let decoded = Macaroon::deserialize(&macaroon.serialize()).expect("deserialize failed");
        assert_eq!(decoded, macaroon);
    }

    #[test]
    fn attenuation_is_append_only() {
        let base = baked();
        let attenuated = base
            .attenuate(&Caveat::new("service", Comparator::Equal, "lsat"))
            .expect("attenuate failed");

        // the base macaroon is untouched and the new chain extends it
        assert!(base.caveats().is_empty());
        assert_eq!(attenuated.caveats(), ["service=lsat"]);
        assert_ne!(base.signature(), attenuated.signature());
    }

    #[test]
    fn verify_baked() {
        assert!(baked().verify(ROOT_KEY, &[]));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        assert!(!baked().verify(b"some other key", &[]));
    }

    #[test]
    fn verify_rejects_uncovered_caveat() {
        let macaroon = baked()
            .attenuate(&Caveat::new("service", Comparator::Equal, "lsat"))
            .expect("attenuate failed");
        // no satisfier for `service` means verification fails closed
        assert!(!macaroon.verify(ROOT_KEY, &[]));
    }

    #[test]
    fn verify_rejects_tampered_caveat() {
        let mut macaroon = baked()
            .attenuate(&Caveat::new("service", Comparator::Equal, "lsat"))
            .expect("attenuate failed");
        macaroon.caveats[0] = "service=other".into();

        struct AcceptAll;
        impl Satisfier for AcceptAll {
            fn condition(&self) -> &str {
                "service"
            }
            fn satisfy_previous(&self, _: &Caveat, _: &Caveat) -> bool {
                true
            }
            fn satisfy_final(&self, _: &Caveat) -> bool {
                true
            }
        }
        assert!(!macaroon.verify(ROOT_KEY, &[&AcceptAll]));
    }

    #[test]
    fn verify_expiration_with_satisfier() {
        let caveat = Caveat::new("expiration", Comparator::Equal, "2000");
        let macaroon = baked().attenuate(&caveat).expect("attenuate failed");

        let before = ExpirationSatisfier::with_time_provider(Box::new(FixedTimeProvider::at_millis(1000)));
        assert!(macaroon.verify(ROOT_KEY, &[&before]));

        let after = ExpirationSatisfier::with_time_provider(Box::new(FixedTimeProvider::at_millis(3000)));
        assert!(!macaroon.verify(ROOT_KEY, &[&after]));
    }

    #[test]
    fn verify_rejects_loosened_expiration() {
        let macaroon = baked()
            .attenuate(&Caveat::new("expiration", Comparator::Equal, "2000"))
            .expect("attenuate failed")
            .attenuate(&Caveat::new("expiration", Comparator::Equal, "5000"))
            .expect("attenuate failed");
        let satisfier = ExpirationSatisfier::with_time_provider(Box::new(FixedTimeProvider::at_millis(1000)));
        assert!(!macaroon.verify(ROOT_KEY, &[&satisfier]));
    }

    #[rstest]
    #[case::not_base64("&&&")]
    #[case::empty("")]
    #[case::unknown_version("_wAA")]
    #[case::truncated("AgAFaGVsbG8")]
    fn deserialize_invalid(#[case] input: &str) {
        Macaroon::deserialize(input).expect_err("deserialize succeeded");
    }

    #[test]
    fn deserialize_rejects_trailing_bytes() {
        let mut bytes = BASE64_URL_SAFE_NO_PAD.decode(baked().serialize()).expect("invalid base64");
        bytes.push(0);
        let input = BASE64_URL_SAFE_NO_PAD.encode(bytes);
        let err = Macaroon::deserialize(&input).expect_err("deserialize succeeded");
        assert!(matches!(err, InvalidMacaroon::TrailingBytes));
    }
}
