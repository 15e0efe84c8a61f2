use hex::FromHexError;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::{fmt, str::FromStr};

/// The only identifier version understood by this crate.
pub const LATEST_VERSION: u16 = 0;

/// Byte length of the version tag plus the payment hash.
const MIN_IDENTIFIER_SIZE: usize = 2 + 32;

/// A Lightning payment hash.
#[derive(Clone, Copy, Debug, Eq, Hash, SerializeDisplay, DeserializeFromStr, PartialEq)]
pub struct PaymentHash(pub [u8; 32]);

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hash = hex::encode(self.0);
        write!(f, "{hash}")
    }
}

impl FromStr for PaymentHash {
    type Err = FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut data = [0; 32];
        hex::decode_to_slice(s, &mut data)?;
        Ok(Self(data))
    }
}

/// The identifier embedded in an LSAT macaroon.
///
/// This binds the macaroon to the payment hash of the invoice it was issued
/// against, along with a token id that makes the identifier unique per token.
/// Identifiers are immutable once constructed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Identifier {
    version: u16,
    payment_hash: PaymentHash,
    token_id: Vec<u8>,
}

impl Identifier {
    /// Construct an identifier for the given payment hash with a random
    /// 32-byte token id.
    pub fn from_payment_hash(payment_hash: PaymentHash) -> Self {
        let token_id = rand::random::<[u8; 32]>().to_vec();
        Self { version: LATEST_VERSION, payment_hash, token_id }
    }

    /// Construct an identifier with a caller supplied token id.
    pub fn with_token_id<T: Into<Vec<u8>>>(payment_hash: PaymentHash, token_id: T) -> Self {
        Self { version: LATEST_VERSION, payment_hash, token_id: token_id.into() }
    }

    /// The identifier version.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// The payment hash this identifier is bound to.
    pub fn payment_hash(&self) -> PaymentHash {
        self.payment_hash
    }

    /// The token id bytes.
    pub fn token_id(&self) -> &[u8] {
        &self.token_id
    }

    /// Encode this identifier into its binary form.
    ///
    /// The layout is the big-endian version tag, the 32 payment hash bytes,
    /// and the token id.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MIN_IDENTIFIER_SIZE + self.token_id.len());
        bytes.extend_from_slice(&self.version.to_be_bytes());
        bytes.extend_from_slice(&self.payment_hash.0);
        bytes.extend_from_slice(&self.token_id);
        bytes
    }

    /// Decode an identifier from its binary form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MalformedIdentifier> {
        if bytes.len() < MIN_IDENTIFIER_SIZE {
            return Err(MalformedIdentifier::UnexpectedLength(bytes.len()));
        }
        // SAFETY: the length checks above guarantee both slices are in range.
        let version = u16::from_be_bytes(bytes[..2].try_into().unwrap());
        if version != LATEST_VERSION {
            return Err(MalformedIdentifier::UnknownVersion(version));
        }
        let mut payment_hash = [0; 32];
        payment_hash.copy_from_slice(&bytes[2..MIN_IDENTIFIER_SIZE]);
        let token_id = bytes[MIN_IDENTIFIER_SIZE..].to_vec();
        Ok(Self { version, payment_hash: PaymentHash(payment_hash), token_id })
    }
}

/// An error when decoding an identifier.
#[derive(Debug, thiserror::Error)]
pub enum MalformedIdentifier {
    #[error("identifier of {0} bytes is too short")]
    UnexpectedLength(usize),

    #[error("unknown identifier version {0}")]
    UnknownVersion(u16),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parse_valid_payment_hash() {
        let input = "f4f04af6a832bcd8a6855df5d0242c9a71e9da17faeb2d33b30c8903f1b5a944";
        let hash: PaymentHash = input.parse().expect("parse failed");
        assert_eq!(hash.to_string(), input);
    }

    #[rstest]
    #[case::too_short("aabb")]
    #[case::not_hex("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz")]
    fn parse_invalid_payment_hash(#[case] input: &str) {
        input.parse::<PaymentHash>().expect_err("parse succeeded");
    }

    #[test]
    fn roundtrip() {
        let identifier = Identifier::from_payment_hash(PaymentHash([0xab; 32]));
        let decoded = Identifier::from_bytes(&identifier.to_bytes()).expect("decode failed");
        assert_eq!(decoded, identifier);
    }

    #[test]
    fn roundtrip_empty_token_id() {
        let identifier = Identifier::with_token_id(PaymentHash([1; 32]), vec![]);
        let bytes = identifier.to_bytes();
        assert_eq!(bytes.len(), 34);

        let decoded = Identifier::from_bytes(&bytes).expect("decode failed");
        assert_eq!(decoded, identifier);
        assert!(decoded.token_id().is_empty());
    }

    #[test]
    fn random_token_id() {
        let hash = PaymentHash([2; 32]);
        let left = Identifier::from_payment_hash(hash);
        let right = Identifier::from_payment_hash(hash);
        assert_eq!(left.token_id().len(), 32);
        assert_ne!(left.token_id(), right.token_id());
    }

    #[test]
    fn reject_short_input() {
        let err = Identifier::from_bytes(&[0; 33]).expect_err("decode succeeded");
        assert!(matches!(err, MalformedIdentifier::UnexpectedLength(33)));
    }

    #[test]
    fn reject_unknown_version() {
        let mut bytes = Identifier::from_payment_hash(PaymentHash([3; 32])).to_bytes();
        bytes[0] = 0xff;
        let err = Identifier::from_bytes(&bytes).expect_err("decode succeeded");
        assert!(matches!(err, MalformedIdentifier::UnknownVersion(0xff00)));
    }
}
