use crate::{
    caveat::{Caveat, MalformedCaveat, EXPIRATION_CONDITION},
    identifier::{Identifier, MalformedIdentifier, PaymentHash},
    invoice::{self, InvalidInvoice},
    macaroon::{CaveatError, InvalidMacaroon, Macaroon},
};
use base64::{prelude::BASE64_STANDARD, Engine};
use chrono::{DateTime, Utc};
use hex::FromHexError;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

/// The authentication scheme token used in HTTP headers.
const HEADER_SCHEME: &str = "LSAT ";

/// A payment preimage: the 32-byte secret whose sha256 equals a token's
/// payment hash, proving the invoice was paid.
#[derive(Clone, Copy, Debug, Eq, Hash, SerializeDisplay, DeserializeFromStr, PartialEq)]
pub struct Preimage(pub [u8; 32]);

impl Preimage {
    /// The payment hash this preimage proves, recomputed from the bytes.
    pub fn payment_hash(&self) -> PaymentHash {
        let hash = Sha256::digest(self.0);
        PaymentHash(hash.into())
    }
}

impl fmt::Display for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preimage = hex::encode(self.0);
        write!(f, "{preimage}")
    }
}

impl FromStr for Preimage {
    type Err = PreimageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut data = [0; 32];
        hex::decode_to_slice(s, &mut data)?;
        Ok(Self(data))
    }
}

impl TryFrom<&[u8]> for Preimage {
    type Error = PreimageError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let data: [u8; 32] = bytes.try_into().map_err(|_| PreimageError::Length(bytes.len()))?;
        Ok(Self(data))
    }
}

/// An error when constructing or applying a preimage.
#[derive(Debug, thiserror::Error)]
pub enum PreimageError {
    #[error("preimage must be 32 bytes, got {0}")]
    Length(usize),

    #[error("invalid preimage hex: {0}")]
    Hex(#[from] FromHexError),

    #[error("preimage hashes to {actual}, payment hash is {expected}")]
    Mismatch { expected: PaymentHash, actual: PaymentHash },
}

/// A Lightning Service Authentication Token.
///
/// Joins a base macaroon with the invoice it was issued against and,
/// eventually, the preimage proving that invoice was paid. An `Lsat` is never
/// partially constructed: every constructor either yields a fully coherent
/// instance or an error naming the invariant that failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Lsat {
    base_macaroon: Macaroon,
    payment_hash: PaymentHash,
    payment_request: String,
    amount_msat: Option<u64>,
    preimage: Option<Preimage>,
}

impl Lsat {
    /// Construct an Lsat from a serialized macaroon and the payment request
    /// it was issued against.
    ///
    /// The macaroon's embedded identifier and the invoice must agree on the
    /// payment hash.
    pub fn from_macaroon(macaroon: &str, payment_request: &str) -> Result<Self, LsatError> {
        let base_macaroon = Macaroon::deserialize(macaroon)?;
        let identifier = Identifier::from_bytes(base_macaroon.identifier())?;
        let decoded = invoice::decode(payment_request)?;
        if decoded.payment_hash != identifier.payment_hash() {
            return Err(LsatError::PaymentHashMismatch {
                macaroon: identifier.payment_hash(),
                invoice: decoded.payment_hash,
            });
        }
        Ok(Self {
            base_macaroon,
            payment_hash: decoded.payment_hash,
            payment_request: payment_request.into(),
            amount_msat: decoded.amount_msat,
            preimage: None,
        })
    }

    /// Encode this Lsat as a challenge: the pre-payment wire form returned in
    /// a `WWW-Authenticate` header.
    ///
    /// Challenges never carry a preimage.
    pub fn to_challenge(&self) -> String {
        let pair = format!("{}:{}", self.base_macaroon.serialize(), self.payment_request);
        BASE64_STANDARD.encode(pair)
    }

    /// Encode this Lsat as a `WWW-Authenticate` header value, challenge
    /// prefixed with the scheme token.
    pub fn to_header(&self) -> String {
        format!("{HEADER_SCHEME}{}", self.to_challenge())
    }

    /// Decode an Lsat from a challenge string.
    pub fn from_challenge(challenge: &str) -> Result<Self, MalformedChallenge> {
        let bytes = BASE64_STANDARD.decode(challenge).map_err(MalformedChallenge::Base64)?;
        let text = String::from_utf8(bytes).map_err(|_| MalformedChallenge::Utf8)?;
        let fields: Vec<&str> = text.split(':').collect();
        match fields.as_slice() {
            [macaroon, payment_request] => Ok(Self::from_macaroon(macaroon, payment_request)?),
            fields => Err(MalformedChallenge::FieldCount(fields.len())),
        }
    }

    /// Decode an Lsat from a `WWW-Authenticate` header value carrying the
    /// `LSAT` scheme token.
    pub fn from_header(header: &str) -> Result<Self, MalformedChallenge> {
        let challenge = header.strip_prefix(HEADER_SCHEME).ok_or(MalformedChallenge::MissingScheme)?;
        Self::from_challenge(challenge)
    }

    /// Encode this Lsat as a token: the wire form sent in an `Authorization`
    /// header. The preimage field is empty while the token is pending.
    pub fn to_token(&self) -> String {
        let preimage = self.preimage.map(|preimage| preimage.to_string()).unwrap_or_default();
        let fields = format!("{}:{}:{preimage}", self.base_macaroon.serialize(), self.payment_request);
        BASE64_STANDARD.encode(fields)
    }

    /// Decode an Lsat from a token string.
    ///
    /// A well formed but non matching preimage is carried as-is so that
    /// externally issued tokens remain inspectable; [`Lsat::is_satisfied`]
    /// recomputes the hash and exposes the mismatch.
    pub fn from_token(token: &str) -> Result<Self, MalformedToken> {
        let bytes = BASE64_STANDARD.decode(token).map_err(MalformedToken::Base64)?;
        let text = String::from_utf8(bytes).map_err(|_| MalformedToken::Utf8)?;
        let fields: Vec<&str> = text.split(':').collect();
        match fields.as_slice() {
            [macaroon, payment_request, preimage] => {
                let mut lsat = Self::from_macaroon(macaroon, payment_request)?;
                if !preimage.is_empty() {
                    lsat.preimage = Some(preimage.parse()?);
                }
                Ok(lsat)
            }
            fields => Err(MalformedToken::FieldCount(fields.len())),
        }
    }

    /// Append a first-party caveat to the underlying macaroon.
    ///
    /// The chain is append-only: the macaroon is replaced by a strictly more
    /// restrictive attenuation and no caveat is ever removed.
    pub fn add_first_party_caveat(&mut self, caveat: &Caveat) -> Result<(), CaveatError> {
        self.base_macaroon = self.base_macaroon.attenuate(caveat)?;
        Ok(())
    }

    /// Set the payment preimage on this Lsat.
    ///
    /// The preimage's sha256 is checked against the payment hash before
    /// anything is stored; a mismatched preimage is never accepted and leaves
    /// the token pending.
    pub fn set_preimage(&mut self, preimage: Preimage) -> Result<(), PreimageError> {
        let actual = preimage.payment_hash();
        if actual != self.payment_hash {
            return Err(PreimageError::Mismatch { expected: self.payment_hash, actual });
        }
        self.preimage = Some(preimage);
        Ok(())
    }

    /// Whether no preimage has been set yet.
    pub fn is_pending(&self) -> bool {
        self.preimage.is_none()
    }

    /// Whether a preimage is set and matches the payment hash.
    ///
    /// The hash is recomputed on every call rather than trusted from an
    /// earlier check.
    pub fn is_satisfied(&self) -> bool {
        match &self.preimage {
            Some(preimage) => preimage.payment_hash() == self.payment_hash,
            None => false,
        }
    }

    /// The effective expiration of this Lsat in milliseconds since the
    /// epoch: the minimum value among all `expiration` caveats, or `None`
    /// when there are none (the token never expires unless a caveat is later
    /// added).
    pub fn expiration_millis(&self) -> Option<i64> {
        self.base_macaroon
            .caveats()
            .iter()
            .filter_map(|raw| raw.parse::<Caveat>().ok())
            .filter(|caveat| caveat.condition == EXPIRATION_CONDITION)
            .filter_map(|caveat| caveat.value.parse::<i64>().ok())
            .min()
    }

    /// The effective expiration as a timestamp.
    ///
    /// `None` when there is no expiration caveat, or when the minimum value
    /// falls outside the representable `DateTime` range; expiration checks
    /// must use [`Lsat::expiration_millis`], which carries the raw value.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration_millis().and_then(DateTime::from_timestamp_millis)
    }

    /// The decoded caveat chain of the underlying macaroon.
    pub fn caveats(&self) -> Result<Vec<Caveat>, MalformedCaveat> {
        self.base_macaroon.caveats().iter().map(|raw| raw.parse()).collect()
    }

    /// The payment hash this Lsat is bound to.
    pub fn payment_hash(&self) -> PaymentHash {
        self.payment_hash
    }

    /// The payment request this Lsat was issued against.
    pub fn payment_request(&self) -> &str {
        &self.payment_request
    }

    /// The base macaroon owned by this Lsat.
    pub fn base_macaroon(&self) -> &Macaroon {
        &self.base_macaroon
    }

    /// The preimage, when one has been set.
    pub fn preimage(&self) -> Option<&Preimage> {
        self.preimage.as_ref()
    }

    /// The invoice amount in millisatoshis, when the invoice carries one.
    pub fn amount_msat(&self) -> Option<u64> {
        self.amount_msat
    }

    /// The structured view of this Lsat, serializable as JSON.
    pub fn view(&self) -> LsatView {
        LsatView {
            payment_hash: self.payment_hash,
            payment_request: self.payment_request.clone(),
            base_macaroon: self.base_macaroon.serialize(),
            preimage: self.preimage,
            valid_until: self.expiration(),
            is_pending: self.is_pending(),
            amount_msat: self.amount_msat,
        }
    }
}

/// The structured wire form of an [`Lsat`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LsatView {
    /// The payment hash, hex encoded.
    pub payment_hash: PaymentHash,

    /// The BOLT11 payment request.
    pub payment_request: String,

    /// The serialized base macaroon.
    pub base_macaroon: String,

    /// The preimage, hex encoded, absent while pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<Preimage>,

    /// The effective expiration in milliseconds since the epoch.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub valid_until: Option<DateTime<Utc>>,

    /// Whether the token is still awaiting payment proof.
    pub is_pending: bool,

    /// The invoice amount in millisatoshis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_msat: Option<u64>,
}

/// An error when constructing an Lsat from its parts.
#[derive(Debug, thiserror::Error)]
pub enum LsatError {
    #[error("invalid macaroon: {0}")]
    InvalidMacaroon(#[from] InvalidMacaroon),

    #[error("invalid macaroon identifier: {0}")]
    InvalidIdentifier(#[from] MalformedIdentifier),

    #[error("invalid invoice: {0}")]
    InvalidInvoice(#[from] InvalidInvoice),

    #[error("payment hash mismatch: macaroon is bound to {macaroon}, invoice settles {invoice}")]
    PaymentHashMismatch { macaroon: PaymentHash, invoice: PaymentHash },
}

/// An error when decoding a challenge.
#[derive(Debug, thiserror::Error)]
pub enum MalformedChallenge {
    #[error("invalid base64: {0}")]
    Base64(base64::DecodeError),

    #[error("challenge is not valid utf-8")]
    Utf8,

    #[error("expected 2 fields in challenge, got {0}")]
    FieldCount(usize),

    #[error("missing LSAT scheme in header")]
    MissingScheme,

    #[error(transparent)]
    Lsat(#[from] LsatError),
}

/// An error when decoding a token.
#[derive(Debug, thiserror::Error)]
pub enum MalformedToken {
    #[error("invalid base64: {0}")]
    Base64(base64::DecodeError),

    #[error("token is not valid utf-8")]
    Utf8,

    #[error("expected 3 fields in token, got {0}")]
    FieldCount(usize),

    #[error("invalid preimage: {0}")]
    Preimage(#[from] PreimageError),

    #[error(transparent)]
    Lsat(#[from] LsatError),
}
