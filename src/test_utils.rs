use crate::{
    caveat::TimeProvider,
    identifier::{Identifier, PaymentHash},
    lsat::{Lsat, Preimage},
    macaroon::Macaroon,
};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use chrono::{DateTime, Utc};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

pub(crate) const ROOT_KEY: &[u8] = b"super secret signing key";
pub(crate) const TEST_AMOUNT_MSAT: u64 = 1000;
pub(crate) const LOCATION: &str = "https://example.com";

/// Build a signed BOLT11 invoice for the given payment hash.
pub(crate) fn test_invoice(payment_hash: PaymentHash) -> String {
    let private_key = SecretKey::from_slice(&[41; 32]).expect("valid key");
    let hash = sha256::Hash::from_slice(&payment_hash.0).expect("32 bytes");
    InvoiceBuilder::new(Currency::Bitcoin)
        .description("lsat test invoice".into())
        .payment_hash(hash)
        .payment_secret(PaymentSecret([42; 32]))
        .current_timestamp()
        .min_final_cltv_expiry_delta(144)
        .amount_milli_satoshis(TEST_AMOUNT_MSAT)
        .build_signed(|hash| Secp256k1::new().sign_ecdsa_recoverable(hash, &private_key))
        .expect("invoice signing failed")
        .to_string()
}

/// Bake a pending Lsat along with the preimage that satisfies it.
pub(crate) fn pending_lsat() -> (Lsat, Preimage) {
    let preimage = Preimage([7; 32]);
    let payment_hash = preimage.payment_hash();
    let identifier = Identifier::from_payment_hash(payment_hash);
    let macaroon = Macaroon::bake(LOCATION, ROOT_KEY, &identifier.to_bytes()).expect("bake failed");
    let invoice = test_invoice(payment_hash);
    let lsat = Lsat::from_macaroon(&macaroon.serialize(), &invoice).expect("construction failed");
    (lsat, preimage)
}

pub(crate) struct FixedTimeProvider(DateTime<Utc>);

impl FixedTimeProvider {
    pub(crate) fn at_millis(millis: i64) -> Self {
        Self(DateTime::from_timestamp_millis(millis).expect("valid timestamp"))
    }
}

impl TimeProvider for FixedTimeProvider {
    fn current_time(&self) -> DateTime<Utc> {
        self.0
    }
}
