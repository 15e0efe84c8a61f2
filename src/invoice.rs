use crate::identifier::PaymentHash;
use bitcoin::hashes::Hash;
use lightning_invoice::{Bolt11Invoice, ParseOrSemanticError};

/// The fields this crate consumes from a decoded BOLT11 payment request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecodedInvoice {
    /// The payment hash the invoice settles against.
    pub payment_hash: PaymentHash,

    /// The invoice amount, in millisatoshis, when one is set.
    pub amount_msat: Option<u64>,
}

/// Decode a BOLT11 payment request.
///
/// Parsing (including signature recovery) is delegated to the
/// `lightning-invoice` collaborator; only the payment hash and amount are
/// kept.
pub fn decode(payment_request: &str) -> Result<DecodedInvoice, InvalidInvoice> {
    let invoice: Bolt11Invoice = payment_request.parse()?;
    let payment_hash = PaymentHash(invoice.payment_hash().to_byte_array());
    Ok(DecodedInvoice { payment_hash, amount_msat: invoice.amount_milli_satoshis() })
}

/// An error when decoding a payment request.
#[derive(Debug, thiserror::Error)]
pub enum InvalidInvoice {
    #[error("invalid payment request: {0}")]
    Parse(#[from] ParseOrSemanticError),
}
