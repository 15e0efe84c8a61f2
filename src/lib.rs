pub mod caveat;
pub mod identifier;
pub mod invoice;
pub mod lsat;
pub mod macaroon;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_utils;

pub use lightning_invoice;
