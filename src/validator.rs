use crate::{
    caveat::{Caveat, Satisfier, SystemClockTimeProvider, TimeProvider, EXPIRATION_CONDITION},
    lsat::Lsat,
};
use chrono::{DateTime, Utc};
use std::fmt;

/// The LSAT validation pipeline.
///
/// Runs three independent checks over an [`Lsat`] snapshot: expiration,
/// preimage, and macaroon signature. All three are always evaluated and
/// reported, so a caller inspecting an externally issued token can see which
/// dimension failed. Validation is read-only and never errors.
pub struct LsatValidator {
    time_provider: Box<dyn TimeProvider>,
}

impl LsatValidator {
    /// Construct a validator using the system clock.
    pub fn new() -> Self {
        Self { time_provider: Box::new(SystemClockTimeProvider) }
    }

    /// Construct a validator using the given clock.
    pub fn with_time_provider(time_provider: Box<dyn TimeProvider>) -> Self {
        Self { time_provider }
    }

    /// Validate an Lsat against the root key it was baked with.
    ///
    /// Pass `None` when the root key is unknown (an externally issued token):
    /// the expiration and preimage checks still run, and the macaroon check
    /// reports the missing key rather than being skipped.
    pub fn validate(&self, lsat: &Lsat, root_key: Option<&[u8]>) -> ValidationReport {
        self.validate_with_satisfiers(lsat, root_key, &[])
    }

    /// Validate an Lsat with additional satisfiers for the macaroon check.
    ///
    /// Satisfiers are consulted in order and the supplied ones take
    /// precedence over the built-in expiration satisfier.
    pub fn validate_with_satisfiers(
        &self,
        lsat: &Lsat,
        root_key: Option<&[u8]>,
        satisfiers: &[&dyn Satisfier],
    ) -> ValidationReport {
        let now = self.time_provider.current_time();
        ValidationReport {
            expiration: check_expiration(lsat, now),
            preimage: check_preimage(lsat),
            macaroon: check_macaroon(lsat, root_key, satisfiers),
        }
    }
}

impl Default for LsatValidator {
    fn default() -> Self {
        Self::new()
    }
}

// Compares raw millisecond values so that expirations outside the
// representable `DateTime` range still expire the token.
fn check_expiration(lsat: &Lsat, now: DateTime<Utc>) -> Check {
    match lsat.expiration_millis() {
        None => Check::Passed,
        Some(expires_at) if now.timestamp_millis() < expires_at => Check::Passed,
        Some(expires_at) => Check::Failed(CheckFailure::Expired(expires_at)),
    }
}

fn check_preimage(lsat: &Lsat) -> Check {
    if lsat.is_pending() {
        Check::Failed(CheckFailure::PreimageMissing)
    } else if !lsat.is_satisfied() {
        Check::Failed(CheckFailure::PreimageMismatch)
    } else {
        Check::Passed
    }
}

fn check_macaroon(lsat: &Lsat, root_key: Option<&[u8]>, satisfiers: &[&dyn Satisfier]) -> Check {
    let Some(root_key) = root_key else {
        return Check::Failed(CheckFailure::RootKeyUnavailable);
    };
    let expiration = ExpirationFormatSatisfier;
    let mut satisfiers: Vec<&dyn Satisfier> = satisfiers.to_vec();
    satisfiers.push(&expiration);
    if lsat.base_macaroon().verify(root_key, &satisfiers) {
        Check::Passed
    } else {
        Check::Failed(CheckFailure::VerificationFailed)
    }
}

/// The satisfier backing the signature check's view of expiration caveats.
///
/// Accepts any well formed, properly tightening expiration chain without
/// consulting the clock: whether the token is currently expired is the
/// expiration check's verdict alone, and must not leak into the signature
/// check.
struct ExpirationFormatSatisfier;

impl Satisfier for ExpirationFormatSatisfier {
    fn condition(&self) -> &str {
        EXPIRATION_CONDITION
    }

    fn satisfy_previous(&self, previous: &Caveat, current: &Caveat) -> bool {
        match (previous.value.parse::<i64>(), current.value.parse::<i64>()) {
            (Ok(previous), Ok(current)) => current <= previous,
            _ => false,
        }
    }

    fn satisfy_final(&self, caveat: &Caveat) -> bool {
        caveat.value.parse::<i64>().is_ok()
    }
}

/// The result of validating an [`Lsat`].
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationReport {
    /// The expiration check: no expiration caveat, or the earliest one is in
    /// the future.
    pub expiration: Check,

    /// The preimage check: a preimage is set and hashes to the payment hash.
    pub preimage: Check,

    /// The macaroon check: the signature chain verifies under the root key
    /// and every caveat has a passing satisfier.
    pub macaroon: Check,
}

impl ValidationReport {
    /// Whether all three checks passed.
    pub fn is_valid(&self) -> bool {
        self.expiration.passed() && self.preimage.passed() && self.macaroon.passed()
    }
}

/// The outcome of a single check.
#[derive(Clone, Debug, PartialEq)]
pub enum Check {
    Passed,
    Failed(CheckFailure),
}

impl Check {
    /// Whether this check passed.
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Why a check failed.
#[derive(Clone, Debug, PartialEq)]
pub enum CheckFailure {
    /// The token expired at this millisecond timestamp.
    Expired(i64),
    PreimageMissing,
    PreimageMismatch,
    RootKeyUnavailable,
    VerificationFailed,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CheckFailure::*;
        match self {
            Expired(at) => write!(f, "token expired at {at} ms since epoch"),
            PreimageMissing => write!(f, "no preimage set, token is pending"),
            PreimageMismatch => write!(f, "preimage does not satisfy payment hash"),
            RootKeyUnavailable => write!(f, "no root key available to verify the macaroon"),
            VerificationFailed => write!(f, "macaroon verification failed"),
        }
    }
}
