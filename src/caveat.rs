use chrono::{DateTime, Utc};
use std::{fmt, str::FromStr};

/// The condition used by expiration caveats.
pub const EXPIRATION_CONDITION: &str = "expiration";

/// A comparator in a caveat clause.
///
/// The set is closed: decoding rejects anything that is not one of these.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Comparator {
    Equal,
    LessThan,
    GreaterThan,
}

impl Comparator {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '=' => Some(Self::Equal),
            '<' => Some(Self::LessThan),
            '>' => Some(Self::GreaterThan),
            _ => None,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Self::Equal => '=',
            Self::LessThan => '<',
            Self::GreaterThan => '>',
        };
        write!(f, "{c}")
    }
}

/// A single attenuation clause in a macaroon.
///
/// Caveats are immutable; once appended to a macaroon's chain they can never
/// be removed, only further restricted by later caveats.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Caveat {
    /// The condition being restricted.
    pub condition: String,

    /// The comparator relating condition and value.
    pub comparator: Comparator,

    /// The value the condition is compared against.
    pub value: String,
}

impl Caveat {
    /// Construct a new caveat.
    pub fn new<C: Into<String>, V: Into<String>>(condition: C, comparator: Comparator, value: V) -> Self {
        Self { condition: condition.into(), comparator, value: value.into() }
    }

    /// Construct an expiration caveat for the given point in time.
    ///
    /// Expiration values are milliseconds since the unix epoch.
    pub fn expiration(expires_at: DateTime<Utc>) -> Self {
        Self::new(EXPIRATION_CONDITION, Comparator::Equal, expires_at.timestamp_millis().to_string())
    }

    /// Encode this caveat into its canonical text form.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Caveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { condition, comparator, value } = self;
        write!(f, "{condition}{comparator}{value}")
    }
}

impl FromStr for Caveat {
    type Err = MalformedCaveat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The first comparator character splits the clause; the value may
        // itself contain further comparator characters.
        let (index, comparator) = s
            .char_indices()
            .find_map(|(index, c)| Comparator::from_char(c).map(|comparator| (index, comparator)))
            .ok_or(MalformedCaveat::MissingComparator)?;
        let condition = &s[..index];
        let value = &s[index + 1..];
        if condition.is_empty() {
            return Err(MalformedCaveat::EmptyCondition);
        }
        if value.is_empty() {
            return Err(MalformedCaveat::EmptyValue);
        }
        Ok(Self { condition: condition.into(), comparator, value: value.into() })
    }
}

/// An error when decoding a caveat.
#[derive(Debug, thiserror::Error)]
pub enum MalformedCaveat {
    #[error("no comparator in caveat")]
    MissingComparator,

    #[error("empty condition")]
    EmptyCondition,

    #[error("empty value")]
    EmptyValue,
}

/// A clock abstraction so time dependent checks can be pinned in tests.
pub trait TimeProvider: Send + Sync + 'static {
    fn current_time(&self) -> DateTime<Utc>;
}

/// A [`TimeProvider`] backed by the system clock.
pub struct SystemClockTimeProvider;

impl TimeProvider for SystemClockTimeProvider {
    fn current_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A predicate used during macaroon verification to decide whether a caveat
/// is met.
///
/// Verification fails closed: every caveat in a chain must have a satisfier
/// whose condition matches it, and that satisfier must accept it.
pub trait Satisfier {
    /// The caveat condition this satisfier applies to.
    fn condition(&self) -> &str;

    /// Check a pair of consecutive caveats sharing this condition.
    ///
    /// Attenuation must tighten: a later caveat may not loosen what an
    /// earlier one restricted.
    fn satisfy_previous(&self, previous: &Caveat, current: &Caveat) -> bool;

    /// Check a single caveat on its own.
    fn satisfy_final(&self, caveat: &Caveat) -> bool;
}

/// The standard satisfier for expiration caveats.
///
/// Accepts a caveat iff the current time is before its value, and requires
/// every successive expiration caveat to expire no later than the previous
/// one.
pub struct ExpirationSatisfier {
    time_provider: Box<dyn TimeProvider>,
}

impl ExpirationSatisfier {
    /// Construct a satisfier using the system clock.
    pub fn new() -> Self {
        Self { time_provider: Box::new(SystemClockTimeProvider) }
    }

    /// Construct a satisfier using the given clock.
    pub fn with_time_provider(time_provider: Box<dyn TimeProvider>) -> Self {
        Self { time_provider }
    }
}

impl Default for ExpirationSatisfier {
    fn default() -> Self {
        Self::new()
    }
}

impl Satisfier for ExpirationSatisfier {
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
        match caveat.value.parse::<i64>() {
            Ok(expires_at) => self.time_provider.current_time().timestamp_millis() < expires_at,
            Err(_) => false,
        }
    }
}
