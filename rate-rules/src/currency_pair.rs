use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const MAX_PAIR_LENGTH: usize = 12;

/// Currency codes recognised when a pair is written without a separator and
/// the left side is not three letters long.
static KNOWN_CURRENCIES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // fiat
        "AED", "ARS", "AUD", "BGN", "BRL", "CAD", "CHF", "CLP", "CNY", "COP", "CZK", "DKK", "EUR",
        "GBP", "HKD", "HUF", "IDR", "ILS", "INR", "ISK", "JPY", "KES", "KRW", "MXN", "MYR", "NGN",
        "NOK", "NZD", "PEN", "PHP", "PKR", "PLN", "RON", "RUB", "SAR", "SEK", "SGD", "THB", "TRY",
        "TWD", "UAH", "USD", "VND", "ZAR",
        // crypto
        "BTC", "SATS", "LTC", "ETH", "DOGE", "DASH", "BCH", "XMR", "ZEC", "USDT", "USDC", "LBTC",
        "MONA", "GRS", "VTC", "DAI",
    ]
    .into_iter()
    .collect()
});

/// Returns whether `code` is in the known currency table.
pub fn is_known_currency(code: &str) -> bool {
    KNOWN_CURRENCIES.contains(code.to_ascii_uppercase().as_str())
}

/// An ordered pair of currency codes, written `LEFT_RIGHT`.
///
/// Both sides are stored upper case, so equality and hashing ignore the case
/// the pair was written in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CurrencyPair {
    left: String,
    right: String,
}

impl CurrencyPair {
    pub fn new(left: impl AsRef<str>, right: impl AsRef<str>) -> Self {
        CurrencyPair {
            left: left.as_ref().to_ascii_uppercase(),
            right: right.as_ref().to_ascii_uppercase(),
        }
    }

    pub fn left(&self) -> &str { &self.left }

    pub fn right(&self) -> &str { &self.right }

    pub fn inverse(&self) -> CurrencyPair {
        CurrencyPair { left: self.right.clone(), right: self.left.clone() }
    }

    /// True when either side is the `X` wildcard used by rate rules.
    pub fn has_wildcard(&self) -> bool { self.left == "X" || self.right == "X" }

    pub fn is_identity(&self) -> bool { self.left == self.right }
}

impl FromStr for CurrencyPair {
    type Err = CurrencyPairParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() > MAX_PAIR_LENGTH {
            return Err(CurrencyPairParseError::TooLong(s.len()));
        }
        let parts: Vec<&str> = s.split(['_', '-']).filter(|part| !part.is_empty()).collect();
        match parts.as_slice() {
            [left, right] => Ok(CurrencyPair::new(left, right)),
            [concatenated] => split_concatenated(concatenated)
                .ok_or_else(|| CurrencyPairParseError::InvalidFormat(s.to_owned())),
            [first, rest @ ..] if !rest.is_empty() => Ok(CurrencyPair::new(first, rest.join("_"))),
            _ => Err(CurrencyPairParseError::InvalidFormat(s.to_owned())),
        }
    }
}

fn split_concatenated(code: &str) -> Option<CurrencyPair> {
    if !code.is_ascii() || code.len() < 6 || code.len() > 10 {
        return None;
    }
    if code.len() == 6 {
        return Some(CurrencyPair::new(&code[..3], &code[3..]));
    }
    (3..5)
        .map(|split| code.split_at(split))
        .find(|(left, _)| is_known_currency(left))
        .map(|(left, right)| CurrencyPair::new(left, right))
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "{}_{}", self.left, self.right) }
}

impl Serialize for CurrencyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CurrencyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurrencyPairParseError {
    TooLong(usize),
    InvalidFormat(String),
}

impl fmt::Display for CurrencyPairParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TooLong(len) =>
                write!(f, "currency pair is {len} characters long, at most {MAX_PAIR_LENGTH} allowed"),
            Self::InvalidFormat(s) => write!(f, "invalid currency pair '{s}'"),
        }
    }
}

impl std::error::Error for CurrencyPairParseError {}
