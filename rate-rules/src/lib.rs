//! Exchange rate primitives and the rate rule engine.
//!
//! [`CurrencyPair`] and [`BidAsk`] are plain values. [`RateRules`] parses a
//! script of per-pair expressions and resolves any pair into a [`RateRule`]
//! whose dependencies ([`ExchangeRates`]) are filled from live quotes before
//! calling [`RateRule::reevaluate`].

mod bid_ask;
mod currency_pair;
mod error;
mod exchange_rates;
pub mod rules;

pub use bid_ask::{BidAsk, BidAskError};
pub use currency_pair::{is_known_currency, CurrencyPair, CurrencyPairParseError};
pub use error::{RateRulesError, RulesParseError, SyntaxError};
pub use exchange_rates::{ExchangeRate, ExchangeRateSource, ExchangeRates};
pub use rules::{RateRule, RateRules};
