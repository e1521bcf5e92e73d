use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{BidAsk, CurrencyPair};

/// A quote for `pair` on `exchange`. `bid_ask` is `None` until a rate is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub exchange: String,
    pub pair: CurrencyPair,
    pub bid_ask: Option<BidAsk>,
}

impl ExchangeRate {
    pub fn new(exchange: impl Into<String>, pair: CurrencyPair, bid_ask: Option<BidAsk>) -> Self {
        ExchangeRate { exchange: exchange.into(), pair, bid_ask }
    }
}

impl fmt::Display for ExchangeRate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.bid_ask {
            Some(bid_ask) => write!(f, "{}({}) == {}", self.exchange, self.pair, bid_ask),
            None => write!(f, "{}({})", self.exchange, self.pair),
        }
    }
}

/// Anything that can answer "what is `pair` on `exchange`".
pub trait ExchangeRateSource {
    fn rate(&self, exchange: &str, pair: &CurrencyPair) -> Option<BidAsk>;
}

/// Exchange rates keyed by `(exchange, pair)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeRates(BTreeMap<(String, CurrencyPair), Option<BidAsk>>);

impl ExchangeRates {
    pub fn new() -> Self { Self::default() }

    /// Adds a rate. Identity pairs are ignored; an existing key only has its
    /// bid/ask replaced.
    pub fn add(&mut self, rate: ExchangeRate) {
        if rate.pair.is_identity() {
            return;
        }
        let key = (rate.exchange.to_ascii_lowercase(), rate.pair);
        self.0.insert(key, rate.bid_ask);
    }

    pub fn set_rate(&mut self, exchange: &str, pair: CurrencyPair, bid_ask: BidAsk) {
        self.add(ExchangeRate::new(exchange, pair, Some(bid_ask)));
    }

    pub fn get(&self, exchange: &str, pair: &CurrencyPair) -> Option<BidAsk> {
        self.0.get(&(exchange.to_ascii_lowercase(), pair.clone())).copied().flatten()
    }

    pub fn contains(&self, exchange: &str, pair: &CurrencyPair) -> bool {
        self.0.contains_key(&(exchange.to_ascii_lowercase(), pair.clone()))
    }

    pub fn extend(&mut self, other: ExchangeRates) {
        for rate in other {
            // dependencies without a quote must not clear a known one
            if rate.bid_ask.is_none() && self.contains(&rate.exchange, &rate.pair) {
                continue;
            }
            self.add(rate);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ExchangeRate> + '_ {
        self.0.iter().map(|((exchange, pair), bid_ask)| ExchangeRate {
            exchange: exchange.clone(),
            pair: pair.clone(),
            bid_ask: *bid_ask,
        })
    }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl ExchangeRateSource for ExchangeRates {
    fn rate(&self, exchange: &str, pair: &CurrencyPair) -> Option<BidAsk> { self.get(exchange, pair) }
}

impl FromIterator<ExchangeRate> for ExchangeRates {
    fn from_iter<T: IntoIterator<Item = ExchangeRate>>(iter: T) -> Self {
        let mut rates = ExchangeRates::new();
        for rate in iter {
            rates.add(rate);
        }
        rates
    }
}

impl IntoIterator for ExchangeRates {
    type Item = ExchangeRate;
    type IntoIter = std::vec::IntoIter<ExchangeRate>;

    fn into_iter(self) -> Self::IntoIter {
        self.0
            .into_iter()
            .map(|((exchange, pair), bid_ask)| ExchangeRate { exchange, pair, bid_ask })
            .collect::<Vec<_>>()
            .into_iter()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn pair(s: &str) -> CurrencyPair { s.parse().unwrap() }

    #[test]
    fn identity_pairs_are_not_stored() {
        let mut rates = ExchangeRates::new();
        rates.set_rate("kraken", pair("BTC_BTC"), BidAsk::point(dec!(1)));
        assert!(rates.is_empty());
    }

    #[test]
    fn re_adding_updates_the_quote() {
        let mut rates = ExchangeRates::new();
        rates.add(ExchangeRate::new("Kraken", pair("BTC_USD"), None));
        rates.set_rate("kraken", pair("btc_usd"), BidAsk::point(dec!(100)));
        assert_eq!(rates.len(), 1);
        assert_eq!(rates.get("KRAKEN", &pair("BTC_USD")), Some(BidAsk::point(dec!(100))));
    }

    #[test]
    fn extend_keeps_known_quotes() {
        let mut rates = ExchangeRates::new();
        rates.set_rate("kraken", pair("BTC_USD"), BidAsk::point(dec!(100)));
        let deps: ExchangeRates = [
            ExchangeRate::new("kraken", pair("BTC_USD"), None),
            ExchangeRate::new("bitstamp", pair("BTC_EUR"), None),
        ]
        .into_iter()
        .collect();
        rates.extend(deps);
        assert_eq!(rates.len(), 2);
        assert_eq!(rates.rate("kraken", &pair("BTC_USD")), Some(BidAsk::point(dec!(100))));
        assert_eq!(rates.rate("bitstamp", &pair("BTC_EUR")), None);
    }
}
