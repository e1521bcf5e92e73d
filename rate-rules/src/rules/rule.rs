use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::{RateRules, ERROR_CALL_PREFIX, MAX_NESTED_CALLS};
use crate::error::RateRulesError;
use crate::{BidAsk, CurrencyPair, ExchangeRate, ExchangeRateSource, ExchangeRates};

/// A rule resolved for one currency pair.
///
/// Holds the flattened expression, the quotes it depends on and the outcome
/// of the last [`RateRule::reevaluate`]. Evaluation mutates the rule, so
/// callers share a rule across threads only behind their own lock.
#[derive(Debug, Clone)]
pub struct RateRule {
    pair: CurrencyPair,
    expression: Expr,
    exchange_rates: ExchangeRates,
    preprocess_errors: BTreeSet<RateRulesError>,
    errors: BTreeSet<RateRulesError>,
    bid_ask: Option<BidAsk>,
}

impl RateRule {
    pub(super) fn new(rules: &RateRules, pair: CurrencyPair, candidate: Expr) -> Self {
        let mut flattener = Flattener {
            rules,
            exchange_rates: ExchangeRates::new(),
            errors: BTreeSet::new(),
        };
        let expression = flattener.flatten(candidate, &pair, 0, false);
        log::trace!("flattened rule for {pair}: {expression}");
        RateRule {
            pair,
            expression,
            exchange_rates: flattener.exchange_rates,
            preprocess_errors: flattener.errors.clone(),
            errors: flattener.errors,
            bid_ask: None,
        }
    }

    pub fn pair(&self) -> &CurrencyPair { &self.pair }

    /// The quotes this rule needs, keyed by exchange and pair.
    pub fn exchange_rates(&self) -> &ExchangeRates { &self.exchange_rates }

    pub fn exchange_rates_mut(&mut self) -> &mut ExchangeRates { &mut self.exchange_rates }

    /// Copies every quote this rule depends on from `source`.
    pub fn fetch_from(&mut self, source: &impl ExchangeRateSource) {
        let wanted: Vec<ExchangeRate> = self.exchange_rates.iter().collect();
        for rate in wanted {
            if let Some(bid_ask) = source.rate(&rate.exchange, &rate.pair) {
                self.exchange_rates.set_rate(&rate.exchange, rate.pair, bid_ask);
            }
        }
    }

    /// Evaluates the rule against the current quotes.
    ///
    /// Errors from the previous call are discarded; errors found while
    /// resolving the rule are kept. Returns `true` when a rate was computed.
    pub fn reevaluate(&mut self) -> bool {
        self.bid_ask = None;
        self.errors = self.preprocess_errors.clone();

        let replaced = replace_calls(&self.expression, &self.exchange_rates, &mut self.errors);
        if !self.errors.is_empty() {
            log::debug!("rule for {} has errors: {:?}", self.pair, self.errors);
            return false;
        }

        let mut values = Vec::new();
        let result = evaluate(&replaced, &mut values).and_then(|()| match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(RateRulesError::MissingArgument),
        });
        match result {
            Ok(bid_ask) => {
                self.bid_ask = Some(bid_ask);
                true
            }
            Err(error) => {
                log::debug!("evaluating rule for {} failed: {error}", self.pair);
                self.errors.insert(error);
                false
            }
        }
    }

    /// The computed rate; `None` unless the last evaluation succeeded.
    pub fn bid_ask(&self) -> Option<BidAsk> {
        if self.errors.is_empty() {
            self.bid_ask
        } else {
            None
        }
    }

    pub fn errors(&self) -> &BTreeSet<RateRulesError> { &self.errors }
}

impl fmt::Display for RateRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "{}", self.expression) }
}

struct Flattener<'a> {
    rules: &'a RateRules,
    exchange_rates: ExchangeRates,
    errors: BTreeSet<RateRulesError>,
}

impl Flattener<'_> {
    /// Substitutes `X` with the sides of `target` and inlines the rule of
    /// every bare pair identifier.
    fn flatten(&mut self, expr: Expr, target: &CurrencyPair, nested: usize, in_call: bool) -> Expr {
        match expr {
            Expr::Identifier(name) => {
                let Ok(pair) = CurrencyPair::from_str(&name) else {
                    return Expr::Identifier(name);
                };
                let left = if pair.left() == "X" { target.left() } else { pair.left() };
                let right = if pair.right() == "X" { target.right() } else { pair.right() };
                let replaced = CurrencyPair::new(left, right);
                if in_call {
                    Expr::Identifier(replaced.to_string())
                } else {
                    self.inline(replaced, nested + 1)
                }
            }
            Expr::Call { target: callee, args } => {
                let exchange = match callee.as_ref() {
                    Expr::Identifier(name) => Some(name.clone()),
                    _ => None,
                };
                if exchange.as_deref().is_some_and(|name| name.starts_with(ERROR_CALL_PREFIX)) {
                    return Expr::Call { target: callee, args };
                }
                let args: Vec<Expr> =
                    args.into_iter().map(|arg| self.flatten(arg, target, nested, true)).collect();
                if let (Some(exchange), [Expr::Identifier(arg)]) = (&exchange, args.as_slice()) {
                    if let Ok(pair) = CurrencyPair::from_str(arg) {
                        self.exchange_rates.add(ExchangeRate::new(exchange.as_str(), pair, None));
                    }
                }
                Expr::Call { target: callee, args }
            }
            Expr::Binary(op, lhs, rhs) => Expr::binary(
                op,
                self.flatten(*lhs, target, nested, in_call),
                self.flatten(*rhs, target, nested, in_call),
            ),
            Expr::Unary(op, operand) =>
                Expr::Unary(op, Box::new(self.flatten(*operand, target, nested, in_call))),
            Expr::Tuple(items) => Expr::Tuple(
                items.into_iter().map(|item| self.flatten(item, target, nested, in_call)).collect(),
            ),
            leaf @ (Expr::Literal(_) | Expr::Rate(_)) => leaf,
        }
    }

    fn inline(&mut self, pair: CurrencyPair, nested: usize) -> Expr {
        if pair.is_identity() {
            return Expr::Literal(Decimal::ONE);
        }
        if nested > MAX_NESTED_CALLS {
            self.errors.insert(RateRulesError::TooMuchNestedCalls);
            return Expr::call("ERR_TOO_MUCH_NESTED_CALLS", Expr::Identifier(pair.to_string()));
        }
        let candidate = self.rules.find_best_candidate(&pair);
        self.flatten(candidate, &pair, nested, false)
    }
}

/// Swaps each exchange call for its quote.
fn replace_calls(
    expr: &Expr,
    rates: &ExchangeRates,
    errors: &mut BTreeSet<RateRulesError>,
) -> Expr {
    match expr {
        Expr::Call { target, args } => {
            let Some(exchange) = expr.call_target() else {
                errors.insert(RateRulesError::InvalidExchangeName);
                return Expr::Call { target: target.clone(), args: args.clone() };
            };
            if exchange.starts_with(ERROR_CALL_PREFIX) {
                errors.insert(RateRulesError::PreprocessError);
                return expr.clone();
            }
            let pair = match args.as_slice() {
                [Expr::Identifier(arg)] => CurrencyPair::from_str(arg).ok(),
                _ => None,
            };
            let Some(pair) = pair else {
                errors.insert(RateRulesError::UnsupportedOperator);
                return expr.clone();
            };
            match rates.get(exchange, &pair) {
                Some(bid_ask) => Expr::Rate(bid_ask),
                None => {
                    errors.insert(RateRulesError::RateUnavailable);
                    expr.clone()
                }
            }
        }
        Expr::Binary(op, lhs, rhs) =>
            Expr::binary(*op, replace_calls(lhs, rates, errors), replace_calls(rhs, rates, errors)),
        Expr::Unary(op, operand) => Expr::Unary(*op, Box::new(replace_calls(operand, rates, errors))),
        Expr::Tuple(items) =>
            Expr::Tuple(items.iter().map(|item| replace_calls(item, rates, errors)).collect()),
        Expr::Literal(_) | Expr::Rate(_) | Expr::Identifier(_) => expr.clone(),
    }
}

/// Post-order walk pushing each node's value onto `values`.
fn evaluate(expr: &Expr, values: &mut Vec<BidAsk>) -> Result<(), RateRulesError> {
    match expr {
        Expr::Literal(value) => values.push(BidAsk::point(*value)),
        Expr::Rate(bid_ask) => values.push(*bid_ask),
        Expr::Tuple(items) => {
            if items.len() != 2 {
                return Err(RateRulesError::UnsupportedOperator);
            }
            for item in items {
                evaluate(item, values)?;
            }
            let ask = values.pop().ok_or(RateRulesError::MissingArgument)?;
            let bid = values.pop().ok_or(RateRulesError::MissingArgument)?;
            if !bid.is_point() || !ask.is_point() {
                return Err(RateRulesError::UnsupportedOperator);
            }
            let bid_ask = BidAsk::new(bid.bid(), ask.bid())
                .map_err(|_| RateRulesError::UnsupportedOperator)?;
            values.push(bid_ask);
        }
        Expr::Binary(op, lhs, rhs) => {
            evaluate(lhs, values)?;
            evaluate(rhs, values)?;
            let b = values.pop().ok_or(RateRulesError::MissingArgument)?;
            let a = values.pop().ok_or(RateRulesError::MissingArgument)?;
            let result = match op {
                BinaryOp::Add => a.checked_add(b).ok_or(RateRulesError::UnsupportedOperator)?,
                BinaryOp::Sub => a.checked_sub(b).ok_or(RateRulesError::UnsupportedOperator)?,
                BinaryOp::Mul => a.checked_mul(b).ok_or(RateRulesError::UnsupportedOperator)?,
                BinaryOp::Div => a.checked_div(b).ok_or(RateRulesError::DivideByZero)?,
            };
            values.push(result);
        }
        Expr::Unary(op, operand) => {
            evaluate(operand, values)?;
            let value = values.pop().ok_or(RateRulesError::MissingArgument)?;
            match op {
                UnaryOp::Plus => values.push(value),
                UnaryOp::Minus if value.is_point() => values.push(BidAsk::point(-value.bid())),
                UnaryOp::Minus => return Err(RateRulesError::InvalidNegative),
            }
        }
        Expr::Identifier(_) | Expr::Call { .. } => return Err(RateRulesError::UnsupportedOperator),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn pair(s: &str) -> CurrencyPair { s.parse().unwrap() }

    fn rules(script: &str) -> RateRules { script.parse().expect("valid rules") }

    #[test]
    fn prefers_direct_rule_over_inverse() {
        let rules = rules("BTC_EUR = kraken(BTC_EUR);\nEUR_BTC = bitpay(EUR_BTC)");
        let rule = rules.get_rule_for(&pair("BTC_EUR"));
        assert_eq!(rule.to_string(), "kraken(BTC_EUR)");
    }

    #[test]
    fn synthesizes_inverse() {
        let rules = rules("EUR_BTC = bitpay(EUR_BTC)");
        let mut rule = rules.get_rule_for(&pair("BTC_EUR"));
        assert_eq!(rule.to_string(), "1 / bitpay(EUR_BTC)");
        rule.exchange_rates_mut().set_rate(
            "bitpay",
            pair("EUR_BTC"),
            BidAsk::new(dec!(0.00002), dec!(0.000025)).unwrap(),
        );
        assert!(rule.reevaluate());
        let bid_ask = rule.bid_ask().unwrap();
        assert_eq!(bid_ask, BidAsk::new(dec!(40000), dec!(50000)).unwrap());
    }

    #[test]
    fn wildcard_fallback_substitutes_the_target() {
        let rules = rules("BTC_X = coingecko(BTC_X)");
        let rule = rules.get_rule_for(&pair("BTC_USD"));
        assert_eq!(rule.to_string(), "coingecko(BTC_USD)");
        let deps: Vec<_> = rule.exchange_rates().iter().collect();
        assert_eq!(deps, vec![ExchangeRate::new("coingecko", pair("BTC_USD"), None)]);
    }

    #[test]
    fn inlines_indirections_with_parentheses() {
        let rules = rules(
            "BTC_X = kraken(BTC_X);\nLTC_BTC = bittrex(LTC_BTC) + 0;\nLTC_X = LTC_BTC * BTC_X",
        );
        let mut rule = rules.get_rule_for(&pair("LTC_USD"));
        assert_eq!(rule.to_string(), "(bittrex(LTC_BTC) + 0) * kraken(BTC_USD)");
        assert_eq!(rule.exchange_rates().len(), 2);

        let mut source = ExchangeRates::new();
        source.set_rate("bittrex", pair("LTC_BTC"), BidAsk::point(dec!(0.002)));
        source.set_rate("kraken", pair("BTC_USD"), BidAsk::point(dec!(50000)));
        rule.fetch_from(&source);
        assert!(rule.reevaluate());
        assert_eq!(rule.bid_ask(), Some(BidAsk::point(dec!(100))));
    }

    #[test]
    fn spread_widens_point_rates() {
        let mut rules = rules("BTC_USD = kraken(BTC_USD)");
        rules.set_spread(dec!(0.01)).unwrap();
        let mut rule = rules.get_rule_for(&pair("BTC_USD"));
        assert_eq!(rule.to_string(), "kraken(BTC_USD) * (0.99, 1.01)");
        rule.exchange_rates_mut().set_rate("kraken", pair("BTC_USD"), BidAsk::point(dec!(100)));
        assert!(rule.reevaluate());
        assert_eq!(rule.bid_ask(), Some(BidAsk::new(dec!(99), dec!(101)).unwrap()));
    }

    #[test]
    fn identity_is_one() {
        let rules = rules("");
        let mut rule = rules.get_rule_for(&pair("BTC_BTC"));
        assert_eq!(rule.to_string(), "1.0");
        assert!(rule.reevaluate());
        assert_eq!(rule.bid_ask(), Some(BidAsk::point(dec!(1))));
    }

    #[test]
    fn deep_indirection_stops() {
        let script = (0..12)
            .map(|i| format!("C{i:02}_USD = C{:02}_USD", i + 1))
            .collect::<Vec<_>>()
            .join(";");
        let rules = rules(&script);
        let mut rule = rules.get_rule_for(&pair("C00_USD"));
        assert!(rule.errors().contains(&RateRulesError::TooMuchNestedCalls));
        assert!(rule.to_string().contains("ERR_TOO_MUCH_NESTED_CALLS"));
        assert!(!rule.reevaluate());
        assert!(rule.errors().contains(&RateRulesError::TooMuchNestedCalls));
        assert!(rule.errors().contains(&RateRulesError::PreprocessError));
    }

    #[test]
    fn self_reference_stops() {
        let rules = rules("BTC_USD = 1 / USD_BTC");
        let rule = rules.get_rule_for(&pair("BTC_USD"));
        assert!(rule.errors().contains(&RateRulesError::TooMuchNestedCalls));
    }

    #[test]
    fn missing_rule_is_a_preprocess_error() {
        let rules = rules("LTC_USD = kraken(LTC_USD)");
        let mut rule = rules.get_rule_for(&pair("BTC_EUR"));
        assert_eq!(rule.to_string(), "ERR_NO_RULE_MATCH(BTC_EUR)");
        assert!(rule.exchange_rates().is_empty());
        assert!(!rule.reevaluate());
        assert_eq!(rule.errors().iter().collect::<Vec<_>>(), vec![&RateRulesError::PreprocessError]);
    }

    #[test]
    fn reevaluate_clears_previous_errors() {
        let rules = rules("BTC_USD = kraken(BTC_USD)");
        let mut rule = rules.get_rule_for(&pair("BTC_USD"));
        assert!(!rule.reevaluate());
        assert!(rule.errors().contains(&RateRulesError::RateUnavailable));
        assert_eq!(rule.bid_ask(), None);

        rule.exchange_rates_mut().set_rate("kraken", pair("BTC_USD"), BidAsk::point(dec!(5)));
        assert!(rule.reevaluate());
        assert!(rule.errors().is_empty());
        assert!(rule.reevaluate());
        assert_eq!(rule.bid_ask(), Some(BidAsk::point(dec!(5))));
    }

    #[test]
    fn evaluation_errors() {
        let cases = [
            ("BTC_USD = 1 / (kraken(BTC_USD) - kraken(BTC_USD))", RateRulesError::DivideByZero),
            ("BTC_USD = -(1, 2)", RateRulesError::InvalidNegative),
            ("BTC_USD = (1, 2, 3)", RateRulesError::UnsupportedOperator),
            ("BTC_USD = (2, 1)", RateRulesError::UnsupportedOperator),
            ("BTC_USD = kraken(1)", RateRulesError::UnsupportedOperator),
        ];
        for (script, expected) in cases {
            let rules = rules(script);
            let mut rule = rules.get_rule_for(&pair("BTC_USD"));
            rule.exchange_rates_mut().set_rate("kraken", pair("BTC_USD"), BidAsk::point(dec!(3)));
            assert!(!rule.reevaluate(), "{script}");
            assert!(rule.errors().contains(&expected), "{script}: {:?}", rule.errors());
        }
    }

    #[test]
    fn negating_point_values() {
        let rules = rules("BTC_USD = 10 + -kraken(BTC_USD)");
        let mut rule = rules.get_rule_for(&pair("BTC_USD"));
        rule.exchange_rates_mut().set_rate("kraken", pair("BTC_USD"), BidAsk::point(dec!(3)));
        assert!(rule.reevaluate());
        assert_eq!(rule.bid_ask(), Some(BidAsk::point(dec!(7))));
    }
}
