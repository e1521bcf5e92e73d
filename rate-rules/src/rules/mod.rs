//! The rate rule language.
//!
//! A script assigns an expression to each currency pair:
//!
//! ```text
//! BTC_USD = kraken(BTC_USD);
//! BTC_X = coingecko(BTC_X);
//! LTC_X = bittrex(LTC_BTC) * BTC_X;
//! ```
//!
//! `exchange(PAIR)` looks a quote up on an exchange and `X` stands for
//! whichever currency the rule is resolved for. [`RateRules::get_rule_for`]
//! resolves a concrete pair into a [`RateRule`], which is then evaluated
//! against live quotes.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;

mod ast;
mod parser;
mod rule;

use ast::{BinaryOp, Expr};
use parser::Statement;
pub use rule::RateRule;

use crate::error::{RateRulesError, RulesParseError};
use crate::CurrencyPair;

/// Flattening gives up after this many pair-to-rule indirections.
pub const MAX_NESTED_CALLS: usize = 8;

/// Prefix of the sentinel calls that surface as [`RateRulesError::PreprocessError`].
pub(crate) const ERROR_CALL_PREFIX: &str = "ERR_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRules {
    statements: Vec<Statement>,
    rules: Vec<(CurrencyPair, Expr)>,
    by_pair: HashMap<CurrencyPair, usize>,
    spread: Decimal,
}

impl RateRules {
    pub fn spread(&self) -> Decimal { self.spread }

    /// Widens every resolved rule by `(1 - spread, 1 + spread)`.
    pub fn set_spread(&mut self, spread: Decimal) -> Result<(), InvalidSpread> {
        if spread < Decimal::ZERO || spread > Decimal::ONE {
            return Err(InvalidSpread(spread));
        }
        self.spread = spread;
        Ok(())
    }

    /// Pairs with an explicit rule, in script order.
    pub fn pairs(&self) -> impl Iterator<Item = &CurrencyPair> { self.rules.iter().map(|(p, _)| p) }

    pub fn get_rule_for(&self, pair: &CurrencyPair) -> RateRule {
        if pair.is_identity() {
            return RateRule::new(self, pair.clone(), Expr::Literal(Decimal::new(10, 1)));
        }
        let mut candidate = self.find_best_candidate(pair);
        if !self.spread.is_zero() {
            let widening = Expr::Tuple(vec![
                Expr::Literal(Decimal::ONE - self.spread),
                Expr::Literal(Decimal::ONE + self.spread),
            ]);
            candidate = Expr::binary(BinaryOp::Mul, candidate, widening);
        }
        RateRule::new(self, pair.clone(), candidate)
    }

    /// Picks the rule used for `pair`:
    /// the pair itself, then its inverse, then `LEFT_X`/`X_RIGHT`, then the
    /// wildcards of the inverse, then `X_X`. Ties go to the rule written first.
    pub(crate) fn find_best_candidate(&self, pair: &CurrencyPair) -> Expr {
        let inverse = pair.inverse();
        let lookups = [
            (pair.clone(), 0, false),
            (inverse.clone(), 1, true),
            (CurrencyPair::new(pair.left(), "X"), 2, false),
            (CurrencyPair::new("X", pair.right()), 2, false),
            (CurrencyPair::new(inverse.left(), "X"), 3, true),
            (CurrencyPair::new("X", inverse.right()), 3, true),
            (CurrencyPair::new("X", "X"), 4, false),
        ];
        let best = lookups
            .iter()
            .filter_map(|(candidate, priority, inverted)| {
                self.by_pair.get(candidate).map(|&position| (*priority, position, *inverted))
            })
            .min_by_key(|&(priority, position, _)| (priority, position));

        match best {
            Some((_, _, true)) => Expr::binary(
                BinaryOp::Div,
                Expr::Literal(Decimal::ONE),
                Expr::Identifier(inverse.to_string()),
            ),
            Some((_, position, false)) => self.rules[position].1.clone(),
            None => Expr::call("ERR_NO_RULE_MATCH", Expr::Identifier(pair.to_string())),
        }
    }
}

impl FromStr for RateRules {
    type Err = RulesParseError;

    fn from_str(script: &str) -> Result<Self, Self::Err> {
        let mut statements = parser::parse_script(script).map_err(RulesParseError::syntax)?;
        let mut errors = BTreeSet::new();
        for statement in &mut statements {
            if let Some(target) = &mut statement.target {
                normalize(target, false, &mut errors);
            }
            normalize(&mut statement.value, false, &mut errors);
        }
        if !errors.is_empty() {
            log::debug!("rejecting rate rules: {errors:?}");
            return Err(RulesParseError::new(errors, None));
        }

        let mut rules: Vec<(CurrencyPair, Expr)> = Vec::new();
        let mut by_pair = HashMap::new();
        for statement in &statements {
            let Some(Expr::Identifier(target)) = &statement.target else { continue };
            let Ok(pair) = CurrencyPair::from_str(target) else { continue };
            if !by_pair.contains_key(&pair) {
                by_pair.insert(pair.clone(), rules.len());
                rules.push((pair, statement.value.clone()));
            }
        }
        Ok(RateRules { statements, rules, by_pair, spread: Decimal::ZERO })
    }
}

/// Canonicalizes pair identifiers and lower cases exchange names in place.
fn normalize(expr: &mut Expr, in_call: bool, errors: &mut BTreeSet<RateRulesError>) {
    match expr {
        Expr::Identifier(name) => match CurrencyPair::from_str(name) {
            Ok(pair) => *name = pair.to_string(),
            Err(_) => {
                errors.insert(RateRulesError::InvalidCurrencyIdentifier);
            }
        },
        Expr::Call { target, args } => {
            if in_call {
                errors.insert(RateRulesError::NestedInvocation);
            }
            match target.as_mut() {
                Expr::Identifier(name) => *name = name.to_ascii_lowercase(),
                _ => {
                    errors.insert(RateRulesError::InvalidExchangeName);
                }
            }
            for arg in args {
                normalize(arg, true, errors);
            }
        }
        Expr::Binary(_, lhs, rhs) => {
            normalize(lhs, in_call, errors);
            normalize(rhs, in_call, errors);
        }
        Expr::Unary(_, operand) => normalize(operand, in_call, errors),
        Expr::Tuple(items) =>
            for item in items {
                normalize(item, in_call, errors);
            },
        Expr::Literal(_) | Expr::Rate(_) => {}
    }
}

impl fmt::Display for RateRules {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for statement in &self.statements {
            match &statement.target {
                Some(target) => writeln!(f, "{} = {};", target, statement.value)?,
                None => writeln!(f, "{};", statement.value)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSpread(Decimal);

impl fmt::Display for InvalidSpread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "spread {} is outside of 0..=1", self.0)
    }
}

impl std::error::Error for InvalidSpread {}
