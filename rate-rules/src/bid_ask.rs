use std::fmt;
use std::ops::{Add, Div, Mul, Sub};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A bid/ask spread. `bid <= ask` holds for every value of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BidAsk {
    bid: Decimal,
    ask: Decimal,
}

impl BidAsk {
    pub fn new(bid: Decimal, ask: Decimal) -> Result<Self, BidAskError> {
        if bid > ask {
            return Err(BidAskError { bid, ask });
        }
        Ok(BidAsk { bid, ask })
    }

    /// A spread with no width.
    pub fn point(value: Decimal) -> Self { BidAsk { bid: value, ask: value } }

    pub fn bid(&self) -> Decimal { self.bid }

    pub fn ask(&self) -> Decimal { self.ask }

    pub fn is_point(&self) -> bool { self.bid == self.ask }

    pub fn center(&self) -> Decimal { (self.bid + self.ask) / Decimal::TWO }

    /// `(1/ask, 1/bid)`. `None` when either side is zero.
    pub fn inverse(&self) -> Option<BidAsk> {
        let bid = Decimal::ONE.checked_div(self.ask)?;
        let ask = Decimal::ONE.checked_div(self.bid)?;
        Some(BidAsk::ordered(bid, ask))
    }

    pub fn checked_add(self, rhs: BidAsk) -> Option<BidAsk> {
        Some(BidAsk {
            bid: self.bid.checked_add(rhs.bid)?,
            ask: self.ask.checked_add(rhs.ask)?,
        })
    }

    pub fn checked_sub(self, rhs: BidAsk) -> Option<BidAsk> {
        Some(BidAsk {
            bid: self.bid.checked_sub(rhs.ask)?,
            ask: self.ask.checked_sub(rhs.bid)?,
        })
    }

    pub fn checked_mul(self, rhs: BidAsk) -> Option<BidAsk> {
        let products = [
            self.bid.checked_mul(rhs.bid)?,
            self.bid.checked_mul(rhs.ask)?,
            self.ask.checked_mul(rhs.bid)?,
            self.ask.checked_mul(rhs.ask)?,
        ];
        let bid = products.iter().copied().min()?;
        let ask = products.iter().copied().max()?;
        Some(BidAsk { bid, ask })
    }

    /// `(self.bid / rhs.ask, self.ask / rhs.bid)` for positive spreads; the
    /// cross terms keep `bid <= ask` on the result. `None` when `rhs`
    /// touches zero.
    pub fn checked_div(self, rhs: BidAsk) -> Option<BidAsk> {
        if rhs.bid <= Decimal::ZERO && rhs.ask >= Decimal::ZERO {
            return None;
        }
        self.checked_mul(rhs.inverse()?)
    }

    // Reciprocals of rounded decimals can land one ulp apart in the wrong order.
    fn ordered(a: Decimal, b: Decimal) -> BidAsk {
        if a <= b {
            BidAsk { bid: a, ask: b }
        } else {
            BidAsk { bid: b, ask: a }
        }
    }
}

impl<'de> Deserialize<'de> for BidAsk {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            bid: Decimal,
            ask: Decimal,
        }
        let raw = Raw::deserialize(deserializer)?;
        BidAsk::new(raw.bid, raw.ask).map_err(serde::de::Error::custom)
    }
}

impl From<Decimal> for BidAsk {
    fn from(value: Decimal) -> Self { BidAsk::point(value) }
}

impl Add for BidAsk {
    type Output = BidAsk;

    fn add(self, rhs: BidAsk) -> BidAsk { self.checked_add(rhs).expect("BidAsk addition overflowed") }
}

impl Sub for BidAsk {
    type Output = BidAsk;

    fn sub(self, rhs: BidAsk) -> BidAsk {
        self.checked_sub(rhs).expect("BidAsk subtraction overflowed")
    }
}

impl Mul for BidAsk {
    type Output = BidAsk;

    fn mul(self, rhs: BidAsk) -> BidAsk {
        self.checked_mul(rhs).expect("BidAsk multiplication overflowed")
    }
}

impl Div for BidAsk {
    type Output = BidAsk;

    /// Panics on division by a spread touching zero, like `Decimal` does.
    fn div(self, rhs: BidAsk) -> BidAsk { self.checked_div(rhs).expect("BidAsk division by zero") }
}

impl fmt::Display for BidAsk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_point() {
            write!(f, "{}", self.bid)
        } else {
            write!(f, "({}, {})", self.bid, self.ask)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidAskError {
    bid: Decimal,
    ask: Decimal,
}

impl fmt::Display for BidAskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bid {} is greater than ask {}", self.bid, self.ask)
    }
}

impl std::error::Error for BidAskError {}
