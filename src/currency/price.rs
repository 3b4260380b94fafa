//! Price expressions.
//!
//! ```text
//! 150 chaos     absolute
//! * 1.2         relative: base price scaled
//! / 2           relative: base price divided
//! + 10 chaos    relative: base price plus an absolute amount
//! - 1 exa       relative: base price minus an absolute amount
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

use crate::error::CompileError;

static EXPR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([+\-*/]?)\s*(.+?)\s*$").expect("price expression pattern is valid")
});

static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+(?:\.[0-9]+)?)\s*([a-z][a-z'\- ]*)$").expect("amount pattern is valid")
});

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(?:\.[0-9]+)?$").expect("number pattern is valid"));

/// An amount in some currency, as written: `3 exa`.
#[derive(Debug, Clone, PartialEq)]
pub struct Amount {
    pub value: Decimal,
    /// Currency alias, lowercased.
    pub currency: String,
}

impl Amount {
    pub fn parse(text: &str) -> Option<Self> {
        let lowered = text.trim().to_lowercase();
        let caps = AMOUNT_RE.captures(&lowered)?;
        let value = Decimal::from_str(&caps[1]).ok()?;
        Some(Self {
            value,
            currency: caps[2].trim().to_string(),
        })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value.normalize(), self.currency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    Add,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PriceExpr {
    Absolute(Amount),
    Offset(Offset, Amount),
    Scale(Scale, Decimal),
}

impl PriceExpr {
    pub fn parse(text: &str) -> Result<Self, CompileError> {
        let invalid = || CompileError::InvalidPrice(text.to_string());
        let caps = EXPR_RE.captures(text).ok_or_else(invalid)?;
        let operand = &caps[2];

        match &caps[1] {
            "" => Amount::parse(operand)
                .map(PriceExpr::Absolute)
                .ok_or_else(invalid),
            op @ ("+" | "-") => {
                let amount = Amount::parse(operand).ok_or_else(invalid)?;
                let offset = if op == "+" { Offset::Add } else { Offset::Sub };
                Ok(PriceExpr::Offset(offset, amount))
            }
            op => {
                if !NUMBER_RE.is_match(operand) {
                    return Err(invalid());
                }
                let factor = Decimal::from_str(operand).map_err(|_| invalid())?;
                if factor <= Decimal::ZERO {
                    return Err(CompileError::NonPositiveFactor(text.to_string()));
                }
                let scale = if op == "*" { Scale::Mul } else { Scale::Div };
                Ok(PriceExpr::Scale(scale, factor))
            }
        }
    }

    pub fn is_relative(&self) -> bool {
        !matches!(self, PriceExpr::Absolute(_))
    }

    /// Currency alias this expression prices in, if any.
    pub fn currency(&self) -> Option<&str> {
        match self {
            PriceExpr::Absolute(amount) | PriceExpr::Offset(_, amount) => Some(&amount.currency),
            PriceExpr::Scale(..) => None,
        }
    }

    /// Evaluate against an optional base price. `rate_of` resolves a
    /// currency alias to its value in the base unit.
    pub fn evaluate<F>(&self, base: Option<Decimal>, mut rate_of: F) -> Result<Decimal, CompileError>
    where
        F: FnMut(&str) -> Result<Decimal, CompileError>,
    {
        let needs_base = || CompileError::RelativeWithoutBase(self.to_string());
        let value = match self {
            PriceExpr::Absolute(amount) => amount.value.checked_mul(rate_of(&amount.currency)?),
            PriceExpr::Offset(offset, amount) => {
                let base = base.ok_or_else(needs_base)?;
                amount
                    .value
                    .checked_mul(rate_of(&amount.currency)?)
                    .and_then(|value| match offset {
                        Offset::Add => base.checked_add(value),
                        Offset::Sub => base.checked_sub(value),
                    })
            }
            PriceExpr::Scale(scale, factor) => {
                let base = base.ok_or_else(needs_base)?;
                match scale {
                    Scale::Mul => base.checked_mul(*factor),
                    Scale::Div => base.checked_div(*factor),
                }
            }
        };
        value.ok_or_else(|| CompileError::InvalidPrice(self.to_string()))
    }
}

impl FromStr for PriceExpr {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PriceExpr::parse(s)
    }
}

impl fmt::Display for PriceExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceExpr::Absolute(amount) => write!(f, "{amount}"),
            PriceExpr::Offset(Offset::Add, amount) => write!(f, "+ {amount}"),
            PriceExpr::Offset(Offset::Sub, amount) => write!(f, "- {amount}"),
            PriceExpr::Scale(Scale::Mul, factor) => write!(f, "* {}", factor.normalize()),
            PriceExpr::Scale(Scale::Div, factor) => write!(f, "/ {}", factor.normalize()),
        }
    }
}
