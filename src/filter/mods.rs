//! Modifier filter groups.
//!
//! A member matches when its category's modifier lines produce a nonzero
//! aggregate inside the member's bounds. A group counts matching members
//! and compares the count with its own bounds.

use regex::{Regex, RegexBuilder};

use crate::error::CompileError;
use crate::filter::definition::{FilterGroupDef, GroupType, ModFilterDef};
use crate::filter::pseudo::{self, PseudoMod};
use crate::item::{Item, ModCategory};

/// Aggregate of one modifier line: the mean of its captured numbers, or 1
/// for a match without captures. 0 when the line does not match.
pub fn line_total(re: &Regex, line: &str) -> f64 {
    let Some(caps) = re.captures(line) else {
        return 0.0;
    };
    let values: Vec<f64> = caps
        .iter()
        .skip(1)
        .flatten()
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    if values.is_empty() {
        return 1.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn line_values(re: &Regex, line: &str) -> Option<Vec<f64>> {
    let caps = re.captures(line)?;
    caps.iter()
        .skip(1)
        .map(|m| m.and_then(|m| m.as_str().parse().ok()))
        .collect()
}

/// How captured numbers become a pass/fail decision.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericAggregator {
    /// Sum of [`line_total`] over all matching lines, checked against
    /// optional inclusive bounds. A zero total never passes.
    Total { min: Option<f64>, max: Option<f64> },
    /// Some matching line with a nonzero roll has every captured value at
    /// or above the minimum in the same position.
    Positional(Vec<f64>),
}

impl NumericAggregator {
    pub fn accepts(&self, total: f64) -> bool {
        if total == 0.0 {
            return false;
        }
        match self {
            NumericAggregator::Total { min, max } => {
                min.map_or(true, |min| total >= min) && max.map_or(true, |max| total <= max)
            }
            NumericAggregator::Positional(_) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ModMatcher {
    Text { category: ModCategory, regex: Regex },
    Pseudo(&'static PseudoMod),
}

#[derive(Debug, Clone)]
pub struct ModFilter {
    pub matcher: ModMatcher,
    pub aggregator: NumericAggregator,
}

impl ModFilter {
    pub fn compile(def: &ModFilterDef) -> Result<Self, CompileError> {
        let category = ModCategory::from_name(&def.category).ok_or_else(|| {
            CompileError::criteria("fgs", format!("unknown modifier category '{}'", def.category))
        })?;

        let matcher = if category == ModCategory::Pseudo {
            let pseudo = pseudo::lookup(&def.expr).ok_or_else(|| {
                CompileError::criteria("fgs", format!("unknown pseudo modifier '{}'", def.expr))
            })?;
            ModMatcher::Pseudo(pseudo)
        } else {
            let regex = RegexBuilder::new(&format!("^(?:{})", def.expr))
                .case_insensitive(true)
                .build()
                .map_err(|e| CompileError::InvalidRegex {
                    pattern: def.expr.clone(),
                    reason: e.to_string(),
                })?;
            ModMatcher::Text { category, regex }
        };

        let aggregator = if def.values.is_empty() {
            NumericAggregator::Total {
                min: def.min,
                max: def.max,
            }
        } else {
            let ModMatcher::Text { regex, .. } = &matcher else {
                return Err(CompileError::criteria(
                    "fgs",
                    "positional values need a pattern, not a pseudo modifier",
                ));
            };
            let groups = regex.captures_len() - 1;
            if groups != def.values.len() {
                return Err(CompileError::criteria(
                    "fgs",
                    format!(
                        "'{}' captures {} values but {} are given",
                        def.expr,
                        groups,
                        def.values.len()
                    ),
                ));
            }
            NumericAggregator::Positional(def.values.clone())
        };

        Ok(Self {
            matcher,
            aggregator,
        })
    }

    /// Aggregated value of this member on `item`.
    pub fn value(&self, item: &Item) -> f64 {
        match &self.matcher {
            ModMatcher::Pseudo(pseudo) => pseudo.value(item),
            ModMatcher::Text { category, regex } => item
                .mods(*category)
                .iter()
                .map(|line| line_total(regex, line))
                .sum(),
        }
    }

    pub fn matches(&self, item: &Item) -> bool {
        match (&self.aggregator, &self.matcher) {
            (NumericAggregator::Positional(mins), ModMatcher::Text { category, regex }) => item
                .mods(*category)
                .iter()
                .filter_map(|line| line_values(regex, line))
                // an all-zero roll is absent, as with totals
                .filter(|values| values.iter().any(|v| *v != 0.0))
                .any(|values| values.iter().zip(mins).all(|(v, min)| v >= min)),
            (aggregator, _) => aggregator.accepts(self.value(item)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModFilterGroup {
    pub kind: GroupType,
    pub members: Vec<ModFilter>,
    pub match_min: usize,
    pub match_max: usize,
}

impl ModFilterGroup {
    /// Count bounds default to the member count, so an unbounded count
    /// group behaves like `all`.
    pub fn compile(def: &FilterGroupDef) -> Result<Self, CompileError> {
        let members = def
            .mfs
            .iter()
            .map(ModFilter::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let size = members.len();
        let (match_min, match_max) = match def.kind {
            GroupType::All => (size, size),
            GroupType::None => (0, 0),
            GroupType::Count => (def.match_min.unwrap_or(size), def.match_max.unwrap_or(size)),
        };
        Ok(Self {
            kind: def.kind,
            members,
            match_min,
            match_max,
        })
    }

    pub fn check(&self, item: &Item) -> bool {
        if self.match_max < self.match_min {
            return false;
        }

        let total = self.members.len();
        let mut matched = 0;
        for (i, member) in self.members.iter().enumerate() {
            if member.matches(item) {
                matched += 1;
                if matched > self.match_max {
                    return false;
                }
            }
            let remaining = total - i - 1;
            if matched + remaining < self.match_min {
                return false;
            }
        }
        (self.match_min..=self.match_max).contains(&matched)
    }
}
