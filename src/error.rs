//! Typed errors for compilation and scan startup.
//!
//! Transient feed failures never surface as errors: the downloader retries
//! them in place. Everything else is either a `CompileError`, which excludes
//! the offending filter or currency, or a `ScanError`, which stops the scan.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("invalid price expression '{0}'")]
    InvalidPrice(String),

    #[error("relative price '{0}' requires a base price")]
    RelativeWithoutBase(String),

    #[error("unknown currency '{0}'")]
    UnknownCurrency(String),

    #[error("factor in '{0}' must be greater than zero")]
    NonPositiveFactor(String),

    #[error("circular reference: {}", path.join(" -> "))]
    CircularReference { path: Vec<String> },

    #[error("base filter '{0}' not found")]
    BaseNotFound(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidRegex { pattern: String, reason: String },

    #[error("invalid criteria '{key}': {reason}")]
    InvalidCriteria { key: String, reason: String },
}

impl CompileError {
    pub fn criteria(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CompileError::InvalidCriteria {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Failures that terminate the scan instead of being retried.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no active filters after compilation")]
    NoActiveFilters,

    #[error("could not obtain an initial change id")]
    NoInitialChangeId,

    #[error("currency table is empty and no rates could be fetched")]
    NoCurrencyRates,
}
