use std::collections::BTreeSet;
use std::fmt;

/// Why a rate rule could not be parsed, resolved or evaluated.
///
/// A rule with no errors is in the `Ok` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RateRulesError {
    TooMuchNestedCalls,
    InvalidCurrencyIdentifier,
    NestedInvocation,
    UnsupportedOperator,
    MissingArgument,
    DivideByZero,
    InvalidNegative,
    PreprocessError,
    RateUnavailable,
    InvalidExchangeName,
}

impl RateRulesError {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TooMuchNestedCalls => "TooMuchNestedCalls",
            Self::InvalidCurrencyIdentifier => "InvalidCurrencyIdentifier",
            Self::NestedInvocation => "NestedInvocation",
            Self::UnsupportedOperator => "UnsupportedOperator",
            Self::MissingArgument => "MissingArgument",
            Self::DivideByZero => "DivideByZero",
            Self::InvalidNegative => "InvalidNegative",
            Self::PreprocessError => "PreprocessError",
            Self::RateUnavailable => "RateUnavailable",
            Self::InvalidExchangeName => "InvalidExchangeName",
        }
    }
}

impl fmt::Display for RateRulesError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { f.write_str(self.as_str()) }
}

impl std::error::Error for RateRulesError {}

/// A statement that could not be tokenized or parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Returned when a rule script cannot be turned into [`crate::RateRules`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesParseError {
    errors: BTreeSet<RateRulesError>,
    syntax: Option<SyntaxError>,
}

impl RulesParseError {
    pub(crate) fn new(errors: BTreeSet<RateRulesError>, syntax: Option<SyntaxError>) -> Self {
        RulesParseError { errors, syntax }
    }

    pub(crate) fn syntax(error: SyntaxError) -> Self {
        RulesParseError { errors: BTreeSet::new(), syntax: Some(error) }
    }

    pub fn errors(&self) -> &BTreeSet<RateRulesError> { &self.errors }

    pub fn syntax_error(&self) -> Option<&SyntaxError> { self.syntax.as_ref() }
}

impl fmt::Display for RulesParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid rate rules")?;
        if let Some(syntax) = &self.syntax {
            write!(f, ": {syntax}")?;
        }
        for error in &self.errors {
            write!(f, " [{error}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for RulesParseError {}
