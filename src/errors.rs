//! Definition of errors.

use std::error::Error;
use std::fmt;
use std::io;

/// Error used when the argument is invalid.
#[derive(Debug)]
pub struct InvalidArgumentError {
    msg: &'static str,
}

impl fmt::Display for InvalidArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidArgumentError: {}", self.msg)
    }
}

impl Error for InvalidArgumentError {}

/// Error used when a label rule line cannot be parsed.
#[derive(Debug)]
pub struct RuleSyntaxError {
    line: String,
}

impl fmt::Display for RuleSyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RuleSyntaxError: {}", self.line)
    }
}

impl Error for RuleSyntaxError {}

/// Error used when a model file does not have the expected layout.
#[derive(Debug)]
pub struct ModelFormatError {
    msg: &'static str,
}

impl fmt::Display for ModelFormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ModelFormatError: {}", self.msg)
    }
}

impl Error for ModelFormatError {}

/// The error type for Rumrf.
#[derive(Debug)]
pub enum RumrfError {
    /// Error variant for [`InvalidArgumentError`].
    InvalidArgument(InvalidArgumentError),

    /// Error variant for [`RuleSyntaxError`].
    RuleSyntax(RuleSyntaxError),

    /// Error variant for [`ModelFormatError`].
    ModelFormat(ModelFormatError),

    /// Error variant for [`std::io::Error`].
    Io(io::Error),
}

impl RumrfError {
    /// Creates a new [`InvalidArgumentError`].
    pub(crate) const fn invalid_argument(msg: &'static str) -> Self {
        Self::InvalidArgument(InvalidArgumentError { msg })
    }

    /// Creates a new [`RuleSyntaxError`].
    pub(crate) fn rule_syntax(line: String) -> Self {
        Self::RuleSyntax(RuleSyntaxError { line })
    }

    /// Creates a new [`ModelFormatError`].
    pub(crate) const fn model_format(msg: &'static str) -> Self {
        Self::ModelFormat(ModelFormatError { msg })
    }
}

impl fmt::Display for RumrfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidArgument(e) => e.fmt(f),
            Self::RuleSyntax(e) => e.fmt(f),
            Self::ModelFormat(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
        }
    }
}

impl Error for RumrfError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RumrfError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// A specialized Result type.
pub type Result<T, E = RumrfError> = std::result::Result<T, E>;
