//! Error types shared across Lensforge crates.

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value outside its allowed range
    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Get a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check your config file at ~/.config/lensforge/config.toml"),
            Error::Validation(_) => Some("Check value ranges: madness levels are 0-10"),
        }
    }
}

/// Format an error with its recovery suggestion.
pub fn format_error_with_suggestion(error: &Error) -> String {
    let mut output = error.to_string();
    if let Some(suggestion) = error.recovery_suggestion() {
        output.push_str(&format!("\n  Suggestion: {}", suggestion));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_has_suggestion() {
        let err = Error::Config("bad backend".into());
        assert!(err.to_string().contains("bad backend"));
        assert!(format_error_with_suggestion(&err).contains("Suggestion"));
    }

    #[test]
    fn test_validation_error_mentions_range() {
        let err = Error::Validation("averageMadnessIndex 42 outside 0..=10".into());
        assert!(err.to_string().starts_with("Validation error"));
        assert!(err.recovery_suggestion().unwrap().contains("0-10"));
    }
}
