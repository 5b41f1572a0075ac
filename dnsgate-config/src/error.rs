//! Error types for configuration loading and validation

use std::path::PathBuf;
use thiserror::Error;
use validator::ValidationErrors;

/// Unified configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found error.
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Configuration validation error.
    #[error("Invalid configuration:\n{}", format_validation_errors(.0))]
    Validation(#[source] ValidationErrors),

    /// Figment parsing error.
    #[error("Configuration parsing error: {0}")]
    Parsing(#[from] figment::Error),

    /// A domain pattern or CIDR entry that cannot be compiled into an
    /// allow rule. Arming a VM with such a profile must fail outright.
    #[error("Invalid allow-list entry '{entry}'{}: {reason}", profile_suffix(.profile))]
    InvalidPattern {
        entry: String,
        reason: String,
        profile: Option<String>,
    },

    /// I/O error.
    #[error("Configuration I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Attaches the profile name to an [`ConfigError::InvalidPattern`].
    pub(crate) fn in_profile(self, name: &str) -> Self {
        match self {
            ConfigError::InvalidPattern { entry, reason, .. } => ConfigError::InvalidPattern {
                entry,
                reason,
                profile: Some(name.to_string()),
            },
            other => other,
        }
    }
}

fn profile_suffix(profile: &Option<String>) -> String {
    match profile {
        Some(name) => format!(" in profile '{}'", name),
        None => String::new(),
    }
}

fn format_validation_errors(errors: &ValidationErrors) -> String {
    use std::fmt::Write;

    let mut output = String::new();
    for (field, errors) in errors.field_errors() {
        let _ = writeln!(output, "Field '{}':", field);
        for error in errors {
            let message = match &error.message {
                Some(msg) => msg.to_string(),
                None => error.code.to_string(),
            };
            let _ = writeln!(output, "  - {}", message);
        }
    }
    output
}

impl From<ValidationErrors> for ConfigError {
    fn from(errors: ValidationErrors) -> Self {
        ConfigError::Validation(errors)
    }
}
