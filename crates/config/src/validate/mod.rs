//! Configuration validation
//!
//! Field-level constraints come from `validator` derives on the config types.
//! Cross-field rules live in [`semantics`], and advisory checks that never
//! fail a load live in [`lint`].

use std::fmt;

use validator::{ValidationErrors, ValidationErrorsKind};

pub mod lint;
pub mod semantics;

/// Category of a validation error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A single field violates its declared constraint
    Field,
    /// Timing values contradict each other
    Timing,
    /// DNS resolver settings
    Dns,
    /// TLS drift-check settings
    Validation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Field => "field",
            ErrorCategory::Timing => "timing",
            ErrorCategory::Dns => "dns",
            ErrorCategory::Validation => "validation",
        };
        f.write_str(name)
    }
}

/// A validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// A validation warning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Accumulated errors and warnings
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Flatten nested `validator` errors into `(dotted.path, message)` pairs
pub fn flatten_field_errors(prefix: &str, errors: &ValidationErrors) -> Vec<(String, String)> {
    let mut out = Vec::new();

    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };

        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    let message = error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("failed '{}' check", error.code));
                    out.push((path.clone(), message));
                }
            }
            ValidationErrorsKind::Struct(inner) => {
                out.extend(flatten_field_errors(&path, inner));
            }
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    out.extend(flatten_field_errors(&format!("{}[{}]", path, index), inner));
                }
            }
        }
    }

    out.sort();
    out
}
