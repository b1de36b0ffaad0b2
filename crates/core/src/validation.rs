//! Field validation rules for user-supplied input.

use serde::Serialize;

/// A single failed field check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub description: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            description: description.into(),
        }
    }
}

impl core::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.field, self.description)
    }
}

pub fn validate_length(value: &str, min: usize, max: usize) -> Result<(), String> {
    let n = value.chars().count();
    if n < min || n > max {
        return Err(format!("must contain from {min}-{max} characters"));
    }
    Ok(())
}

pub fn validate_name(value: &str) -> Result<(), String> {
    validate_length(value, 3, 100)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err("must contain only lowercase letters, digits, or underscore".to_string());
    }
    Ok(())
}

pub fn validate_password(value: &str) -> Result<(), String> {
    validate_length(value, 6, 100)
}

pub fn validate_full_name(value: &str) -> Result<(), String> {
    validate_length(value, 3, 100)?;
    if !value.chars().all(|c| c.is_ascii_alphabetic() || c == ' ') {
        return Err("must contain only letters or spaces".to_string());
    }
    Ok(())
}

pub fn validate_email(value: &str) -> Result<(), String> {
    validate_length(value, 3, 200)?;
    let invalid = || Err("is not a valid email address".to_string());

    if value.chars().any(char::is_whitespace) {
        return invalid();
    }
    let Some((local, domain)) = value.split_once('@') else {
        return invalid();
    };
    if local.is_empty() || domain.contains('@') {
        return invalid();
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return invalid();
    }
    Ok(())
}

/// Collects violations field by field; `finish` returns them all at once.
#[derive(Debug, Default)]
pub struct Violations(Vec<FieldViolation>);

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, field: &str, result: Result<(), String>) -> &mut Self {
        if let Err(description) = result {
            self.0.push(FieldViolation::new(field, description));
        }
        self
    }

    pub fn finish(self) -> Result<(), Vec<FieldViolation>> {
        if self.0.is_empty() { Ok(()) } else { Err(self.0) }
    }
}
