/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(clippy::unwrap_used)]

//! Validation helpers shared by the jobworkerd request types.
//!
//! Every field that crosses the RPC boundary is converted into a validated
//! newtype before any side effect happens. The helpers in this crate return a
//! [ValidationError] naming the offending field so the caller can surface the
//! failure without mutating state.

#[cfg(feature = "regex")]
use fancy_regex::Regex;
#[cfg(feature = "regex")]
use lazy_static::lazy_static;

pub const UNIT_BYTES: &str = "bytes";
pub const UNIT_CHARACTERS: &str = "characters";
pub const UNIT_ITEMS: &str = "items";

#[cfg(feature = "regex")]
lazy_static! {
    /// Server-assigned job identifiers: 1-64 characters of `[A-Za-z0-9_-]`.
    pub static ref JOB_ID_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,64}$")
        .expect("failed to parse 'JOB_ID_REGEX'");
}

/// Characters that are never allowed in a command name. A command is a single
/// executable, not a shell expression.
pub const FORBIDDEN_COMMAND_CHARACTERS: &[char] =
    &[';', '&', '|', '`', '$', '(', ')'];

pub trait ValidatingType<T> {
    fn validate(self, parent_name: Option<&str>) -> Result<T, ValidationError>;
}

pub trait ValidatedType<T> {
    fn validate(
        input: T,
        parent_name: Option<&str>,
    ) -> Result<Self, ValidationError>
    where
        Self: Sized;
}

pub trait ValidatedField<T>
where
    Self: Sized,
{
    fn validate(
        input: Option<T>,
        field_name: &str,
        parent_name: Option<&str>,
    ) -> Result<Self, ValidationError>;

    /// Default implementation returns immediately when input is `None`.
    /// Otherwise, calls `Self::validate`.
    fn validate_optional(
        input: Option<T>,
        field_name: &str,
        parent_name: Option<&str>,
    ) -> Result<Option<Self>, ValidationError> {
        if input.is_none() {
            return Ok(None);
        }

        Ok(Some(Self::validate(input, field_name, parent_name)?))
    }
}

pub fn field_name(field_name: &str, parent_name: Option<&str>) -> String {
    match parent_name {
        None => field_name.to_string(),
        Some(parent_name) => format!("{parent_name}.{field_name}"),
    }
}

pub fn required<T>(
    input: Option<T>,
    field_name: &str,
    parent_name: Option<&str>,
) -> Result<T, ValidationError> {
    input.ok_or_else(|| ValidationError::Required {
        field: self::field_name(field_name, parent_name),
    })
}

pub fn required_not_empty(
    input: Option<String>,
    field_name: &str,
    parent_name: Option<&str>,
) -> Result<String, ValidationError> {
    let input = required(input, field_name, parent_name)?;

    if input.is_empty() {
        return Err(ValidationError::Required {
            field: self::field_name(field_name, parent_name),
        });
    }

    Ok(input)
}

pub fn minimum_value<T: PartialOrd + std::fmt::Display>(
    input: T,
    minimum: T,
    units: &str,
    field_name: &str,
    parent_name: Option<&str>,
) -> Result<(), ValidationError> {
    if input < minimum {
        return Err(ValidationError::Minimum {
            field: self::field_name(field_name, parent_name),
            minimum: minimum.to_string(),
            units: units.to_string(),
        });
    }

    Ok(())
}

pub fn maximum_value<T: PartialOrd + std::fmt::Display>(
    input: T,
    maximum: T,
    units: &str,
    field_name: &str,
    parent_name: Option<&str>,
) -> Result<(), ValidationError> {
    if input > maximum {
        return Err(ValidationError::Maximum {
            field: self::field_name(field_name, parent_name),
            maximum: maximum.to_string(),
            units: units.to_string(),
        });
    }

    Ok(())
}

pub fn maximum_length(
    input: &[u8],
    maximum: usize,
    units: &str,
    field_name: &str,
    parent_name: Option<&str>,
) -> Result<(), ValidationError> {
    if input.len() > maximum {
        return Err(ValidationError::Maximum {
            field: self::field_name(field_name, parent_name),
            maximum: maximum.to_string(),
            units: units.to_string(),
        });
    }

    Ok(())
}

/// Rejects input containing an embedded NUL. NUL terminates C strings, so a
/// value that carries one cannot round-trip through execve or the kernel
/// cgroup interface.
pub fn no_nul_bytes(
    input: &str,
    field_name: &str,
    parent_name: Option<&str>,
) -> Result<(), ValidationError> {
    if input.contains('\0') {
        return Err(ValidationError::Invalid {
            field: self::field_name(field_name, parent_name),
        });
    }

    Ok(())
}

pub fn disallow_characters(
    input: &str,
    forbidden: &[char],
    field_name: &str,
    parent_name: Option<&str>,
) -> Result<(), ValidationError> {
    if input.contains(forbidden) {
        return Err(ValidationError::ForbiddenCharacters {
            field: self::field_name(field_name, parent_name),
            characters: forbidden.iter().collect(),
        });
    }

    Ok(())
}

#[cfg(feature = "regex")]
pub fn allow_regex(
    input: &str,
    pattern: &Regex,
    field_name: &str,
    parent_name: Option<&str>,
) -> Result<(), ValidationError> {
    if !pattern.is_match(input).unwrap_or(false) {
        return Err(ValidationError::AllowRegexViolation {
            field: self::field_name(field_name, parent_name),
            pattern: pattern.to_string(),
        });
    }

    Ok(())
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("Field = {field}; Required")]
    Required { field: String },
    #[error("Field = {field}; Minimum = {minimum} {units}")]
    Minimum { field: String, minimum: String, units: String },
    #[error("Field = {field}; Maximum = {maximum} {units}")]
    Maximum { field: String, maximum: String, units: String },
    #[error("Field = {field}; Forbidden characters = {characters:?}")]
    ForbiddenCharacters { field: String, characters: String },
    #[cfg(feature = "regex")]
    #[error("Field = {field}; Regex = {pattern}")]
    AllowRegexViolation { field: String, pattern: String },
    #[error("Field = {field}; Invalid")]
    Invalid { field: String },
}

impl ValidationError {
    pub fn get_field(&self) -> &str {
        match self {
            Self::Required { field }
            | Self::Minimum { field, .. }
            | Self::Maximum { field, .. }
            | Self::ForbiddenCharacters { field, .. }
            | Self::Invalid { field, .. } => field,
            #[cfg(feature = "regex")]
            Self::AllowRegexViolation { field, .. } => field,
        }
    }
}

#[cfg(feature = "tonic")]
impl From<ValidationError> for tonic::Status {
    fn from(e: ValidationError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}
