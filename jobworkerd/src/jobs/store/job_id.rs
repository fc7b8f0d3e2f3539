/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2025, the jobworkerd contributors                         *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
use std::fmt::{Display, Formatter};
use validation::{ValidatedField, ValidationError};

/// Server-assigned opaque job identifier, `[A-Za-z0-9_-]{1,64}`.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct JobId(String);

impl JobId {
    /// Allocates a fresh identifier. Uniqueness across the process lifetime
    /// is enforced by the store, which retries on collision.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl ValidatedField<String> for JobId {
    fn validate(
        input: Option<String>,
        field_name: &str,
        parent_name: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let input =
            validation::required_not_empty(input, field_name, parent_name)?;

        validation::allow_regex(
            &input,
            &validation::JOB_ID_REGEX,
            field_name,
            parent_name,
        )?;

        Ok(Self(input))
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
impl From<&str> for JobId {
    fn from(x: &str) -> Self {
        JobId(x.into())
    }
}
