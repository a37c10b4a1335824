//! Job parameters and connection settings.

use std::path::{Component, Path};
use std::time::Duration;

use outpost_core::backoff::{BackoffConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::error::EtlError;

/// Longest identifier PostgreSQL keeps without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Parameters piped to the job on stdin. Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlParams {
    /// Table to extract from.
    pub table_name: String,
    /// Output file, relative to the job's working directory.
    pub output_filename: String,
    /// Factor applied to each row's `value`.
    pub multiplier: f64,
}

impl Default for EtlParams {
    fn default() -> Self {
        Self {
            table_name: "sample_data".to_string(),
            output_filename: "output_data.txt".to_string(),
            multiplier: 1.1,
        }
    }
}

impl EtlParams {
    /// Parse stdin contents. Blank input means all defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, EtlError> {
        let params: Self = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_json::from_str(raw).map_err(|e| EtlError::Params(e.to_string()))?
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), EtlError> {
        quote_identifier(&self.table_name)?;

        let output = Path::new(&self.output_filename);
        let escapes = output
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if self.output_filename.trim().is_empty() || escapes {
            return Err(EtlError::Params(format!(
                "output_filename must be a relative path inside the working directory, got '{}'",
                self.output_filename
            )));
        }

        if !self.multiplier.is_finite() {
            return Err(EtlError::Params("multiplier must be a finite number".to_string()));
        }
        Ok(())
    }
}

/// Validate `name` as a plain SQL identifier and return it double-quoted.
pub fn quote_identifier(name: &str) -> Result<String, EtlError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(EtlError::InvalidTable(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}

/// Connection retry policy.
///
/// | Env Var               | Default |
/// |-----------------------|---------|
/// | `DB_CONNECT_RETRIES`  | `2`     |
/// | `DB_RETRY_DELAY_SECS` | `5`     |
pub fn connect_policy(lookup: impl Fn(&str) -> Option<String>) -> Result<RetryPolicy, EtlError> {
    let parse = |key: &str, default: u64| -> Result<u64, EtlError> {
        match lookup(key).filter(|v| !v.trim().is_empty()) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| EtlError::Params(format!("{key} must be a whole number, got '{raw}'"))),
            None => Ok(default),
        }
    };

    let retries = u32::try_from(parse("DB_CONNECT_RETRIES", 2)?)
        .map_err(|_| EtlError::Params("DB_CONNECT_RETRIES is too large".to_string()))?;
    let delay = Duration::from_secs(parse("DB_RETRY_DELAY_SECS", 5)?);
    Ok(RetryPolicy::new(retries, BackoffConfig::fixed(delay)))
}
