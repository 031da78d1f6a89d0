//! Per-call parameter validation.

use std::time::Duration;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::error::{QuotaError, Result};

/// Rejects zero-length windows.
pub fn validate_window(window: &Duration) -> std::result::Result<(), ValidationError> {
    if window.is_zero() {
        let mut err = ValidationError::new("window");
        err.message = Some("window must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Flattens validator output into a single configuration error.
pub fn into_configuration_error(errors: ValidationErrors) -> QuotaError {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => message.to_string(),
                None => format!("invalid {}", field),
            })
        })
        .collect();
    messages.sort();
    QuotaError::Configuration(messages.join("; "))
}

/// Runs `Validate` and maps failures to [`QuotaError::Configuration`].
pub fn ensure_valid<T: Validate>(value: &T) -> Result<()> {
    value.validate().map_err(into_configuration_error)
}
