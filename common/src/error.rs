use thiserror::Error;

/// A request payload that is missing a field or carries one that cannot be coerced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Field [{0}] not provided.")]
    MissingField(String),
    #[error("Field [{field}] is invalid: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Request body is not a JSON object: {0}")]
    MalformedBody(String),
    #[error("Config invariant violated: {0}")]
    Invariant(String),
}

impl ValidationError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// A GPIO allocation or write that the hardware rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("GPIO{pin}: {reason}")]
pub struct HardwareError {
    pub pin: u8,
    pub reason: String,
}

impl HardwareError {
    pub fn new(pin: u8, reason: impl Into<String>) -> Self {
        Self {
            pin,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("radio: {0}")]
pub struct RadioError(pub String);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// Outcome of a rejected domain operation, as seen by API callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoardError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NoOp(String),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl BoardError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::NoOp(_) => 406,
            Self::Conflict(_) => 409,
            Self::Hardware(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            BoardError::from(ValidationError::MissingField("ssid".into())).status(),
            400
        );
        assert_eq!(BoardError::NotFound("x".into()).status(), 404);
        assert_eq!(BoardError::NoOp("x".into()).status(), 406);
        assert_eq!(BoardError::Conflict("x".into()).status(), 409);
        assert_eq!(BoardError::from(HardwareError::new(4, "busy")).status(), 500);
    }

    #[test]
    fn missing_field_message_names_the_field() {
        let err = ValidationError::MissingField("password".into());
        assert_eq!(err.to_string(), "Field [password] not provided.");
    }
}
