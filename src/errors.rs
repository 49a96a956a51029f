// =============================================================================
// Error taxonomy — every failure carries a short machine code
// =============================================================================
//
// The control layer renders errors as `{code, message, request_id, timestamp}`
// records; the machine code is stable across releases, the message is not.
// =============================================================================

use thiserror::Error;

/// All error kinds the core can surface to callers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing or malformed inputs at startup. Fatal.
    #[error("config error: {0}")]
    Config(String),

    /// Persistence store unreachable or constraint violation.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Circuit open or credential decryption failure for a gateway.
    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// The venue returned a non-success status for a specific call.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Risk policy denied the signal. Benign.
    #[error("risk rejected: {0}")]
    RiskRejected(String),

    /// Balance lock failed.
    #[error("insufficient balance: need {needed}, available {available}")]
    InsufficientBalance { needed: f64, available: f64 },

    /// Malformed order or signal (e.g. size <= 0).
    #[error("validation error: {0}")]
    Validation(String),

    /// User unknown on a user-scoped query.
    #[error("auth error: {0}")]
    Auth(String),

    /// Strategy or connection id not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A user-scoped store query was issued with an empty user id.
    #[error("user id is required")]
    UserIdRequired,

    /// Credential encryption or decryption failure.
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl CoreError {
    /// Stable machine code for the control layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG",
            Self::Persistence(_) => "STORE",
            Self::GatewayUnavailable(_) => "GW_UNAVAILABLE",
            Self::Gateway(_) => "GW_ERROR",
            Self::RiskRejected(_) => "RISK_REJECTED",
            Self::InsufficientBalance { .. } => "NO_BALANCE",
            Self::Validation(_) => "INVALID",
            Self::Auth(_) => "AUTH",
            Self::NotFound(_) => "NOT_FOUND",
            Self::UserIdRequired => "USER_ID_REQUIRED",
            Self::Crypto(_) => "CRYPTO",
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(format!("bad JSON payload: {e}"))
    }
}

/// Structured error record handed to the control layer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

impl ErrorRecord {
    pub fn from_error(err: &CoreError, request_id: Option<String>) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            request_id,
            at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::Config("x".into()).code(), "CONFIG");
        assert_eq!(CoreError::UserIdRequired.code(), "USER_ID_REQUIRED");
        assert_eq!(
            CoreError::InsufficientBalance { needed: 10.0, available: 1.0 }.code(),
            "NO_BALANCE"
        );
        assert_eq!(CoreError::Crypto("bad".into()).code(), "CRYPTO");
    }

    #[test]
    fn record_carries_code_and_message() {
        let rec = ErrorRecord::from_error(&CoreError::NotFound("strategy s1".into()), None);
        assert_eq!(rec.code, "NOT_FOUND");
        assert!(rec.message.contains("strategy s1"));
        assert!(rec.request_id.is_none());
    }
}
