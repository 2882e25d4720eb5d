// Type definitions shared across the metering and payment layers

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::metering::LedgerError;
use crate::payment::PaymentError;
use crate::storage::StorageError;

/// Unit of a [`CurrencyAmount`], matching the payment API's enum names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CurrencyUnit {
    Bitcoin,
    Satoshi,
    Millisatoshi,
}

impl CurrencyUnit {
    /// Millisatoshis in one unit of this currency.
    pub fn millisatoshis_per_unit(&self) -> i64 {
        match self {
            CurrencyUnit::Bitcoin => 100_000_000_000,
            CurrencyUnit::Satoshi => 1_000,
            CurrencyUnit::Millisatoshi => 1,
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_ascii_uppercase().as_str() {
            "BITCOIN" | "BTC" => Some(CurrencyUnit::Bitcoin),
            "SATOSHI" | "SAT" | "SATS" => Some(CurrencyUnit::Satoshi),
            "MILLISATOSHI" | "MSAT" | "MSATS" => Some(CurrencyUnit::Millisatoshi),
            _ => None,
        }
    }
}

impl std::fmt::Display for CurrencyUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CurrencyUnit::Bitcoin => write!(f, "BITCOIN"),
            CurrencyUnit::Satoshi => write!(f, "SATOSHI"),
            CurrencyUnit::Millisatoshi => write!(f, "MILLISATOSHI"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CurrencyAmount {
    pub unit: CurrencyUnit,
    pub value: i64,
}

impl CurrencyAmount {
    pub fn new(unit: CurrencyUnit, value: i64) -> Self {
        Self { unit, value }
    }

    pub fn zero(unit: CurrencyUnit) -> Self {
        Self { unit, value: 0 }
    }

    pub fn sats(value: i64) -> Self {
        Self::new(CurrencyUnit::Satoshi, value)
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    pub fn to_millisatoshis(&self) -> i64 {
        self.value.saturating_mul(self.unit.millisatoshis_per_unit())
    }

    /// Scale this amount by a whole number of billing chunks.
    pub fn times(&self, count: i64) -> Self {
        Self {
            unit: self.unit,
            value: self.value.saturating_mul(count),
        }
    }
}

impl std::fmt::Display for CurrencyAmount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Malformed telemetry: {0}")]
    MalformedTelemetry(String),

    #[error("Missing billing context: {0}")]
    MissingBillingContext(String),

    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError::MalformedTelemetry(err.to_string())
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedTelemetry(_) | AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::SessionClosed(_) => StatusCode::GONE,
            AppError::MissingBillingContext(_) => StatusCode::CONFLICT,
            AppError::Payment(_) => StatusCode::BAD_GATEWAY,
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = Json(serde_json::json!({
            "error": {
                "message": self.to_string(),
                "status": status.as_u16(),
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_serializes_like_payment_api() {
        let json = serde_json::to_string(&CurrencyAmount::sats(10)).unwrap();
        assert_eq!(json, r#"{"unit":"SATOSHI","value":10}"#);
    }

    #[test]
    fn test_millisatoshi_conversion() {
        assert_eq!(CurrencyAmount::sats(10).to_millisatoshis(), 10_000);
        assert_eq!(
            CurrencyAmount::new(CurrencyUnit::Millisatoshi, 7).to_millisatoshis(),
            7
        );
        assert_eq!(
            CurrencyAmount::new(CurrencyUnit::Bitcoin, 1).to_millisatoshis(),
            100_000_000_000
        );
    }

    #[test]
    fn test_unit_from_id() {
        assert_eq!(CurrencyUnit::from_id("satoshi"), Some(CurrencyUnit::Satoshi));
        assert_eq!(CurrencyUnit::from_id("MSAT"), Some(CurrencyUnit::Millisatoshi));
        assert_eq!(CurrencyUnit::from_id("usd"), None);
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AppError::MalformedTelemetry("end < start".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AppError::SessionNotFound("s1".to_string()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::from(StorageError::UnsupportedProvider("s3".to_string())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
