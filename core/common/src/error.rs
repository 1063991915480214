// core/common/src/error.rs
// Standardized error responses and handling

use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::persistence::StoreError;
use crate::tenancy::TenancyError;
use crate::validation::ValidationError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: String, error_code: String) -> Self {
        Self {
            success: false,
            error,
            error_code,
            details: None,
            request_id: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

#[derive(Debug)]
pub enum ServiceError {
    // Rejected before doing any work
    ValidationError(String),
    NotFound(String),
    Forbidden(String),
    Conflict(String),
    QuotaExceeded(String),

    // Collaborator failures
    DatabaseError(String),
    ExternalServiceError(String),
    ConnectionError(String),
    InternalError(String),
}

impl ServiceError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::ValidationError(_) => "validation_error",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::QuotaExceeded(_) => "quota_exceeded",
            ServiceError::DatabaseError(_) => "database_error",
            ServiceError::ExternalServiceError(_) => "external_service_error",
            ServiceError::ConnectionError(_) => "connection_error",
            ServiceError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ServiceError::ValidationError(msg) => msg.clone(),
            ServiceError::NotFound(msg) => msg.clone(),
            ServiceError::Forbidden(msg) => msg.clone(),
            ServiceError::Conflict(msg) => msg.clone(),
            ServiceError::QuotaExceeded(msg) => msg.clone(),
            ServiceError::DatabaseError(msg) => format!("Database error: {}", msg),
            ServiceError::ExternalServiceError(msg) => format!("External service error: {}", msg),
            ServiceError::ConnectionError(msg) => format!("Connection error: {}", msg),
            ServiceError::InternalError(msg) => format!("Internal error: {}", msg),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            ServiceError::ConnectionError(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_error_response(&self, request_id: Option<String>) -> ErrorResponse {
        let mut response = ErrorResponse::new(self.message(), self.error_code().to_string());

        if let Some(id) = request_id {
            response = response.with_request_id(id);
        }

        response
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ServiceError {}

impl ResponseError for ServiceError {
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.to_error_response(None))
    }

    fn status_code(&self) -> StatusCode {
        self.status_code()
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            other => ServiceError::DatabaseError(other.to_string()),
        }
    }
}

impl From<ValidationError> for ServiceError {
    fn from(err: ValidationError) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<TenancyError> for ServiceError {
    fn from(err: TenancyError) -> Self {
        match err {
            TenancyError::QuotaExceeded { .. } => ServiceError::QuotaExceeded(err.to_string()),
            TenancyError::PermissionDenied { .. } => ServiceError::Forbidden(err.to_string()),
            TenancyError::UnknownTenant(_) => ServiceError::NotFound(err.to_string()),
            TenancyError::Store(inner) => ServiceError::from(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TenantId;
    use crate::tenancy::{Capability, QuotaResource};

    #[test]
    fn test_error_response_creation() {
        let error = ErrorResponse::new("No UTXOs found".to_string(), "no_utxos".to_string());

        assert!(!error.success);
        assert_eq!(error.error, "No UTXOs found");
        assert!(error.details.is_none());
        assert!(error.request_id.is_none());
    }

    #[test]
    fn test_error_response_with_details_and_request_id() {
        let error = ErrorResponse::new("x".to_string(), "y".to_string())
            .with_details(serde_json::json!({"address": "L..."}))
            .with_request_id("req-123".to_string());

        assert!(error.details.is_some());
        assert_eq!(error.request_id, Some("req-123".to_string()));
    }

    #[test]
    fn test_service_error_codes() {
        let error = ServiceError::ValidationError("Invalid address".to_string());
        assert_eq!(error.error_code(), "validation_error");
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(error.message(), "Invalid address");

        let error = ServiceError::ConnectionError("pool closed".to_string());
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(format!("{}", error), "Connection error: pool closed");
    }

    #[test]
    fn test_quota_error_maps_to_429() {
        let err = TenancyError::QuotaExceeded {
            tenant_id: TenantId(1),
            resource: QuotaResource::MonitoredAddresses,
            current: 5,
            requested: 1,
            limit: 5,
        };
        let service: ServiceError = err.into();
        assert_eq!(service.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_permission_error_maps_to_403() {
        let err = TenancyError::PermissionDenied {
            tenant_id: TenantId(1),
            capability: Capability::CollectFunds,
        };
        let service: ServiceError = err.into();
        assert_eq!(service.error_code(), "forbidden");
    }

    #[test]
    fn test_store_not_found_maps_to_404() {
        let service: ServiceError = StoreError::NotFound("quota for tenant 9".to_string()).into();
        assert_eq!(service.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_response_serialization() {
        let error = ServiceError::QuotaExceeded("too many".to_string());
        let json = serde_json::to_string(&error.to_error_response(None)).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(json.contains("\"error_code\":\"quota_exceeded\""));
        assert!(!json.contains("request_id"));
    }
}
