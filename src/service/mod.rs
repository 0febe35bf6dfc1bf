//! Interface to the external generative service.

use async_trait::async_trait;
use thiserror::Error;

pub mod gemini;

pub use gemini::GeminiService;

/// Prompt text sent by a probe call.
pub const PROBE_PROMPT: &str = "Test";

/// Request envelope shared by service implementations.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    /// Full prompt, embedding the batch records and output-schema instructions.
    pub prompt: String,
}

/// Raw text returned by the service.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    /// Model output; expected to contain the structured variant array.
    pub text: String,
}

/// Failure modes surfaced by a generation call.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The credential ran out of quota.
    #[error("quota exceeded: {0}")]
    Quota(String),
    /// The credential was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The call did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// The call succeeded but carried no usable text.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Any other transport or server failure.
    #[error("service call failed: {0}")]
    Other(String),
}

/// Coarse class of a failed call, used by the pool, limiter and monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum FailureKind {
    Quota,
    Unauthorized,
    Timeout,
    Malformed,
    Other,
}

impl ServiceError {
    /// Classifies the failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            ServiceError::Quota(_) => FailureKind::Quota,
            ServiceError::Unauthorized(_) => FailureKind::Unauthorized,
            ServiceError::Timeout => FailureKind::Timeout,
            ServiceError::Malformed(_) => FailureKind::Malformed,
            ServiceError::Other(_) => FailureKind::Other,
        }
    }
}

impl FailureKind {
    /// Stable name used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Quota => "quota",
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::Timeout => "timeout",
            FailureKind::Malformed => "malformed",
            FailureKind::Other => "other",
        }
    }
}

/// Trait implemented by concrete generative backends.
///
/// The credential token is passed per call so one client serves the whole pool.
#[async_trait]
pub trait GenerativeService: Send + Sync {
    /// Issues one generation call.
    async fn generate(
        &self,
        token: &str,
        request: &ServiceRequest,
    ) -> Result<ServiceResponse, ServiceError>;

    /// Health probe used before a credential joins the pool.
    async fn probe(&self, token: &str) -> Result<(), ServiceError> {
        let request = ServiceRequest {
            prompt: PROBE_PROMPT.to_string(),
        };
        let response = self.generate(token, &request).await?;
        if response.text.trim().is_empty() {
            return Err(ServiceError::Malformed("empty probe response".to_string()));
        }
        Ok(())
    }
}
