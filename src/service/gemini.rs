//! Gemini `generateContent` client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};

use super::{GenerativeService, ServiceError, ServiceRequest, ServiceResponse};
use crate::errors::{AugmentError, Result};

/// Header carrying the credential; keeps tokens out of URLs and error text.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// HTTP client for Gemini-compatible `generateContent` endpoints.
#[derive(Clone)]
pub struct GeminiService {
    client: Client,
    endpoint: String,
}

impl GeminiService {
    /// Builds a client bound to one model.
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        if model.trim().is_empty() {
            return Err(AugmentError::Configuration(
                "missing model name".to_string(),
            ));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| {
                AugmentError::Configuration(format!("failed to build HTTP client: {err}"))
            })?;
        let endpoint = format!(
            "{}/models/{}:generateContent",
            base_url.trim_end_matches('/'),
            model.trim()
        );
        Ok(Self { client, endpoint })
    }

    fn request(&self, token: &str, body: &GenerateRequest<'_>) -> RequestBuilder {
        self.client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, token.trim())
            .json(body)
    }
}

#[async_trait]
impl GenerativeService for GeminiService {
    async fn generate(
        &self,
        token: &str,
        request: &ServiceRequest,
    ) -> Result<ServiceResponse, ServiceError> {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: &request.prompt,
                }],
            }],
        };
        let resp = self
            .request(token, &body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, text));
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|err| {
                ServiceError::Malformed(format!("undecodable body: {}", err.without_url()))
            })?;
        let text = candidate_text(parsed)?;
        Ok(ServiceResponse { text })
    }
}

fn candidate_text(parsed: GenerateResponse) -> Result<String, ServiceError> {
    let text = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<String>()
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ServiceError::Malformed(
            "response carried no candidate text".to_string(),
        ));
    }
    Ok(text)
}

fn classify_transport(err: reqwest::Error) -> ServiceError {
    let err = err.without_url();
    if err.is_timeout() {
        ServiceError::Timeout
    } else if err.is_decode() || err.is_body() {
        ServiceError::Malformed(err.to_string())
    } else {
        ServiceError::Other(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: String) -> ServiceError {
    let lowered = body.to_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS
        || lowered.contains("quota")
        || lowered.contains("resource_exhausted")
    {
        return ServiceError::Quota(format!("{status}: {}", truncate(&body)));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ServiceError::Unauthorized(format!("{status}: {}", truncate(&body)));
    }
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        return ServiceError::Timeout;
    }
    ServiceError::Other(format!("{status}: {}", truncate(&body)))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::FailureKind;

    #[test]
    fn status_classification() {
        let quota = classify_status(StatusCode::TOO_MANY_REQUESTS, String::new());
        assert_eq!(quota.kind(), FailureKind::Quota);
        let exhausted = classify_status(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#.to_string(),
        );
        assert_eq!(exhausted.kind(), FailureKind::Quota);
        let denied = classify_status(StatusCode::FORBIDDEN, "denied".to_string());
        assert_eq!(denied.kind(), FailureKind::Unauthorized);
        let other = classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string());
        assert_eq!(other.kind(), FailureKind::Other);
    }

    #[test]
    fn endpoint_includes_model() {
        let service = GeminiService::new(
            "https://example.test/v1beta/",
            "gemini-1.5-flash",
            Duration::from_secs(5),
        )
        .expect("client builds");
        assert_eq!(
            service.endpoint,
            "https://example.test/v1beta/models/gemini-1.5-flash:generateContent"
        );
    }

    #[test]
    fn response_text_joins_parts() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"{\"a\":"},{"text":"1}"}]}}]}"#,
        )
        .expect("valid response");
        assert_eq!(candidate_text(parsed).expect("text"), "{\"a\":1}");
    }

    #[test]
    fn empty_candidates_are_malformed() {
        for body in [
            r#"{}"#,
            r#"{"candidates":[{"finishReason":"SAFETY"}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"text":"  "}]}}]}"#,
        ] {
            let parsed: GenerateResponse = serde_json::from_str(body).expect("valid response");
            let err = candidate_text(parsed).expect_err("no text");
            assert_eq!(err.kind(), FailureKind::Malformed, "{body}");
        }
    }

    #[test]
    fn token_travels_in_a_header_not_the_url() {
        let service = GeminiService::new("https://example.test/v1beta", "m", Duration::from_secs(5))
            .expect("client builds");
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: "Test" }],
            }],
        };
        let request = service
            .request(" AIzaSECRETKEY123456 ", &body)
            .build()
            .expect("request builds");
        assert!(!request.url().as_str().contains("AIzaSECRETKEY123456"));
        assert_eq!(request.url().query(), None);
        assert_eq!(
            request.headers().get(API_KEY_HEADER).expect("key header"),
            "AIzaSECRETKEY123456"
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transport_errors_never_carry_the_token() {
        let service = GeminiService::new("http://127.0.0.1:9", "m", Duration::from_secs(5))
            .expect("client builds");
        let request = ServiceRequest {
            prompt: "Test".to_string(),
        };
        let err = service
            .generate("AIzaSECRETKEY123456", &request)
            .await
            .expect_err("nothing listens on the discard port");
        assert!(!err.to_string().contains("AIzaSECRETKEY123456"), "{err}");
        assert!(!err.to_string().contains("127.0.0.1"), "{err}");
    }
}
