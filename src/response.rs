use std::fmt;

use http_body_util::Full;
use hyper::{body::Bytes, header::CONTENT_TYPE, Response, StatusCode};
use serde_json::Value;
use tracing::warn;

use crate::StubReturn;

/// Body sent when no stub matches the request.
pub const NOT_DECLARED_BODY: &str = "The requested route has not been declared.";
/// Body sent when the matched stub fails to produce a response.
pub const STUB_FAILED_BODY: &str = "The stub for the requested route has failed.";

const DEFAULT_STATUS: u16 = 200;
const DEFAULT_BODY: &str = "response";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    TextPlain,
    Json,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::TextPlain => "text/plain",
            ContentType::Json => "application/json",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The status, body and content type of a response, independent of the
/// transport. The status is always a valid HTTP status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDescriptor {
    pub status: u16,
    pub body: String,
    pub content_type: ContentType,
}

impl ResponseDescriptor {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            content_type: ContentType::TextPlain,
        }
    }

    /// The response for a request no stub was registered for. The 500 tells
    /// the test author a route was never stubbed, as opposed to an
    /// application level 404.
    pub fn not_declared() -> Self {
        Self::text(500, NOT_DECLARED_BODY)
    }

    /// The response for a stub whose function failed or whose return value
    /// could not be turned into a response.
    pub fn stub_failed() -> Self {
        Self::text(500, STUB_FAILED_BODY)
    }

    pub fn from_stub_return(result: StubReturn) -> Self {
        let descriptor = match result {
            StubReturn::Status(status) => Self::text(status, DEFAULT_BODY),
            StubReturn::Body(body) => Self::text(DEFAULT_STATUS, body),
            StubReturn::Structured { status, body } => {
                let status = status.unwrap_or(DEFAULT_STATUS);
                match body {
                    Some(body @ (Value::Object(_) | Value::Array(_))) => Self {
                        status,
                        body: body.to_string(),
                        content_type: ContentType::Json,
                    },
                    Some(body) => Self::text(status, scalar_body(body)),
                    None => Self::text(status, DEFAULT_BODY),
                }
            }
            StubReturn::Empty => Self::text(DEFAULT_STATUS, DEFAULT_BODY),
        };

        if StatusCode::from_u16(descriptor.status).is_err() {
            warn!("Stub returned invalid status code {}", descriptor.status);
            return Self::stub_failed();
        }
        descriptor
    }

    pub(crate) fn into_response(self) -> Response<Full<Bytes>> {
        Response::builder()
            .status(self.status)
            .header(CONTENT_TYPE, self.content_type.as_str())
            .body(Full::from(self.body))
            .expect("should be a valid response")
    }
}

// Empty, zero, false and null bodies fall back to the default body. Whole
// floats are written without a fractional part.
fn scalar_body(body: Value) -> String {
    match body {
        Value::String(s) if !s.is_empty() => s,
        Value::Number(n) if n.as_f64() != Some(0.0) => match n.as_f64() {
            Some(f) if n.is_f64() => f.to_string(),
            _ => n.to_string(),
        },
        Value::Bool(true) => "true".to_string(),
        _ => DEFAULT_BODY.to_string(),
    }
}
