use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{Span, error, info, warn};

use crate::admit::{AdmitFunc, Decision};
use crate::error::{DecisionError, DecodeError};
use crate::review::{AdmissionRequest, AdmissionReviewRequest, DENIED_CODE, DENIED_REASON};

const ENCODING_FAILURE: &str = "internal error encoding admission response";

/// A client error answered with a JSON diagnostic body.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<DecodeError> for ApiError {
    fn from(err: DecodeError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({
            "message": self.message,
            "status": self.status.as_u16(),
        });

        (self.status, axum::Json(payload)).into_response()
    }
}

/// Glue between the AdmissionReview codec and one decision function.
///
/// Cloning is cheap and clones share the same decision function.
#[derive(Clone)]
pub struct AdmissionHandler {
    name: Arc<str>,
    admit: Arc<dyn AdmitFunc>,
    span: Span,
}

impl AdmissionHandler {
    /// `span` is the logging context every event of this handler is recorded in.
    pub fn new(name: impl Into<String>, admit: impl AdmitFunc + 'static, span: Span) -> Self {
        Self {
            name: Arc::from(name.into()),
            admit: Arc::new(admit),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Answer one admission call. Malformed input gets a 400; every decoded
    /// review gets a 200 whose envelope carries the verdict.
    pub fn handle(&self, path: &str, headers: &HeaderMap, body: &[u8]) -> Response {
        let _entered = self.span.enter();
        let started = Instant::now();

        let review = match check_content_type(headers)
            .and_then(|()| AdmissionReviewRequest::decode(body))
        {
            Ok(review) => review,
            Err(err) => {
                warn!(path, error = %err, "rejected admission review");
                return ApiError::from(err).into_response();
            }
        };

        let request = &review.request;
        let decision = self.evaluate(request);

        info!(
            path,
            uid = request.uid.as_str(),
            operation = request.operation.as_str(),
            kind = request.kind.kind.as_str(),
            namespace = request.namespace.as_deref().unwrap_or_default(),
            name = request.name.as_deref().unwrap_or_default(),
            allowed = decision.allowed(),
            message = decision.message().unwrap_or_default(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "admission request evaluated"
        );

        let body = review.respond(decision).encode().unwrap_or_else(|err| {
            error!(path, uid = request.uid.as_str(), error = %err, "cannot encode admission response");
            encoding_failure(&review)
        });

        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, mime::APPLICATION_JSON.as_ref())],
            body,
        )
            .into_response()
    }

    /// Run the decision function, denying on any error or panic.
    fn evaluate(&self, request: &AdmissionRequest) -> Decision {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.admit.admit(request)))
            .unwrap_or_else(|payload| Err(DecisionError::Panicked(panic_message(&*payload))));

        result.unwrap_or_else(|err| {
            error!(
                uid = request.uid.as_str(),
                error = %err,
                "admission policy failed, denying request"
            );
            Decision::deny(format!(
                "internal error evaluating admission policy {}",
                self.name
            ))
        })
    }
}

/// Deny envelope built without the response types, for when encoding the
/// real verdict fails.
fn encoding_failure(review: &AdmissionReviewRequest) -> Vec<u8> {
    json!({
        "apiVersion": review.api_version,
        "kind": review.kind,
        "response": {
            "uid": review.request.uid,
            "allowed": false,
            "status": {
                "message": ENCODING_FAILURE,
                "code": DENIED_CODE,
                "reason": DENIED_REASON,
            },
        },
    })
    .to_string()
    .into_bytes()
}

fn check_content_type(headers: &HeaderMap) -> Result<(), DecodeError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    match content_type.parse::<mime::Mime>() {
        Ok(mime) if mime.essence_str() == mime::APPLICATION_JSON.essence_str() => Ok(()),
        _ => Err(DecodeError::UnsupportedContentType(content_type.to_owned())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}
