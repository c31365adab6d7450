use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::error::{ErrorSeverity, RouterError};

/// `{success: true, data}` with the given status
pub fn ok_json<T: Serialize>(status: StatusCode, data: &T) -> Response<Body> {
    match serde_json::to_value(data) {
        Ok(data) => envelope(status, json!({ "success": true, "data": data })),
        Err(e) => error_response(&RouterError::internal(format!(
            "failed to serialize response: {}",
            e
        ))),
    }
}

/// Render an error with its fixed status in the `{success: false, error}`
/// envelope. Internal detail never reaches the client.
pub fn error_response(err: &RouterError) -> Response<Body> {
    match err.severity() {
        ErrorSeverity::Critical | ErrorSeverity::High => {
            error!(code = err.code(), error = %err, "Request failed")
        }
        _ => warn!(code = err.code(), error = %err, "Request rejected"),
    }

    let mut body = json!({
        "code": err.code(),
        "message": err.public_message(),
    });
    if let Some(details) = err.details() {
        body["details"] = details;
    }
    envelope(err.status_code(), json!({ "success": false, "error": body }))
}

/// Error envelope with a fixed code and message
pub fn error_with(status: StatusCode, code: &str, message: &str) -> Response<Body> {
    envelope(
        status,
        json!({ "success": false, "error": { "code": code, "message": message } }),
    )
}

fn envelope(status: StatusCode, value: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Plain body with an explicit content type
pub fn text(status: StatusCode, content_type: &'static str, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
