//! Mapping from domain errors to HTTP responses.

use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use kvstore_core::{ErrorBody, KvError, PageParamError};

/// Error returned by every HTTP handler.
#[derive(Debug)]
pub enum ApiError {
    /// A domain failure from the record service or admission control.
    Domain(KvError),
    /// The request body could not be parsed.
    MalformedBody(String),
    /// A query parameter was out of range.
    InvalidParameter(PageParamError),
    /// The server is draining and no longer accepts requests.
    ShuttingDown,
}

/// HTTP status for a domain error.
#[must_use]
pub fn status_for(err: &KvError) -> StatusCode {
    match err {
        KvError::InvalidKey | KvError::InvalidValue { .. } => StatusCode::BAD_REQUEST,
        KvError::KeyNotFound => StatusCode::NOT_FOUND,
        KvError::KeyAlreadyExists | KvError::NotDeleted => StatusCode::CONFLICT,
        KvError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        KvError::PoolTimeout | KvError::PoolClosed => StatusCode::SERVICE_UNAVAILABLE,
        KvError::Database => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<KvError> for ApiError {
    fn from(err: KvError) -> Self {
        Self::Domain(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::MalformedBody(rejection.body_text())
    }
}

impl From<PageParamError> for ApiError {
    fn from(err: PageParamError) -> Self {
        Self::InvalidParameter(err)
    }
}

fn body(status: StatusCode, code: &str, error: String) -> Response {
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            error,
        }),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Domain(err) => {
                let mut response = body(status_for(&err), err.code(), err.to_string());
                if err == KvError::RateLimited {
                    response
                        .headers_mut()
                        .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
                }
                response
            }
            Self::MalformedBody(detail) => body(StatusCode::BAD_REQUEST, "invalid_request", detail),
            Self::InvalidParameter(err) => {
                body(StatusCode::BAD_REQUEST, "invalid_parameter", err.to_string())
            }
            Self::ShuttingDown => body(
                StatusCode::SERVICE_UNAVAILABLE,
                "shutting_down",
                "server is shutting down".to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (KvError::InvalidKey, StatusCode::BAD_REQUEST),
            (
                KvError::InvalidValue {
                    reason: "too large".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (KvError::KeyNotFound, StatusCode::NOT_FOUND),
            (KvError::KeyAlreadyExists, StatusCode::CONFLICT),
            (KvError::NotDeleted, StatusCode::CONFLICT),
            (KvError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (KvError::PoolTimeout, StatusCode::SERVICE_UNAVAILABLE),
            (KvError::PoolClosed, StatusCode::SERVICE_UNAVAILABLE),
            (KvError::Database, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{err:?}");
        }
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = ApiError::from(KvError::RateLimited).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn parameter_errors_are_bad_requests() {
        let response = ApiError::from(PageParamError::InvalidLimit).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
