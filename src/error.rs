use thiserror::Error;
use warp::http::StatusCode;

#[derive(Error, Debug)]
pub enum CareError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Storage or transport failure: {0}")]
    TransientIo(String),
    #[error("Invalid request: {0}")]
    Validation(String),
}

pub type CareResult<T> = Result<T, CareError>;

impl CareError {
    /// Stable machine-readable code, sent to REST and realtime callers alike.
    pub fn kind(&self) -> &'static str {
        match self {
            CareError::Unauthorized(_) => "unauthorized",
            CareError::NotFound(_) => "not_found",
            CareError::Forbidden(_) => "forbidden",
            CareError::InvalidState(_) => "invalid_state",
            CareError::Conflict(_) => "conflict",
            CareError::TransientIo(_) => "transient_io",
            CareError::Validation(_) => "validation",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CareError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CareError::NotFound(_) => StatusCode::NOT_FOUND,
            CareError::Forbidden(_) => StatusCode::FORBIDDEN,
            CareError::InvalidState(_) | CareError::Conflict(_) => StatusCode::CONFLICT,
            CareError::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            CareError::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CareError::TransientIo(_))
    }
}

impl From<std::io::Error> for CareError {
    fn from(err: std::io::Error) -> Self {
        CareError::TransientIo(err.to_string())
    }
}

impl From<serde_json::Error> for CareError {
    fn from(err: serde_json::Error) -> Self {
        CareError::TransientIo(format!("snapshot encoding: {err}"))
    }
}

impl warp::reject::Reject for CareError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_http_statuses() {
        let cases = [
            (CareError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED, "unauthorized"),
            (CareError::NotFound("x".into()), StatusCode::NOT_FOUND, "not_found"),
            (CareError::Forbidden("x".into()), StatusCode::FORBIDDEN, "forbidden"),
            (CareError::InvalidState("x".into()), StatusCode::CONFLICT, "invalid_state"),
            (CareError::Conflict("x".into()), StatusCode::CONFLICT, "conflict"),
            (CareError::TransientIo("x".into()), StatusCode::SERVICE_UNAVAILABLE, "transient_io"),
            (CareError::Validation("x".into()), StatusCode::BAD_REQUEST, "validation"),
        ];
        for (err, status, kind) in cases {
            assert_eq!(err.status_code(), status);
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn io_failures_are_retryable() {
        let err: CareError = std::io::Error::other("disk gone").into();
        assert!(err.is_retryable());
        assert!(!CareError::Conflict("dup".into()).is_retryable());
    }
}
