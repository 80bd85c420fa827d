use thiserror::Error;
use warp::http::StatusCode;

/// Every way a try-on or health request can fail.
#[derive(Debug, Error)]
pub enum TryOnError {
    #[error("{0}")]
    Configuration(String),

    #[error("Missing required fields: person_image and garment_image")]
    MissingFields,

    #[error("Invalid JSON body: {0}")]
    MalformedBody(String),

    #[error("{0}")]
    Decode(String),

    #[error("{0}")]
    Remote(String),

    #[error("{0}")]
    Internal(String),
}

impl TryOnError {
    /// Malformed base64 or image data still maps to 500, matching the
    /// behavior existing clients were built against.
    pub fn status(&self) -> StatusCode {
        match self {
            TryOnError::MissingFields | TryOnError::MalformedBody(_) => StatusCode::BAD_REQUEST,
            TryOnError::Configuration(_)
            | TryOnError::Decode(_)
            | TryOnError::Remote(_)
            | TryOnError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl warp::reject::Reject for TryOnError {}

impl From<std::io::Error> for TryOnError {
    fn from(e: std::io::Error) -> Self {
        TryOnError::Internal(format!("I/O error: {}", e))
    }
}

impl From<tokio::task::JoinError> for TryOnError {
    fn from(e: tokio::task::JoinError) -> Self {
        TryOnError::Internal(format!("worker task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_request_shape_problems_are_client_errors() {
        assert_eq!(TryOnError::MissingFields.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            TryOnError::MalformedBody("eof".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TryOnError::Decode("bad".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            TryOnError::Configuration("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
