//! Mapping of ingestion errors onto HTTP responses.
//!
//! Every failure response carries a fresh correlation id. Server-side
//! detail is logged under that id; the body only carries a short message.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use riksdata_ingest::IngestError;
use riksdata_ingest_models::ErrorResponse;

/// Errors returned by request handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No usable bearer credential.
    #[error("Unauthorized")]
    Unauthorized,

    /// Authenticated but lacking the admin role.
    #[error("Forbidden")]
    Forbidden,

    /// The request was malformed. The message is safe to show.
    #[error("{0}")]
    BadRequest(String),

    /// The stream already has a run in flight.
    #[error("{0}")]
    Conflict(String),

    /// The remote source could not be fetched.
    #[error("Upstream fetch failed")]
    Upstream(String),

    /// Anything else. The detail is logged, never returned.
    #[error("Internal server error")]
    Internal(String),
}

impl ApiError {
    fn detail(&self) -> Option<&str> {
        match self {
            Self::Upstream(detail) | Self::Internal(detail) => Some(detail),
            _ => None,
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        if e.is_client_error() {
            Self::BadRequest(e.to_string())
        } else if e.is_conflict() {
            Self::Conflict(e.to_string())
        } else if matches!(e, IngestError::Fetch { .. }) {
            Self::Upstream(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let request_id = uuid::Uuid::new_v4().to_string();
        let status = self.status_code();

        match self.detail() {
            Some(detail) => log::error!("[{request_id}] {status}: {detail}"),
            None => log::warn!("[{request_id}] {status}: {self}"),
        }

        HttpResponse::build(status).json(ErrorResponse::new(self.to_string(), request_id))
    }
}

#[cfg(test)]
mod tests {
    use riksdata_database::DbError;
    use riksdata_database_models::DataSourceKey;
    use riksdata_source::registry::DataTypeError;
    use riksdata_source_models::DataSource;

    use super::*;

    #[test]
    fn classifies_ingest_errors() {
        let bad = ApiError::from(IngestError::from(DataTypeError::Empty));
        assert_eq!(bad.status_code(), StatusCode::BAD_REQUEST);

        let busy = ApiError::from(IngestError::AlreadyRunning {
            key: DataSourceKey::new(DataSource::Riksdagen, "dokument"),
        });
        assert_eq!(busy.status_code(), StatusCode::CONFLICT);

        let db = ApiError::from(IngestError::from(DbError::Conversion {
            message: "password=hunter2".to_string(),
        }));
        assert_eq!(db.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(db.to_string(), "Internal server error");
    }
}
