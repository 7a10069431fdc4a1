use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::ChatError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<ChatError>() {
            Some(ChatError::Validation(_)) => StatusCode::BAD_REQUEST,
            Some(ChatError::Authorization(_)) => StatusCode::FORBIDDEN,
            Some(ChatError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(ChatError::Conflict { .. }) => StatusCode::CONFLICT,
            Some(ChatError::TransientNetwork(_) | ChatError::SubscriptionLost) => StatusCode::SERVICE_UNAVAILABLE,
            Some(ChatError::Storage(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self.0.downcast_ref::<ChatError>() {
            Some(err) => err.user_message(),
            None => "Something went wrong, please try again.".to_owned(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, backtrace = %self.0.backtrace(), "request failed");
        } else {
            tracing::debug!(error = %self.0, "request rejected");
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_errors_map_to_statuses() {
        let cases = [
            (ChatError::validation("empty"), StatusCode::BAD_REQUEST),
            (ChatError::Authorization("x".into()), StatusCode::FORBIDDEN),
            (ChatError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ChatError::Conflict { expected: 1, actual: 2 }, StatusCode::CONFLICT),
            (ChatError::TransientNetwork("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (ChatError::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
        assert_eq!(AppError::from(anyhow::anyhow!("boom")).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
