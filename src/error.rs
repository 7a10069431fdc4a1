use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Rejected before any store mutation: empty body, malformed ids, wrong participant.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Edit or delete attempted by someone other than the sender.
    #[error("not allowed: {0}")]
    Authorization(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic edit lost against a newer version.
    #[error("conflict: expected version {expected}, found {actual}")]
    Conflict { expected: u32, actual: u32 },
    #[error("network unavailable: {0}")]
    TransientNetwork(String),
    #[error("realtime subscription lost")]
    SubscriptionLost,
    #[error("storage error: {0}")]
    Storage(String),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::SubscriptionLost)
    }

    /// Text shown to the user for a failed action.
    ///
    /// Authorization failures stay generic on purpose; the reason is only logged.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::Authorization(_) | Self::NotFound(_) | Self::Storage(_) => {
                "Something went wrong, please try again.".to_owned()
            }
            Self::Conflict { .. } => "This message was changed elsewhere.".to_owned(),
            Self::TransientNetwork(_) => "Not sent. Check your connection and resend.".to_owned(),
            Self::SubscriptionLost => "Reconnecting…".to_owned(),
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row".to_owned()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::TransientNetwork(err.to_string())
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<uuid::Error> for ChatError {
    fn from(err: uuid::Error) -> Self {
        Self::Validation(format!("malformed id: {err}"))
    }
}
