//! Error handling module for the estimation room.
//!
//! Every failure the session controller can report is an [`AppError`]. The
//! presentation layer only ever shows [`AppError::message`].

/// Error codes as constants to avoid stringly-typed errors.
pub mod codes {
    pub const ROOM_NOT_FOUND: &str = "ROOM_NOT_FOUND";
    pub const DUPLICATE_NAME: &str = "DUPLICATE_NAME";
    pub const BACKEND_UNAVAILABLE: &str = "BACKEND_UNAVAILABLE";
    pub const NOT_JOINED: &str = "NOT_JOINED";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const VOTES_OUTSTANDING: &str = "VOTES_OUTSTANDING";
}

/// Application error type.
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// The requested room does not exist
    RoomNotFound(String),
    /// Another participant in the room already uses this display name
    DuplicateName(String),
    /// Network or storage failure talking to the backend
    BackendUnavailable(String),
    /// Operation requires a joined room
    NotJoined,
    /// Input rejected before reaching the backend
    Validation(String),
    /// Reveal attempted while some participants have not voted
    VotesOutstanding { missing: usize },
}

impl AppError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::RoomNotFound(_) => codes::ROOM_NOT_FOUND,
            AppError::DuplicateName(_) => codes::DUPLICATE_NAME,
            AppError::BackendUnavailable(_) => codes::BACKEND_UNAVAILABLE,
            AppError::NotJoined => codes::NOT_JOINED,
            AppError::Validation(_) => codes::VALIDATION_ERROR,
            AppError::VotesOutstanding { .. } => codes::VOTES_OUTSTANDING,
        }
    }

    /// Get the user-visible message.
    pub fn message(&self) -> String {
        match self {
            AppError::RoomNotFound(room_id) => format!("Room {} not found", room_id),
            AppError::DuplicateName(name) => {
                format!("The name \"{}\" is already taken in this room", name)
            }
            AppError::BackendUnavailable(msg) => msg.clone(),
            AppError::NotJoined => "Join a room first".to_string(),
            AppError::Validation(msg) => msg.clone(),
            AppError::VotesOutstanding { missing } => {
                format!("Waiting for {} participant(s) to vote", missing)
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for AppError {}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        AppError::BackendUnavailable(format!("Database error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        tracing::error!("HTTP error: {:?}", err);
        AppError::BackendUnavailable(format!("Backend request failed: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        tracing::error!("Realtime error: {:?}", err);
        AppError::BackendUnavailable(format!("Realtime connection failed: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON error: {:?}", err);
        AppError::BackendUnavailable(format!("Malformed backend payload: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code_and_message() {
        let err = AppError::DuplicateName("Alice".to_string());
        assert_eq!(
            err.to_string(),
            "DUPLICATE_NAME: The name \"Alice\" is already taken in this room"
        );
    }

    #[test]
    fn test_votes_outstanding_message() {
        let err = AppError::VotesOutstanding { missing: 2 };
        assert_eq!(err.error_code(), codes::VOTES_OUTSTANDING);
        assert_eq!(err.message(), "Waiting for 2 participant(s) to vote");
    }

    #[test]
    fn test_json_error_maps_to_backend_unavailable() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: AppError = json_err.into();
        assert_eq!(err.error_code(), codes::BACKEND_UNAVAILABLE);
    }
}
