//! API request and response types

use crate::conversation::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response to session creation
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
}

/// Request to send a chat message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

/// Reply to a chat message
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub reply: Message,
}

/// Stored history of a session
#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub session_id: String,
    pub messages: Vec<Message>,
    /// Completed turns written to the session
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
