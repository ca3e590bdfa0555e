use stagehand_protocol::EventId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("event not found: {0}")]
    NotFound(EventId),
    #[error("event {id} cannot be caused by {cause}: cause must precede the event")]
    Causality { id: EventId, cause: EventId },
    #[error("event stream halted: {0}")]
    Halted(String),
    #[error("event log integrity violation: {0}")]
    Integrity(String),
    #[error("event storage error: {0}")]
    Storage(String),
    #[error("event serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StreamError {
    fn from(error: serde_json::Error) -> Self {
        StreamError::Serialization(error.to_string())
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
