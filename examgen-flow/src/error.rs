use thiserror::Error;

/// Errors produced while generating exam variants.
///
/// Backend failures (`Auth`, `Quota`, `BadRequest`, `Transport`) display the backend's
/// diagnostic verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Quota(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Transport(String),

    #[error("history extraction failed: {0}")]
    HistoryExtraction(String),

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("a workflow run is already in progress")]
    AlreadyRunning,

    #[error("workflow cancelled")]
    Cancelled,

    #[error("no models configured")]
    NoModels,

    #[error("invalid step number: {0}")]
    InvalidStep(u8),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse classification used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    Quota,
    BadRequest,
    Transport,
    Other,
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Auth(_) => ErrorKind::Auth,
            FlowError::Quota(_) => ErrorKind::Quota,
            FlowError::BadRequest(_) => ErrorKind::BadRequest,
            FlowError::Transport(_) => ErrorKind::Transport,
            _ => ErrorKind::Other,
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for FlowError {
    fn from(err: serde_yaml::Error) -> Self {
        FlowError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
