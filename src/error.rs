use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    ConnectionPool(#[from] r2d2::Error),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl IndexerError {
    /// The access node is shedding load; callers should back off harder.
    pub fn is_resource_exhausted(&self) -> bool {
        self.to_string().contains("ResourceExhausted")
    }

    /// The call ran past the server deadline; retrying as-is will not help.
    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            IndexerError::Transport(e) => e.is_timeout(),
            other => other.to_string().contains("DeadlineExceeded"),
        }
    }

    /// The transport dropped mid-call; fatal for the current batch.
    pub fn is_connection_termination(&self) -> bool {
        match self {
            IndexerError::Transport(e) => e.is_connect(),
            other => other.to_string().contains("connection termination"),
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        self.to_string().contains("InvalidArgument")
    }
}

pub type IndexerResult<T> = Result<T, IndexerError>;
