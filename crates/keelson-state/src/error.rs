//! Error types for the Keelson state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    /// A snapshot query failed; wraps the storage error with the query name.
    #[error("query {query} failed: {source}")]
    Query {
        query: String,
        #[source]
        source: Box<StateError>,
    },

    #[error("timed out waiting for state index {wanted} (current {current})")]
    Timeout { wanted: u64, current: u64 },
}

impl StateError {
    /// Wrap this error with the name of the query that produced it.
    pub fn in_query(self, query: impl Into<String>) -> Self {
        StateError::Query {
            query: query.into(),
            source: Box::new(self),
        }
    }
}
