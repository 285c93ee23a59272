use thiserror::Error;

/// A read intent. Queries never mutate state.
pub trait Query: Clone + core::fmt::Debug + Send + Sync + 'static {
    type Kind: Copy + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display + Send + Sync;
    type Output: Send + 'static;

    fn kind(&self) -> Self::Kind;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("no handler registered for query type '{0}'")]
    Unhandled(String),

    #[error("query failed: {0}")]
    Failed(String),
}
