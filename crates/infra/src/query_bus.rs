//! Query routing. Handlers read projections and caches only.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, instrument, warn};

use atelier_events::{Query, QueryError, QueryHandler};

pub struct QueryBus<Q: Query> {
    handlers: RwLock<HashMap<Q::Kind, Arc<dyn QueryHandler<Q>>>>,
}

impl<Q: Query> QueryBus<Q> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `kind`, replacing any previous registration.
    pub fn register_handler(&self, kind: Q::Kind, handler: Arc<dyn QueryHandler<Q>>) {
        if self.handlers.write().insert(kind, handler).is_some() {
            warn!(query_type = %kind, "replaced existing query handler");
        } else {
            debug!(query_type = %kind, "registered query handler");
        }
    }

    pub fn is_registered(&self, kind: Q::Kind) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    /// Route `query` and return the handler's result unchanged.
    #[instrument(skip(self, query), fields(query_type = %query.kind()), err)]
    pub async fn execute(&self, query: &Q) -> Result<Q::Output, QueryError> {
        let kind = query.kind();
        let handler = self.handlers.read().get(&kind).cloned();
        let Some(handler) = handler else {
            error!(query_type = %kind, "no handler registered for query type");
            return Err(QueryError::Unhandled(kind.to_string()));
        };
        handler.handle(query).await
    }
}

impl<Q: Query> Default for QueryBus<Q> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q: Query> core::fmt::Debug for QueryBus<Q> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kinds: Vec<Q::Kind> = self.handlers.read().keys().copied().collect();
        f.debug_struct("QueryBus").field("handlers", &kinds).finish()
    }
}
