//! Request-scoped batching of single-key reads.
//!
//! Every `load` issued before the loader's dispatch task runs joins the same batch:
//! the first enqueue spawns the dispatch, which yields once so the rest of the
//! current tick can enqueue too, then fetches the distinct keys in one call per
//! `max_batch_size` chunk.
//!
//! Resolved keys (including "not found") are cached for the loader's lifetime.
//! Build one loader per request; sharing one across callers leaks results between them.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The batched fetch failed; every caller waiting on that batch gets this.
    #[error("batch fetch failed: {0}")]
    Fetch(String),

    #[error("batch dispatch ended before resolving the key")]
    Dropped,

    #[error("no tokio runtime to dispatch the batch")]
    NoRuntime,
}

/// The backing fetch: distinct keys in, found entries out. Missing keys are "not found".
#[async_trait]
pub trait BatchFn<K, V>: Send + Sync + 'static {
    async fn load(&self, keys: &[K]) -> Result<HashMap<K, V>, LoadError>;
}

#[async_trait]
impl<K, V, T> BatchFn<K, V> for Arc<T>
where
    K: Sync,
    T: BatchFn<K, V> + ?Sized,
{
    async fn load(&self, keys: &[K]) -> Result<HashMap<K, V>, LoadError> {
        (**self).load(keys).await
    }
}

type Waiter<V> = oneshot::Sender<Result<Option<V>, LoadError>>;

struct State<K, V> {
    resolved: HashMap<K, Option<V>>,
    queue: Vec<K>,
    waiters: HashMap<K, Vec<Waiter<V>>>,
    dispatch_scheduled: bool,
}

struct Inner<K, V, F> {
    fetch: F,
    max_batch_size: NonZeroUsize,
    state: Mutex<State<K, V>>,
}

/// Coalesces `load` calls into batched fetches.
///
/// Loads must run inside a tokio runtime, since each batch is dispatched on a
/// spawned task; outside one `load` fails with [`LoadError::NoRuntime`]. On a
/// current-thread runtime every key enqueued in the same tick lands in one batch.
/// On a multi-thread runtime the dispatch task may run before a late key is
/// enqueued, in which case that key starts the next batch.
pub struct BatchLoader<K, V, F> {
    inner: Arc<Inner<K, V, F>>,
}

impl<K, V, F> Clone for BatchLoader<K, V, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, F> BatchLoader<K, V, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: BatchFn<K, V>,
{
    pub fn new(fetch: F, max_batch_size: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetch,
                max_batch_size,
                state: Mutex::new(State {
                    resolved: HashMap::new(),
                    queue: Vec::new(),
                    waiters: HashMap::new(),
                    dispatch_scheduled: false,
                }),
            }),
        }
    }

    pub async fn load(&self, key: K) -> Result<Option<V>, LoadError> {
        let rx = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            if let Some(hit) = state.resolved.get(&key) {
                return Ok(hit.clone());
            }

            let spawn_on = if state.dispatch_scheduled {
                None
            } else {
                let Ok(handle) = Handle::try_current() else {
                    return Err(LoadError::NoRuntime);
                };
                Some(handle)
            };

            let (tx, rx) = oneshot::channel();
            match state.waiters.entry(key) {
                Entry::Occupied(mut e) => e.get_mut().push(tx),
                Entry::Vacant(e) => {
                    state.queue.push(e.key().clone());
                    e.insert(vec![tx]);
                }
            }

            if let Some(handle) = spawn_on {
                state.dispatch_scheduled = true;
                handle.spawn(dispatch(Arc::clone(&self.inner)));
            }
            rx
        };

        rx.await.unwrap_or(Err(LoadError::Dropped))
    }

    /// Results line up with `keys`; a failed batch fails the whole call.
    pub async fn load_many<I>(&self, keys: I) -> Result<Vec<Option<V>>, LoadError>
    where
        I: IntoIterator<Item = K>,
    {
        futures::future::join_all(keys.into_iter().map(|k| self.load(k)))
            .await
            .into_iter()
            .collect()
    }

    /// Seed a result without fetching. An already resolved key keeps its value.
    pub fn prime(&self, key: K, value: Option<V>) {
        self.inner.state.lock().resolved.entry(key).or_insert(value);
    }

    pub fn clear(&self, key: &K) -> bool {
        self.inner.state.lock().resolved.remove(key).is_some()
    }

    pub fn clear_all(&self) {
        self.inner.state.lock().resolved.clear();
    }
}

async fn dispatch<K, V, F>(inner: Arc<Inner<K, V, F>>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: BatchFn<K, V>,
{
    tokio::task::yield_now().await;

    let (keys, mut waiters) = {
        let mut state = inner.state.lock();
        state.dispatch_scheduled = false;
        (std::mem::take(&mut state.queue), std::mem::take(&mut state.waiters))
    };
    debug!(key_count = keys.len(), "dispatching batch");

    for chunk in keys.chunks(inner.max_batch_size.get()) {
        match inner.fetch.load(chunk).await {
            Ok(mut found) => {
                let mut state = inner.state.lock();
                for key in chunk {
                    let value = found.remove(key);
                    state.resolved.insert(key.clone(), value.clone());
                    for tx in waiters.remove(key).unwrap_or_default() {
                        let _ = tx.send(Ok(value.clone()));
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, key_count = chunk.len(), "batch fetch failed");
                for key in chunk {
                    for tx in waiters.remove(key).unwrap_or_default() {
                        let _ = tx.send(Err(err.clone()));
                    }
                }
            }
        }
    }
}

impl<K, V, F> core::fmt::Debug for BatchLoader<K, V, F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchLoader")
            .field("max_batch_size", &self.inner.max_batch_size)
            .finish_non_exhaustive()
    }
}
