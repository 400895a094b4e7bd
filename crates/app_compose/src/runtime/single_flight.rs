//! Keyed "single-flight" memoization of async operations

use crate::runtime::process::lock;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

/// Runs each keyed operation at most once
///
/// The first caller for a key triggers the operation. Concurrent callers
/// await the same in-flight future and later callers receive the cached
/// result; the operation is never re-triggered for that key.
pub struct SingleFlight<K, V>
where
    V: Clone,
{
    calls: Mutex<HashMap<K, Shared<BoxFuture<'static, V>>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    V: Clone,
{
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the result for `key`, running `operation` only if nobody has yet
    pub async fn run<F>(&self, key: K, operation: F) -> V
    where
        F: Future<Output = V> + Send + 'static,
    {
        let call = lock(&self.calls)
            .entry(key)
            .or_insert_with(|| operation.boxed().shared())
            .clone();
        call.await
    }
}
