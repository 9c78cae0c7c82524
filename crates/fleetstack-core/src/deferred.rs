//! Deferred values
//!
//! Resource outputs produced by the provisioning engine are not known when a
//! resource is declared. A [`Deferred`] wraps such a value as a shared future:
//! it can be cloned freely, composed with [`Deferred::map`] and
//! [`Deferred::combine`], and resolved any number of times. Each combinator
//! runs at most once no matter how many clones are awaited.

use crate::error::{Result, StackError};
use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;

/// A value that becomes available asynchronously
pub struct Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Shared<BoxFuture<'static, Result<T>>>,
}

impl<T> Clone for Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.peek() {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap a future. It is driven by whoever resolves the value first.
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            inner: fut.boxed().shared(),
        }
    }

    /// Run the future on the tokio runtime right away.
    ///
    /// Resolution makes progress even if nobody awaits the value yet.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        Self::new(async move {
            handle.await.map_err(|e| {
                StackError::TransientProvisioning(format!("deferred task aborted: {}", e))
            })?
        })
    }

    /// An already resolved value
    pub fn ready(value: T) -> Self {
        Self::new(future::ready(Ok(value)))
    }

    /// A value whose resolution failed
    pub fn failed(error: StackError) -> Self {
        Self::new(future::ready(Err(error)))
    }

    /// Transform the value once it resolves
    pub fn map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let inner = self.inner.clone();
        Deferred::new(async move { inner.await.map(f) })
    }

    /// Transform the value with a fallible function
    pub fn try_map<U, F>(&self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let inner = self.inner.clone();
        Deferred::new(async move { inner.await.and_then(f) })
    }

    /// Wait for both values and merge them.
    ///
    /// The operands resolve in no particular order; `f` runs exactly once,
    /// after both are available. A failure on either side fails the result.
    pub fn combine<U, V, F>(&self, other: &Deferred<U>, f: F) -> Deferred<V>
    where
        U: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        let left = self.inner.clone();
        let right = other.inner.clone();
        Deferred::new(async move {
            let (l, r) = future::try_join(left, right).await?;
            Ok(f(l, r))
        })
    }

    /// Collect a list of deferred values, preserving order
    pub fn all(values: Vec<Deferred<T>>) -> Deferred<Vec<T>> {
        Deferred::new(async move {
            future::try_join_all(values.into_iter().map(|v| v.inner)).await
        })
    }

    /// Wait for the value
    pub async fn resolve(&self) -> Result<T> {
        self.inner.clone().await
    }

    /// The value if it already resolved
    pub fn peek(&self) -> Option<Result<T>> {
        self.inner.peek().cloned()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.peek().is_some()
    }
}

impl<T> From<T> for Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        Deferred::ready(value)
    }
}
