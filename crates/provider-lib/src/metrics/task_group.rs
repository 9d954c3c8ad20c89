//! Bounded fan-out with shared cancellation
//!
//! Tasks run on a `JoinSet`, at most `limit` at a time. The first failure
//! cancels the group token, aborts the remaining tasks and is returned from
//! `wait`.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct TaskGroup<T> {
    tasks: JoinSet<Result<T>>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// New group whose token is a child of `parent`
    pub fn new(parent: &CancellationToken, limit: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: parent.child_token(),
            permits: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Token cancelled when the group fails or the parent is cancelled
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                permit = permits.acquire_owned() => permit.map_err(|_| Error::Cancelled)?,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = task => result,
            }
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Results of every task in completion order, or the first error
    pub async fn wait(mut self) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.tasks.len());

        while let Some(joined) = self.tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(Error::Cancelled),
                Err(e) => Err(Error::Task(e.to_string())),
            };

            match result {
                Ok(value) => results.push(value),
                Err(e) => {
                    debug!(
                        remaining = self.tasks.len(),
                        error = %e,
                        "Task failed, cancelling group"
                    );
                    self.cancel.cancel();
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }

        Ok(results)
    }
}
