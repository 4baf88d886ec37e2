//! Tokio tasks utilities

use std::future::Future;

use monitoring::logging;
use tokio::task::{JoinError, JoinSet};

/// A [`JoinSet`] that aborts every remaining task as soon as one fails or panics.
///
/// Sub-tasks of one ingestion task are all-or-nothing: a single failed split fails the task, so
/// there is no point in letting the others keep writing segments. Dropping the set aborts all
/// tasks.
pub struct FailFastJoinSet<T>(JoinSet<T>);

impl<T> Default for FailFastJoinSet<T> {
    fn default() -> Self {
        Self(JoinSet::new())
    }
}

impl<T> FailFastJoinSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.0.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T, E> FailFastJoinSet<Result<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Waits for every task and collects their outputs, in completion order.
    ///
    /// On the first error or panic the remaining tasks are aborted and awaited before the error
    /// is returned. Tasks cancelled from outside are skipped.
    pub async fn try_wait_all(&mut self) -> Result<Vec<T>, TryWaitAllError<E>> {
        let mut outputs = Vec::with_capacity(self.0.len());
        while let Some(result) = self.0.join_next().await {
            match result {
                Ok(Ok(output)) => outputs.push(output),
                Ok(Err(err)) => {
                    self.0.shutdown().await;
                    return Err(TryWaitAllError::Error(err));
                }
                Err(err) if err.is_cancelled() => {
                    tracing::trace!("task {} was cancelled", err.id());
                }
                Err(err) => {
                    tracing::error!(error = %err, error_source = logging::error_source(&err), "task {} panicked", err.id());
                    self.0.shutdown().await;
                    return Err(TryWaitAllError::Panic(err));
                }
            }
        }
        Ok(outputs)
    }
}

/// The error type returned by [`FailFastJoinSet::try_wait_all`]
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub enum TryWaitAllError<E> {
    /// A task returned an error
    Error(E),

    /// A task panicked
    Panic(JoinError),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn collects_every_output() {
        //* Given
        let mut set = FailFastJoinSet::<Result<u32, String>>::new();
        for i in 0..4 {
            set.spawn(async move { Ok(i) });
        }

        //* When
        let mut outputs = set.try_wait_all().await.expect("Failed to wait for tasks");

        //* Then
        outputs.sort();
        assert_eq!(outputs, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn first_error_aborts_the_rest() {
        //* Given
        let mut set = FailFastJoinSet::<Result<u32, String>>::new();
        set.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(1)
        });
        set.spawn(async { Err("boom".to_string()) });

        //* When
        let result = tokio::time::timeout(Duration::from_secs(5), set.try_wait_all())
            .await
            .expect("Wait should not block on the sleeping task");

        //* Then
        assert!(matches!(result, Err(TryWaitAllError::Error(err)) if err == "boom"));
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn panic_is_reported() {
        //* Given
        let mut set = FailFastJoinSet::<Result<u32, String>>::new();
        set.spawn(async {
            let values: Vec<u32> = Vec::new();
            Ok(values[0])
        });

        //* When
        let result = set.try_wait_all().await;

        //* Then
        assert!(matches!(result, Err(TryWaitAllError::Panic(err)) if err.is_panic()));
    }
}
