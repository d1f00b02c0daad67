use std::future::Future;

use tokio::task::{JoinError, JoinSet};

use crate::error::{Error, GroupError, Result};

/// A scope owning a set of concurrently running tasks.
///
/// Tasks are submitted with [`TaskGroup::spawn`] and the scope is left with
/// [`TaskGroup::join`], which waits until every task has settled. The first
/// task failing with a real error puts the group into the aborting state:
/// the remaining tasks are cancelled, the group waits for the cancellations
/// to land, and every collected error is returned together as a
/// [`GroupError`].
///
/// Dropping a group, either directly or because the future awaiting
/// [`TaskGroup::join`] was itself dropped, aborts every task it still owns,
/// so no task outlives the scope that created it. The group never turns an
/// outer cancellation into an error of its own.
pub struct TaskGroup<T> {
    name: String,
    set: JoinSet<Result<T>>,
}

impl<T> TaskGroup<T>
where
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            set: JoinSet::new(),
        }
    }

    /// Submits a task to the group. The task starts running immediately.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.set.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Waits for every task to settle.
    ///
    /// Returns the task results in completion order when nothing failed,
    /// otherwise the aggregate of all non-cancellation failures.
    pub async fn join(mut self) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.set.len());
        let mut errors = Vec::new();
        let mut cancelled = 0;

        while let Some(joined) = self.set.join_next().await {
            let failure = match joined {
                Ok(Ok(value)) => {
                    results.push(value);
                    continue;
                }
                Ok(Err(err)) => err,
                Err(join) if join.is_cancelled() => {
                    cancelled += 1;
                    continue;
                }
                Err(join) => panic_to_error(join),
            };

            if errors.is_empty() {
                tracing::debug!("{}: task failed, aborting {} sibling(s)", self.name, self.set.len());
                self.set.abort_all();
            }
            errors.push(failure);
        }

        if errors.is_empty() {
            Ok(results)
        } else {
            Err(Error::Group(GroupError {
                name: self.name,
                errors,
                cancelled,
            }))
        }
    }
}

fn panic_to_error(join: JoinError) -> Error {
    match join.try_into_panic() {
        Ok(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown payload")
            };
            Error::Panic(msg)
        }
        Err(join) => Error::Panic(join.to_string()),
    }
}
