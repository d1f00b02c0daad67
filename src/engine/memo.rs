use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use crate::error::{Error, SharedError};

type Cell<T> = Arc<OnceCell<Result<T, SharedError>>>;

/// A single-flight result cell.
///
/// The first caller of [`Memo::get_or_run`] executes the operation, every
/// concurrent caller awaits the same in-flight execution, and later callers
/// get the stored result without running anything. Failures are stored too,
/// so a failed phase is reported identically to everyone who asks.
///
/// If the executing caller is dropped before it finishes, the next waiter
/// takes over and runs the operation itself.
pub struct Memo<T> {
    cell: Mutex<Cell<T>>,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            cell: Mutex::new(Arc::new(OnceCell::new())),
        }
    }
}

impl<T> Memo<T>
where
    T: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_run<F, Fut>(&self, f: F) -> Result<T, SharedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let cell = self.current();
        cell.get_or_init(|| async move { f().await.map_err(SharedError::from) })
            .await
            .clone()
    }

    /// The stored result, if the operation already completed.
    pub fn get(&self) -> Option<Result<T, SharedError>> {
        self.current().get().cloned()
    }

    /// Forgets the stored result so the next call runs the operation again.
    /// Callers already awaiting the previous execution keep awaiting it.
    pub fn reset(&self) {
        *self.cell.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(OnceCell::new());
    }

    fn current(&self) -> Cell<T> {
        self.cell
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A family of [`Memo`] cells keyed by the arguments of the operation.
pub struct MemoMap<K, T> {
    cells: Mutex<HashMap<K, Cell<T>>>,
}

impl<K, T> Default for MemoMap<K, T> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> MemoMap<K, T>
where
    K: Eq + Hash,
    T: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_run<F, Fut>(&self, key: K, f: F) -> Result<T, SharedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let cell = self
            .cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone();

        cell.get_or_init(|| async move { f().await.map_err(SharedError::from) })
            .await
            .clone()
    }

    pub fn reset(&self) {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
