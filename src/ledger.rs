//! Single-execution bookkeeping for expensive work shared between branches of
//! the task graph.
//!
//! Every unit of work is identified by a key. The first caller to [acquire]
//! a key becomes its claimant and receives a [Promise]; everyone else receives
//! a [Handle] to the same completion and blocks on it until the claimant
//! reports an outcome.
//!
//! [acquire]: WorkLedger::acquire

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use anyhow::anyhow;

use crate::error::SharedError;

type Outcome = Result<(), SharedError>;

#[derive(Default)]
struct Completion {
    state: Mutex<Option<Outcome>>,
    ready: Condvar,
}

impl Completion {
    fn done() -> Self {
        Self {
            state: Mutex::new(Some(Ok(()))),
            ready: Condvar::new(),
        }
    }

    fn set(&self, outcome: Outcome) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_none() {
            *state = Some(outcome);
            self.ready.notify_all();
        }
    }

    fn wait(&self) -> Outcome {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = state.as_ref() {
                return outcome.clone();
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn peek(&self) -> Option<Outcome> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A read-only view of a unit of work's completion.
#[derive(Clone)]
pub struct Handle(Arc<Completion>);

impl Handle {
    /// Blocks until the claimant reports, then returns its outcome.
    pub fn wait(&self) -> Result<(), SharedError> {
        self.0.wait()
    }

    /// Returns the outcome without blocking, if one is available.
    pub fn try_get(&self) -> Option<Result<(), SharedError>> {
        self.0.peek()
    }
}

/// The obligation to report the outcome of a claimed unit of work.
///
/// Dropping an unfulfilled promise (for example while unwinding from a panic)
/// completes it with an error, so waiters are never left blocked.
pub struct Promise {
    completion: Arc<Completion>,
    fulfilled: bool,
}

impl Promise {
    pub fn handle(&self) -> Handle {
        Handle(self.completion.clone())
    }

    pub fn succeed(self) {
        self.complete(Ok(()));
    }

    pub fn fail(self, error: impl Into<SharedError>) {
        self.complete(Err(error.into()));
    }

    pub fn complete(mut self, outcome: Result<(), SharedError>) {
        self.fulfilled = true;
        self.completion.set(outcome);
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        if !self.fulfilled {
            self.completion
                .set(Err(SharedError::new(anyhow!("work was abandoned by its claimant"))));
        }
    }
}

/// The result of acquiring a key.
pub enum Claim {
    /// The caller is the only one allowed to perform the work.
    Claimant(Promise),
    /// Someone else performs, or already performed, the work.
    Waiter(Handle),
}

impl Claim {
    pub fn is_claimant(&self) -> bool {
        matches!(self, Claim::Claimant(_))
    }

    pub fn handle(&self) -> Handle {
        match self {
            Claim::Claimant(promise) => promise.handle(),
            Claim::Waiter(handle) => handle.clone(),
        }
    }
}

/// Whether a call to [`WorkLedger::run_once`] executed the work itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Ran,
    Reused,
}

/// Concurrency-safe map from a work identity to its completion.
///
/// The ledger lives for a single graph run, entries are created lazily and
/// never removed.
pub struct WorkLedger<K> {
    entries: Mutex<HashMap<K, Arc<Completion>>>,
}

impl<K> Default for WorkLedger<K> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> WorkLedger<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key`, or joins the existing claim on it.
    pub fn acquire(&self, key: &K) -> Claim {
        self.acquire_with(key, || false)
    }

    /// Like [`acquire`](Self::acquire), but first asks `already_done` whether
    /// the work's output is already on durable storage. The check runs under
    /// the ledger lock and only for keys that have no entry yet; a positive
    /// answer registers the key as completed so no one ever runs it.
    pub fn acquire_with(&self, key: &K, already_done: impl FnOnce() -> bool) -> Claim {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(completion) = entries.get(key) {
            return Claim::Waiter(Handle(completion.clone()));
        }

        if already_done() {
            let completion = Arc::new(Completion::done());
            entries.insert(key.clone(), completion.clone());
            return Claim::Waiter(Handle(completion));
        }

        let completion = Arc::new(Completion::default());
        entries.insert(key.clone(), completion.clone());
        Claim::Claimant(Promise {
            completion,
            fulfilled: false,
        })
    }

    /// Runs `work` if the caller wins the claim on `key`, otherwise waits for
    /// whoever did. Either way the shared outcome is returned.
    pub fn run_once<F>(
        &self,
        key: &K,
        already_done: impl FnOnce() -> bool,
        work: F,
    ) -> (Execution, Result<(), SharedError>)
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        match self.acquire_with(key, already_done) {
            Claim::Claimant(promise) => {
                let handle = promise.handle();
                promise.complete(work().map_err(SharedError::from));
                (Execution::Ran, handle.wait())
            }
            Claim::Waiter(handle) => (Execution::Reused, handle.wait()),
        }
    }

    /// Number of keys the ledger has seen.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
