//! A result that arrives late and may be awaited by any number of callers.
//!
//! States: `Awaiting` until the first `resolve`/`reject`, then
//! `Resolved(Ok | Err)`; `Closed` is terminal. Callers that arrive while
//! awaiting are parked and drained exactly once when a terminal or resolved
//! state is reached. A resolved register can be resolved again (the watched
//! source changed); a closed one ignores everything.

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("{0}")]
    Rejected(String),

    #[error("result register has been closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegisterState<T> {
    Awaiting,
    Resolved(Result<T, String>),
    Closed,
}

type Waiter<T> = oneshot::Sender<Result<T, RegisterError>>;

struct Inner<T> {
    state: RegisterState<T>,
    waiters: Vec<Waiter<T>>,
}

pub struct PendingResult<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> Default for PendingResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> PendingResult<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RegisterState::Awaiting,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> RegisterState<T> {
        self.inner.lock().state.clone()
    }

    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Returns the current result, parking until one exists.
    pub async fn wait(&self) -> Result<T, RegisterError> {
        let rx = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match &inner.state {
                RegisterState::Resolved(Ok(value)) => return Ok(value.clone()),
                RegisterState::Resolved(Err(message)) => {
                    return Err(RegisterError::Rejected(message.clone()))
                }
                RegisterState::Closed => return Err(RegisterError::Closed),
                RegisterState::Awaiting => {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push(tx);
                    rx
                }
            }
        };
        rx.await.unwrap_or(Err(RegisterError::Closed))
    }

    /// Stores `value` and wakes every parked caller. Returns false when closed.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Stores a failure and wakes every parked caller. Returns false when closed.
    pub fn reject(&self, message: impl Into<String>) -> bool {
        self.settle(Err(message.into()))
    }

    /// Terminal. Parked callers get [`RegisterError::Closed`].
    pub fn close(&self) {
        let waiters = {
            let mut inner = self.inner.lock();
            inner.state = RegisterState::Closed;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(RegisterError::Closed));
        }
    }

    fn settle(&self, result: Result<T, String>) -> bool {
        let waiters = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, RegisterState::Closed) {
                return false;
            }
            inner.state = RegisterState::Resolved(result.clone());
            std::mem::take(&mut inner.waiters)
        };
        let outcome = result.map_err(RegisterError::Rejected);
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn parked_callers_are_drained_once() {
        let register = Arc::new(PendingResult::<String>::new());
        let mut handles = vec![];
        for _ in 0..3 {
            let register = register.clone();
            handles.push(tokio::spawn(async move { register.wait().await }));
        }
        while register.waiting() < 3 {
            tokio::task::yield_now().await;
        }

        assert!(register.resolve("alice".to_string()));
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok("alice".to_string()));
        }
        assert_eq!(register.waiting(), 0);
        assert_eq!(register.wait().await, Ok("alice".to_string()));
    }

    #[tokio::test]
    async fn rejection_reaches_waiters_and_later_callers() {
        let register = Arc::new(PendingResult::<u32>::new());
        let waiter = {
            let register = register.clone();
            tokio::spawn(async move { register.wait().await })
        };
        while register.waiting() < 1 {
            tokio::task::yield_now().await;
        }
        register.reject("token refresh failed");
        let expected = Err(RegisterError::Rejected("token refresh failed".into()));
        assert_eq!(waiter.await.unwrap(), expected);
        assert_eq!(register.wait().await, expected);
    }

    #[tokio::test]
    async fn resolve_replaces_previous_value() {
        let register = PendingResult::new();
        register.resolve(Some(1));
        register.resolve(None);
        assert_eq!(register.wait().await, Ok(None));
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let register = Arc::new(PendingResult::<u32>::new());
        let waiter = {
            let register = register.clone();
            tokio::spawn(async move { register.wait().await })
        };
        while register.waiting() < 1 {
            tokio::task::yield_now().await;
        }
        register.close();
        assert_eq!(waiter.await.unwrap(), Err(RegisterError::Closed));
        assert!(!register.resolve(7));
        assert_eq!(register.state(), RegisterState::Closed);
        assert_eq!(register.wait().await, Err(RegisterError::Closed));
    }
}
