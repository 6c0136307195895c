use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::net::connection::{ConnState, StateCell};

type Listener = Box<dyn FnOnce() + Send>;

// One-shot barrier resolved when the login handshake finishes, plus a
// FIFO of listeners drained once on success. Cancellation is not
// supported; closing the connection before login releases waiters.
#[derive(Clone)]
pub struct LoginFuture {
    inner: Arc<Inner>,
}

struct Inner {
    state: Arc<StateCell>,
    signalled: Mutex<bool>,
    barrier: Condvar,
    listeners: Mutex<Vec<Listener>>,
}

impl LoginFuture {
    pub(crate) fn new(state: Arc<StateCell>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                signalled: Mutex::new(false),
                barrier: Condvar::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        *self
            .inner
            .signalled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.state.load() == ConnState::LoggedIn
    }

    // Blocks until the handshake resolves either way.
    pub fn wait(&self) -> bool {
        let mut signalled = self
            .inner
            .signalled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*signalled {
            signalled = self
                .inner
                .barrier
                .wait(signalled)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(signalled);
        self.is_logged_in()
    }

    // Returns the current login status on timeout without cancelling
    // the attempt.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let signalled = self
            .inner
            .signalled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (signalled, _) = self
            .inner
            .barrier
            .wait_timeout_while(signalled, timeout, |signalled| !*signalled)
            .unwrap_or_else(PoisonError::into_inner);
        drop(signalled);
        self.is_logged_in()
    }

    // Listeners registered after a successful login run immediately;
    // a failed login drops them.
    pub fn on_login(&self, listener: impl FnOnce() + Send + 'static) {
        {
            let signalled = self
                .inner
                .signalled
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !*signalled {
                self.inner
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(Box::new(listener));
                return;
            }
        }
        if self.is_logged_in() {
            listener();
        }
    }

    pub(crate) fn signal(&self) {
        {
            let mut signalled = self
                .inner
                .signalled
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *signalled {
                return;
            }
            *signalled = true;
        }
        self.inner.barrier.notify_all();

        if self.is_logged_in() {
            let drained = std::mem::take(
                &mut *self
                    .inner
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            for listener in drained {
                listener();
            }
        }
    }
}

impl std::fmt::Debug for LoginFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginFuture")
            .field("done", &self.is_done())
            .field("logged_in", &self.is_logged_in())
            .finish()
    }
}
