// correlator.rs - single-fire wait handles linking blocking callers to firmware events
//! A [`TransactionSlot`] lives in the device or interface context and holds at most one armed
//! completion. The blocked caller owns the matching [`PendingTransaction`], which only keeps a
//! weak handle back to the slot so that a context torn down while a caller waits is not kept
//! alive by the waiter.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::oneshot, time};
use tracing::{debug, warn};

static NEXT_COOKIE: AtomicU64 = AtomicU64::new(1);

/// Identifier of one armed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(u64);

impl Cookie {
    fn next() -> Self {
        Self(NEXT_COOKIE.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("a transaction is already outstanding")]
    Busy,
    #[error("transaction timed out")]
    Timeout,
    #[error("transaction abandoned before completion")]
    Abandoned,
}

struct Armed<T> {
    cookie: Cookie,
    tx: oneshot::Sender<T>,
}

/// Holder for the single outstanding completion of one request kind.
pub struct TransactionSlot<T> {
    label: &'static str,
    armed: Mutex<Option<Armed<T>>>,
}

impl<T: Send + 'static> fmt::Debug for TransactionSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionSlot")
            .field("label", &self.label)
            .field("cookie", &self.cookie())
            .finish()
    }
}

impl<T: Send + 'static> TransactionSlot<T> {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            armed: Mutex::new(None),
        })
    }

    /// Publishes a fresh wait handle. Fails when another caller is already waiting.
    pub fn arm(self: &Arc<Self>) -> Result<PendingTransaction<T>, CorrelatorError> {
        let mut armed = self.armed.lock();
        if armed.as_ref().is_some_and(|entry| !entry.tx.is_closed()) {
            return Err(CorrelatorError::Busy);
        }
        let cookie = Cookie::next();
        let (tx, rx) = oneshot::channel();
        *armed = Some(Armed { cookie, tx });
        debug!(slot = self.label, %cookie, "transaction armed");
        Ok(PendingTransaction {
            cookie,
            rx: Some(rx),
            slot: Arc::downgrade(self),
        })
    }

    /// Cookie of the armed wait, if any.
    pub fn cookie(&self) -> Option<Cookie> {
        self.armed.lock().as_ref().map(|entry| entry.cookie)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }

    /// Completes whichever wait is armed. Returns `false` when nobody was waiting.
    pub fn complete(&self, value: T) -> bool {
        let taken = self.armed.lock().take();
        self.deliver(taken, value)
    }

    /// Completes the armed wait only if it carries `cookie`.
    pub fn complete_cookie(&self, cookie: Cookie, value: T) -> bool {
        let taken = {
            let mut armed = self.armed.lock();
            match armed.as_ref() {
                Some(entry) if entry.cookie == cookie => armed.take(),
                _ => None,
            }
        };
        self.deliver(taken, value)
    }

    fn deliver(&self, taken: Option<Armed<T>>, value: T) -> bool {
        match taken {
            Some(Armed { cookie, tx }) => {
                if tx.send(value).is_ok() {
                    debug!(slot = self.label, %cookie, "transaction completed");
                    true
                } else {
                    debug!(slot = self.label, %cookie, "completion for abandoned transaction dropped");
                    false
                }
            }
            None => {
                debug!(slot = self.label, "completion without an armed transaction ignored");
                false
            }
        }
    }

    fn disarm(&self, cookie: Cookie) {
        let mut armed = self.armed.lock();
        if armed.as_ref().is_some_and(|entry| entry.cookie == cookie) {
            *armed = None;
        }
    }
}

/// Waiting side of an armed transaction.
pub struct PendingTransaction<T: Send + 'static> {
    cookie: Cookie,
    rx: Option<oneshot::Receiver<T>>,
    slot: Weak<TransactionSlot<T>>,
}

impl<T: Send + 'static> fmt::Debug for PendingTransaction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransaction")
            .field("cookie", &self.cookie)
            .finish()
    }
}

impl<T: Send + 'static> PendingTransaction<T> {
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Blocks until the transaction completes or `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<T, CorrelatorError> {
        let Some(rx) = self.rx.take() else {
            return Err(CorrelatorError::Abandoned);
        };
        match time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CorrelatorError::Abandoned),
            Err(_) => {
                warn!(cookie = %self.cookie, ?timeout, "transaction timed out");
                Err(CorrelatorError::Timeout)
            }
        }
    }
}

impl<T: Send + 'static> Drop for PendingTransaction<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.upgrade() {
            slot.disarm(self.cookie);
        }
    }
}
