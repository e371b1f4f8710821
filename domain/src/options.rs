//! Per-call context and scoped storage options.

use std::fmt;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::RepoError;

/// Cancellation and deadline state for a single repository call.
///
/// Backends check it before touching storage and keep watching it while a
/// statement or request is in flight.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing token, e.g. one owned by a request or shutdown handler.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// `Err` once the token fired or the deadline passed.
    pub fn check(&self) -> Result<(), RepoError> {
        if self.cancel.is_cancelled() {
            return Err(RepoError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(RepoError::DeadlineExceeded);
        }
        Ok(())
    }
}

/// Modifiers applied around a single repository call.
///
/// The transaction is owned and sequenced by the caller; the repository only
/// routes the call through it.
pub struct ScopedOptions<'a, Tx> {
    /// Run inside this caller-owned transaction instead of the default connection.
    pub tx: Option<&'a Tx>,
    /// Read from the primary instead of a follower replica.
    pub force_primary: bool,
    /// Hold an exclusive lock on touched records until the transaction ends.
    pub lock: bool,
}

impl<'a, Tx> ScopedOptions<'a, Tx> {
    pub fn new() -> Self {
        Self {
            tx: None,
            force_primary: false,
            lock: false,
        }
    }

    pub fn in_tx(mut self, tx: &'a Tx) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn from_primary(mut self) -> Self {
        self.force_primary = true;
        self
    }

    pub fn for_update(mut self) -> Self {
        self.lock = true;
        self
    }
}

impl<Tx> Default for ScopedOptions<'_, Tx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx> Clone for ScopedOptions<'_, Tx> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Tx> Copy for ScopedOptions<'_, Tx> {}

impl<Tx> fmt::Debug for ScopedOptions<'_, Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedOptions")
            .field("in_tx", &self.tx.is_some())
            .field("force_primary", &self.force_primary)
            .field("lock", &self.lock)
            .finish()
    }
}
