//! Reconnect gate.
//!
//! While a reconnect swaps the connection handle, the winner of
//! [`Blocker::try_block`] holds the gate and every RPC waits in
//! [`Blocker::wait`] / [`Blocker::wait_with_cancel`]. [`Blocker::unblock`]
//! releases all waiters at once. Each blocking episode gets its own
//! cancellation token, so a waiter that grabbed the token right before the
//! unblock still observes it.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::StreamError;

/// Gate that holds callers while a reconnect is in progress.
#[derive(Debug, Default)]
pub struct Blocker {
    /// `Some` while blocked; the token is cancelled on unblock.
    episode: Mutex<Option<CancellationToken>>,
}

impl Blocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn episode(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.episode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether a blocking episode is in progress.
    pub fn is_blocked(&self) -> bool {
        self.episode().is_some()
    }

    /// Moves the gate from unblocked to blocked.
    ///
    /// Returns `false` without side effects when someone else already holds it.
    pub fn try_block(&self) -> bool {
        let mut guard = self.episode();
        if guard.is_some() {
            return false;
        }
        *guard = Some(CancellationToken::new());
        true
    }

    /// Releases every waiter of the current episode. No-op when not blocked.
    pub fn unblock(&self) {
        let released = self.episode().take();
        match released {
            Some(token) => token.cancel(),
            None => warn!("unblock called on a gate that is not blocked"),
        }
    }

    /// Waits for the current episode to end, giving up after `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Result<(), StreamError> {
        let Some(token) = self.current() else {
            return Ok(());
        };
        tokio::time::timeout(timeout, token.cancelled())
            .await
            .map_err(|_| StreamError::BlockTimeout(timeout))
    }

    /// Waits for the current episode to end unless `cancel` fires first.
    pub async fn wait_with_cancel(&self, cancel: &CancellationToken) -> Result<(), StreamError> {
        let Some(token) = self.current() else {
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => Ok(()),
            _ = cancel.cancelled() => Err(StreamError::Cancelled),
        }
    }

    fn current(&self) -> Option<CancellationToken> {
        self.episode().clone()
    }
}
