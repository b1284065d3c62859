//! Cancellation bridging
//!
//! External abort signals are bridged into an operation-local token so the
//! operation can cancel its own children without tripping the caller's signal.

use crate::{Error, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Abort signal passed into long-running operations
pub type AbortSignal = CancellationToken;

/// Operation-scoped cancellation linked to an optional external signal.
///
/// A parent that is already cancelled cancels the scope immediately. The link
/// to the parent is released when the scope is dropped.
#[derive(Debug)]
pub struct AbortScope {
    token: CancellationToken,
}

impl AbortScope {
    /// Bridge an external signal into a fresh scope
    pub fn bridge(external: Option<&AbortSignal>) -> Self {
        let token = match external {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        Self { token }
    }

    /// Token for children of this operation
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this scope (and only this scope)
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail fast with `Error::Cancelled` if the scope was already aborted
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Race a future against an optional abort signal
pub async fn abortable<F, T>(signal: Option<&AbortSignal>, fut: F) -> Result<T>
where
    F: Future<Output = T>,
{
    match signal {
        Some(signal) => {
            if signal.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tokio::select! {
                biased;
                _ = signal.cancelled() => Err(Error::Cancelled),
                out = fut => Ok(out),
            }
        }
        None => Ok(fut.await),
    }
}
