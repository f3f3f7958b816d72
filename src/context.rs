//! Request-scoped cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::LedgerError;

/// Cancellation flag shared between a caller and the work it started.
///
/// Clones observe the same flag. The envelope checks it before every
/// suspension point it controls (handler dispatch, COMMIT); the dispatch
/// worker checks it once per poll.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once `cancel` has been called on any clone.
    pub fn check(&self) -> Result<(), LedgerError> {
        if self.is_cancelled() {
            Err(LedgerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_by_clones() {
        let ctx = Context::new();
        let worker = ctx.clone();
        assert!(worker.check().is_ok());
        ctx.cancel();
        assert!(matches!(worker.check(), Err(LedgerError::Cancelled)));
    }
}
