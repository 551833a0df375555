use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Shared flag checked by the engine at operation boundaries.
///
/// Clones observe the same flag, so a front-end keeps one clone and hands
/// another to `create_patch_with` / `apply_patch_with`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with `Error::Cancelled` if cancellation was requested.
    pub fn check(&self, completed: usize) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled { completed })
        } else {
            Ok(())
        }
    }
}
