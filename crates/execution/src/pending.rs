use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Volatile set of mints whose BUY has been detected but whose decision
/// stage has not finished. Producers write it BEFORE submitting, so a SELL
/// racing in from another source already sees the flag.
#[derive(Debug, Default)]
pub struct PendingBuys {
    mints: Mutex<HashSet<String>>,
}

impl PendingBuys {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, mint: &str) {
        self.mints
            .lock()
            .expect("pending-buy lock poisoned")
            .insert(mint.to_string());
    }

    pub fn contains(&self, mint: &str) -> bool {
        self.mints
            .lock()
            .expect("pending-buy lock poisoned")
            .contains(mint)
    }

    pub fn remove(&self, mint: &str) {
        self.mints
            .lock()
            .expect("pending-buy lock poisoned")
            .remove(mint);
    }
}

/// Clears the pending flag when the decision stage terminates, whatever the
/// exit path (finally-equivalent).
pub struct PendingClearGuard {
    registry: Arc<PendingBuys>,
    mint: Option<String>,
}

impl PendingClearGuard {
    pub fn new(registry: Arc<PendingBuys>, mint: Option<String>) -> Self {
        Self { registry, mint }
    }
}

impl Drop for PendingClearGuard {
    fn drop(&mut self) {
        if let Some(mint) = self.mint.take() {
            self.registry.remove(&mint);
        }
    }
}
