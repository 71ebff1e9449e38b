//! Collaborators that live outside the engine: who holds which inbox, and who gets told about
//! new mail.

use std::collections::HashSet;
use std::sync::RwLock;

use tracing::info;

use crate::address;

/// Reports which inbox addresses are currently reserved ("locked") by a user.
///
/// Mail to a locked inbox is never purged. Implementations are expected to accept addresses in
/// any case.
pub trait LockOracle: Send + Sync {
    fn is_locked(&self, address: &str) -> bool;

    /// Every locked address, lowercased.
    fn all_locked(&self) -> Vec<String>;
}

/// Nothing is ever locked.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocks;

impl LockOracle for NoLocks {
    fn is_locked(&self, _: &str) -> bool {
        false
    }

    fn all_locked(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A lock list held in memory, seeded from configuration.
#[derive(Debug, Default)]
pub struct StaticLockOracle {
    locked: RwLock<HashSet<String>>,
}

impl StaticLockOracle {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        StaticLockOracle {
            locked: RwLock::new(
                addresses
                    .into_iter()
                    .map(|a| address::normalize(a.as_ref()))
                    .filter(|a| !a.is_empty())
                    .collect(),
            ),
        }
    }

    /// Reserve `address`. Returns `false` if it already was.
    pub fn lock(&self, address: &str) -> bool {
        self.locked
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address::normalize(address))
    }

    /// Release `address`. Returns `false` if it was not locked.
    pub fn unlock(&self, address: &str) -> bool {
        self.locked
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&address::normalize(address))
    }
}

impl LockOracle for StaticLockOracle {
    fn is_locked(&self, address: &str) -> bool {
        self.locked
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&address::normalize(address))
    }

    fn all_locked(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .locked
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        all.sort();
        all
    }
}

/// Fire-and-forget delivery of "new mail for this inbox".
pub trait NotificationSink: Send + Sync {
    fn notify(&self, address: &str);
}

/// Writes every notification to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, address: &str) {
        info!(address, "new mail");
    }
}
