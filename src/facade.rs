//! The API the outside world talks to.
//!
//! [`ProcessingFacade`] ties the synchronization service to the recipient index: events from
//! the service land in the [`MessageStore`] through an [`IndexingSink`], full-message reads go
//! through a short-lived cache, and deletes keep the index and the server consistent.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, error, info};

use crate::address;
use crate::collab::{LockOracle, NotificationSink};
use crate::config::Config;
use crate::connection::{ConnectionManager, Connector};
use crate::error::{Error, Result};
use crate::retention::Retention;
use crate::scheduler::FetchScheduler;
use crate::store::MessageStore;
use crate::sync::{MailEvents, SyncService};
use crate::types::{FetchOutcome, MailSummary, Uid};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Files ingested mail under each of its recipients and announces it.
pub struct IndexingSink {
    store: Arc<MessageStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl IndexingSink {
    pub fn new(store: Arc<MessageStore>, notifier: Arc<dyn NotificationSink>) -> Self {
        IndexingSink { store, notifier }
    }
}

impl MailEvents for IndexingSink {
    fn on_new_mail(&self, summary: &MailSummary) {
        for recipient in &summary.to {
            self.store.add(Some(recipient), summary.clone());
            self.notifier.notify(recipient);
        }
    }

    fn on_mail_deleted(&self, uid: Uid) {
        self.store.remove_uid(uid, None);
    }

    fn on_initial_load_complete(&self) {
        info!(inboxes = self.store.mail_count(), "index ready");
    }

    fn on_connection_error(&self, error: &Error) {
        error!(%error, "mailbox connection lost; restart required");
    }
}

type CacheKey = (String, Uid, bool);

struct Cached {
    at: Instant,
    outcome: FetchOutcome,
}

pub struct ProcessingFacade {
    sync: Arc<SyncService>,
    store: Arc<MessageStore>,
    locks: Arc<dyn LockOracle>,
    retention: Retention,
    cache: Mutex<LruCache<CacheKey, Cached>>,
    ttl: Duration,
}

impl ProcessingFacade {
    pub fn new(
        sync: Arc<SyncService>,
        store: Arc<MessageStore>,
        locks: Arc<dyn LockOracle>,
        retention: Retention,
    ) -> Self {
        ProcessingFacade {
            sync,
            store,
            locks,
            retention,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Change how long and how many full-message reads are cached.
    pub fn with_cache(mut self, ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        self.cache = Mutex::new(LruCache::new(capacity));
        self.ttl = ttl;
        self
    }

    /// Wire up the store, the synchronization service and the facade as `config` describes.
    pub fn from_config<C>(
        config: &Config,
        connector: C,
        locks: Arc<dyn LockOracle>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self
    where
        C: Connector + 'static,
    {
        let store = Arc::new(MessageStore::new(config.example.clone()));
        let events = Arc::new(IndexingSink::new(Arc::clone(&store), notifier));
        let connection = ConnectionManager::new(connector, config.imap.retry_backoff());
        let sync = SyncService::new(connection, Arc::clone(&locks), events)
            .with_scheduler(FetchScheduler::new(
                config.sync.fetch_chunk_size,
                config.sync.fetch_concurrency,
            ))
            .with_refresh_interval(config.sync.refresh_interval())
            .with_example(config.example.clone());
        ProcessingFacade::new(Arc::new(sync), store, locks, config.retention)
            .with_cache(config.cache.ttl(), config.cache.capacity)
    }

    pub fn sync(&self) -> &Arc<SyncService> {
        &self.sync
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<CacheKey, Cached>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read one message of the inbox `address`.
    ///
    /// Found messages are cached for a while. A miss is never cached, since the UID may still
    /// be handed out to a future message.
    pub fn get_one_full_mail(&self, address: &str, uid: Uid, raw: bool) -> Result<FetchOutcome> {
        let key = (address::normalize(address), uid, raw);
        {
            let mut cache = self.cache();
            match cache.get(&key) {
                Some(hit) if hit.at.elapsed() < self.ttl => return Ok(hit.outcome.clone()),
                Some(_) => {
                    cache.pop(&key);
                }
                None => {}
            }
        }

        let outcome = self.sync.fetch_one_full_mail(&key.0, uid, raw)?;
        if outcome.is_found() {
            self.cache().put(
                key,
                Cached {
                    at: Instant::now(),
                    outcome: outcome.clone(),
                },
            );
        }
        Ok(outcome)
    }

    /// Forget every cached read. Called whenever any inbox is locked or unlocked.
    pub fn on_lock_state_changed(&self) {
        self.cache().clear();
        debug!("lock state changed, read cache cleared");
    }

    /// Delete message `uid` from the inbox `address`.
    ///
    /// The server is only asked to delete it if the index had it under that inbox, so nobody
    /// can delete mail from an inbox other than their own. Returns whether it was deleted.
    pub fn delete_specific_email(&self, address: &str, uid: Uid) -> Result<bool> {
        if !self.store.remove_uid(uid, Some(address)) {
            debug!(uid, address, "delete refused, not in this inbox");
            return Ok(false);
        }
        self.evict(uid);
        self.sync.delete_specific_email(uid)
    }

    /// Purge everything past the retention window. Failures are logged, never returned.
    ///
    /// Returns the number of deleted messages.
    pub fn run_purge_pass(&self) -> usize {
        let res = self
            .retention
            .cutoff()
            .and_then(|cutoff| self.sync.delete_old_mails(cutoff));
        let deleted = match res {
            Ok(deleted) => deleted,
            Err(Error::PurgeIncomplete { deleted, source }) => {
                error!(error = %source, deleted = deleted.len(), "purge stopped partway");
                deleted
            }
            Err(e) => {
                error!(error = %e, retention = %self.retention, "purge failed");
                return 0;
            }
        };
        for &uid in &deleted {
            self.evict(uid);
        }
        deleted.len()
    }

    fn evict(&self, uid: Uid) {
        let mut cache = self.cache();
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(k, _)| k.1 == uid)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub fn inbox(&self, address: &str) -> Vec<MailSummary> {
        self.store.get_for_recipient(address)
    }

    pub fn all_mails(&self) -> Vec<MailSummary> {
        self.store.get_all()
    }

    pub fn mail_count(&self) -> usize {
        self.store.mail_count()
    }

    pub fn largest_uid(&self) -> Result<Option<Uid>> {
        self.sync.get_largest_uid()
    }

    pub fn seconds_until_next_refresh(&self) -> Option<u64> {
        self.sync.get_seconds_until_next_refresh()
    }

    pub fn is_locked(&self, address: &str) -> bool {
        self.locks.is_locked(address)
    }
}
