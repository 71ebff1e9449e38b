//! The synchronization service: mirrors the remote mailbox into the index and enforces
//! retention.
//!
//! The service owns no timers. A polling pass, a push check and a purge are plain calls; the
//! caller decides when to make them. Everything the service learns is reported through
//! [`MailEvents`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::address;
use crate::collab::LockOracle;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::remote::RemoteMailbox;
use crate::scheduler::FetchScheduler;
use crate::types::{
    ConnectionState, ExampleInbox, FetchOutcome, FullMail, HeaderFields, MailSummary, Uid,
};

/// Largest number of UIDs flagged and expunged with a single command.
pub const PURGE_BATCH_SIZE: usize = 100;

/// Default time between two scheduled polling passes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Receives what the service learns about the remote mailbox.
pub trait MailEvents: Send + Sync {
    /// A message with at least one usable recipient was ingested.
    fn on_new_mail(&self, summary: &MailSummary);

    /// A message was deleted from the remote mailbox.
    fn on_mail_deleted(&self, uid: Uid);

    /// The first polling pass finished. Fired once per process.
    fn on_initial_load_complete(&self) {}

    /// The connection faulted. The service stays faulted afterwards.
    fn on_connection_error(&self, _error: &Error) {}
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvents;

impl MailEvents for NoEvents {
    fn on_new_mail(&self, _: &MailSummary) {}
    fn on_mail_deleted(&self, _: Uid) {}
}

/// What a call to [`SyncService::run_polling_pass`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was already running, or there was nothing to react to.
    Skipped,
    /// The pass ran to completion.
    Completed {
        /// Number of messages handed to [`MailEvents::on_new_mail`].
        ingested: usize,
    },
}

struct Link {
    state: ConnectionState,
    mailbox: Option<Arc<dyn RemoteMailbox>>,
    fault: Option<String>,
}

// Clears the in-flight flag however the pass ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps the index in step with one remote mailbox.
pub struct SyncService {
    connection: ConnectionManager,
    link: RwLock<Link>,
    // every UID ever ingested, with the time it was first seen
    known: Mutex<HashMap<Uid, DateTime<Utc>>>,
    // UIDs deleted while still on the server's last listing; also serializes event emission
    tombstones: Mutex<HashSet<Uid>>,
    pass_in_flight: AtomicBool,
    initial_load_done: AtomicBool,
    last_poll: Mutex<Option<Instant>>,
    scheduler: FetchScheduler,
    refresh_interval: Duration,
    example: ExampleInbox,
    locks: Arc<dyn LockOracle>,
    events: Arc<dyn MailEvents>,
}

impl SyncService {
    pub fn new(
        connection: ConnectionManager,
        locks: Arc<dyn LockOracle>,
        events: Arc<dyn MailEvents>,
    ) -> Self {
        SyncService {
            connection,
            link: RwLock::new(Link {
                state: ConnectionState::Disconnected,
                mailbox: None,
                fault: None,
            }),
            known: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashSet::new()),
            pass_in_flight: AtomicBool::new(false),
            initial_load_done: AtomicBool::new(false),
            last_poll: Mutex::new(None),
            scheduler: FetchScheduler::default(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            example: ExampleInbox::none(),
            locks,
            events,
        }
    }

    pub fn with_scheduler(mut self, scheduler: FetchScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_example(mut self, example: ExampleInbox) -> Self {
        self.example = example;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.link.read().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn initial_load_complete(&self) -> bool {
        self.initial_load_done.load(Ordering::SeqCst)
    }

    /// Number of UIDs ingested since the process started.
    pub fn known_uid_count(&self) -> usize {
        lock(&self.known).len()
    }

    pub fn example(&self) -> &ExampleInbox {
        &self.example
    }

    /// Connect to the remote mailbox. Does nothing if already connected.
    ///
    /// Returns [`Error::NotReady`] while another caller is still connecting. Failing to connect
    /// faults the service for good.
    pub fn connect(&self) -> Result<()> {
        {
            let mut link = self.link.write().unwrap_or_else(|e| e.into_inner());
            match link.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => return Err(Error::NotReady),
                ConnectionState::Faulted => return Err(Self::faulted(&link)),
                ConnectionState::Disconnected => link.state = ConnectionState::Connecting,
            }
        }

        match self.connection.connect() {
            Ok(mailbox) => {
                let mut link = self.link.write().unwrap_or_else(|e| e.into_inner());
                link.mailbox = Some(mailbox);
                link.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.fault(&e);
                Err(e)
            }
        }
    }

    /// Connect, then run the initial polling pass in the background.
    ///
    /// Returns as soon as the connection is up, with a handle on the initial load.
    pub fn connect_and_load_messages(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.connect()?;
        let service = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("catchbox-initial-load".to_string())
            .spawn(move || match service.run_polling_pass() {
                Ok(outcome) => debug!(?outcome, "initial load finished"),
                Err(e) => warn!(error = %e, "initial load failed"),
            })?;
        Ok(handle)
    }

    /// Ingest every message on the server that has not been seen before.
    ///
    /// This is the scheduled poll; it restarts the countdown reported by
    /// [`SyncService::get_seconds_until_next_refresh`].
    pub fn run_polling_pass(&self) -> Result<PassOutcome> {
        *lock(&self.last_poll) = Some(Instant::now());
        self.pass()
    }

    /// React to new mail announced by the server.
    ///
    /// Announcements are ignored until the initial load has completed.
    pub fn on_push_notification(&self) -> Result<PassOutcome> {
        if !self.initial_load_complete() {
            return Ok(PassOutcome::Skipped);
        }
        let mailbox = self.mailbox()?;
        if !self.guard(mailbox.take_push())? {
            return Ok(PassOutcome::Skipped);
        }
        debug!("server announced new mail");
        self.pass()
    }

    fn pass(&self) -> Result<PassOutcome> {
        if self
            .pass_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("polling pass already in flight");
            return Ok(PassOutcome::Skipped);
        }
        let _guard = PassGuard(&self.pass_in_flight);

        let mailbox = self.mailbox()?;
        let ingested = self.guard(self.ingest(&*mailbox))?;

        if !self.initial_load_done.swap(true, Ordering::SeqCst) {
            info!(known = self.known_uid_count(), "initial load complete");
            self.events.on_initial_load_complete();
        }
        Ok(PassOutcome::Completed { ingested })
    }

    fn ingest(&self, mailbox: &dyn RemoteMailbox) -> Result<usize> {
        let server = mailbox.undeleted_uids()?;
        {
            // a UID gone from the listing can never be fetched again
            let listed: HashSet<Uid> = server.iter().copied().collect();
            lock(&self.tombstones).retain(|uid| listed.contains(uid));
        }
        let pending = {
            let known = lock(&self.known);
            FetchScheduler::pending(&server, |uid| known.contains_key(&uid))
        };
        if pending.is_empty() {
            return Ok(0);
        }
        debug!(count = pending.len(), "fetching new headers");

        let headers = self.scheduler.fetch_headers(mailbox, &pending)?;

        // every chunk is in; only now do the UIDs count as seen
        let now = Utc::now();
        {
            let mut known = lock(&self.known);
            for uid in &pending {
                known.entry(*uid).or_insert(now);
            }
        }

        // held while emitting, so a concurrent delete lands either before or after the whole batch
        let tombstones = lock(&self.tombstones);
        let mut ingested = 0;
        for fields in headers {
            let uid = fields.uid;
            if tombstones.contains(&uid) {
                debug!(uid, "skipping message deleted during the pass");
                continue;
            }
            match MailSummary::from_header(fields, now) {
                Some(summary) => {
                    self.events.on_new_mail(&summary);
                    ingested += 1;
                }
                None => debug!(uid, "skipping message without a usable recipient"),
            }
        }
        drop(tombstones);
        info!(ingested, "polling pass complete");
        Ok(ingested)
    }

    /// Delete every message dated at or before `cutoff`, except allow-listed demo messages and
    /// messages to a locked inbox. Returns the deleted UIDs.
    ///
    /// Locks are read once, before any message is looked at. If a batch fails after earlier
    /// batches went through, the error is [`Error::PurgeIncomplete`] carrying the deleted UIDs.
    pub fn delete_old_mails(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uid>> {
        let mailbox = self.mailbox()?;
        self.guard(self.purge(&*mailbox, cutoff))
    }

    fn purge(&self, mailbox: &dyn RemoteMailbox, cutoff: DateTime<Utc>) -> Result<Vec<Uid>> {
        let locked: HashSet<String> = self
            .locks
            .all_locked()
            .iter()
            .map(|a| address::normalize(a))
            .collect();

        let uids = mailbox.undeleted_uids()?;
        let headers = self.scheduler.fetch_headers(mailbox, &uids)?;

        let now = Utc::now();
        let expired: Vec<Uid> = {
            let known = lock(&self.known);
            headers
                .iter()
                .filter(|h| self.is_expired(h, &locked, &known, cutoff, now))
                .map(|h| h.uid)
                .collect()
        };

        let mut deleted = Vec::with_capacity(expired.len());
        for batch in expired.chunks(PURGE_BATCH_SIZE) {
            if let Err(e) = mailbox.delete(batch) {
                if deleted.is_empty() {
                    return Err(e);
                }
                warn!(deleted = deleted.len(), error = %e, "purge stopped partway");
                return Err(Error::PurgeIncomplete {
                    deleted,
                    source: Box::new(e),
                });
            }
            self.report_deleted(batch);
            deleted.extend_from_slice(batch);
        }
        info!(deleted = deleted.len(), %cutoff, "purge complete");
        Ok(deleted)
    }

    // Report UIDs gone from the server, after any pass that already holds them has emitted.
    fn report_deleted(&self, uids: &[Uid]) {
        let mut tombstones = lock(&self.tombstones);
        for &uid in uids {
            tombstones.insert(uid);
            self.events.on_mail_deleted(uid);
        }
    }

    fn is_expired(
        &self,
        header: &HeaderFields,
        locked: &HashSet<String>,
        known: &HashMap<Uid, DateTime<Utc>>,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.example.is_example_uid(header.uid) {
            return false;
        }
        if let Some(to) = header.to.iter().find(|a| locked.contains(*a)) {
            debug!(uid = header.uid, address = %to, "keeping mail to a locked inbox");
            return false;
        }
        let date = header
            .date
            .or_else(|| known.get(&header.uid).copied())
            .unwrap_or(now);
        date <= cutoff
    }

    /// Delete one message. Allow-listed demo messages are left alone.
    ///
    /// Returns whether a delete was issued.
    pub fn delete_specific_email(&self, uid: Uid) -> Result<bool> {
        if self.example.is_example_uid(uid) {
            debug!(uid, "refusing to delete an example message");
            return Ok(false);
        }
        let mailbox = self.mailbox()?;
        self.guard(mailbox.delete(&[uid]))?;
        self.report_deleted(&[uid]);
        Ok(true)
    }

    /// Read the message `uid`, provided it is addressed to `address`.
    ///
    /// Anything that is not a match, including a UID that does not exist, is
    /// [`FetchOutcome::NotFound`].
    pub fn fetch_one_full_mail(&self, address: &str, uid: Uid, raw: bool) -> Result<FetchOutcome> {
        let mailbox = self.mailbox()?;
        let address = address::normalize(address);
        if !address::is_usable(&address) {
            return Ok(FetchOutcome::NotFound);
        }
        self.guard(Self::fetch_addressed(&*mailbox, &address, uid, raw))
    }

    fn fetch_addressed(
        mailbox: &dyn RemoteMailbox,
        address: &str,
        uid: Uid,
        raw: bool,
    ) -> Result<FetchOutcome> {
        if !mailbox.uid_addressed_to(uid, address)? {
            return Ok(FetchOutcome::NotFound);
        }
        let source = match mailbox.fetch_message(uid)? {
            Some(source) => source,
            None => return Ok(FetchOutcome::NotFound),
        };
        // the server match may be a substring match; require the exact recipient
        if !HeaderFields::parse(uid, &source).addressed_to(address) {
            debug!(uid, address, "server matched a different recipient");
            return Ok(FetchOutcome::NotFound);
        }
        Ok(FetchOutcome::Found(FullMail::from_source(uid, &source, raw)))
    }

    /// The largest UID on the server, deleted or not.
    pub fn get_largest_uid(&self) -> Result<Option<Uid>> {
        let mailbox = self.mailbox()?;
        let uids = self.guard(mailbox.all_uids())?;
        Ok(uids.into_iter().max())
    }

    /// Seconds until the next scheduled poll is due, or `None` before the first one.
    pub fn get_seconds_until_next_refresh(&self) -> Option<u64> {
        let last = (*lock(&self.last_poll))?;
        Some(self.refresh_interval.saturating_sub(last.elapsed()).as_secs())
    }

    fn mailbox(&self) -> Result<Arc<dyn RemoteMailbox>> {
        let link = self.link.read().unwrap_or_else(|e| e.into_inner());
        match link.state {
            ConnectionState::Faulted => Err(Self::faulted(&link)),
            _ => link.mailbox.clone().ok_or(Error::NotReady),
        }
    }

    fn faulted(link: &Link) -> Error {
        Error::Faulted(
            link.fault
                .clone()
                .unwrap_or_else(|| "connection lost".to_string()),
        )
    }

    // Fault the service if `res` failed because the connection broke.
    fn guard<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(ref e) = res {
            if e.is_connection_fault() {
                self.fault(e);
            }
        }
        res
    }

    fn fault(&self, e: &Error) {
        {
            let mut link = self.link.write().unwrap_or_else(|e| e.into_inner());
            if link.state == ConnectionState::Faulted {
                return;
            }
            link.state = ConnectionState::Faulted;
            link.mailbox = None;
            link.fault = Some(e.to_string());
        }
        error!(error = %e, "connection to the remote mailbox faulted");
        self.events.on_connection_error(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{NoLocks, StaticLockOracle};
    use crate::memory::{compose, MemoryMailbox};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        new: Mutex<Vec<Uid>>,
        deleted: Mutex<Vec<Uid>>,
        loaded: AtomicUsize,
        errors: AtomicUsize,
    }

    impl MailEvents for Recorder {
        fn on_new_mail(&self, summary: &MailSummary) {
            self.new.lock().unwrap().push(summary.uid);
        }
        fn on_mail_deleted(&self, uid: Uid) {
            self.deleted.lock().unwrap().push(uid);
        }
        fn on_initial_load_complete(&self) {
            self.loaded.fetch_add(1, Ordering::SeqCst);
        }
        fn on_connection_error(&self, _: &Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn rfc2822(date: DateTime<Utc>) -> String {
        date.to_rfc2822()
    }

    fn service(
        mb: &Arc<MemoryMailbox>,
        locks: Arc<dyn LockOracle>,
    ) -> (SyncService, Arc<Recorder>) {
        let remote = Arc::clone(mb);
        let events = Arc::new(Recorder::default());
        let manager = ConnectionManager::new(
            move || -> Result<Arc<dyn RemoteMailbox>> {
                let mailbox: Arc<dyn RemoteMailbox> = remote.clone();
                Ok(mailbox)
            },
            Duration::from_millis(0),
        );
        let service = SyncService::new(manager, locks, events.clone());
        (service, events)
    }

    #[test]
    fn not_ready_before_connect() {
        let mb = Arc::new(MemoryMailbox::new());
        let (service, _) = service(&mb, Arc::new(NoLocks));
        assert_eq!(service.state(), ConnectionState::Disconnected);
        assert!(matches!(service.run_polling_pass(), Err(Error::NotReady)));
        assert!(matches!(
            service.fetch_one_full_mail("a@x.com", 1, false),
            Err(Error::NotReady)
        ));
        assert!(matches!(service.get_largest_uid(), Err(Error::NotReady)));
    }

    #[test]
    fn second_pass_ingests_only_new_mail() {
        let mb = Arc::new(MemoryMailbox::new());
        let now = Utc::now();
        mb.append(compose("s@x.org", "a@x.com", "one", &rfc2822(now)));
        let (service, events) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();

        assert_eq!(
            service.run_polling_pass().unwrap(),
            PassOutcome::Completed { ingested: 1 }
        );
        let two = mb.append(compose("s@x.org", "b@x.com", "two", &rfc2822(now)));
        assert_eq!(
            service.run_polling_pass().unwrap(),
            PassOutcome::Completed { ingested: 1 }
        );
        assert_eq!(
            service.run_polling_pass().unwrap(),
            PassOutcome::Completed { ingested: 0 }
        );
        assert_eq!(*events.new.lock().unwrap(), vec![1, two]);
        assert_eq!(events.loaded.load(Ordering::SeqCst), 1);
        assert_eq!(service.known_uid_count(), 2);
    }

    #[test]
    fn unaddressed_mail_is_seen_but_not_ingested() {
        let mb = Arc::new(MemoryMailbox::new());
        mb.append(b"From: s@x.org\r\nSubject: no to\r\n\r\nbody\r\n".to_vec());
        let (service, events) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();
        assert_eq!(
            service.run_polling_pass().unwrap(),
            PassOutcome::Completed { ingested: 0 }
        );
        assert!(events.new.lock().unwrap().is_empty());
        assert_eq!(service.known_uid_count(), 1);
    }

    #[test]
    fn failed_pass_leaves_uids_unseen() {
        let mb = Arc::new(MemoryMailbox::new());
        mb.append(compose("s@x.org", "a@x.com", "one", &rfc2822(Utc::now())));
        let (service, events) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();

        mb.fail_next_header_fetch();
        assert!(service.run_polling_pass().is_err());
        assert_eq!(service.known_uid_count(), 0);
        assert!(!service.initial_load_complete());
        assert_eq!(service.state(), ConnectionState::Connected);

        assert_eq!(
            service.run_polling_pass().unwrap(),
            PassOutcome::Completed { ingested: 1 }
        );
        assert_eq!(events.loaded.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn push_is_ignored_before_initial_load() {
        let mb = Arc::new(MemoryMailbox::new());
        mb.append(compose("s@x.org", "a@x.com", "one", &rfc2822(Utc::now())));
        let (service, events) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();

        mb.signal_push();
        assert_eq!(service.on_push_notification().unwrap(), PassOutcome::Skipped);
        assert!(events.new.lock().unwrap().is_empty());

        service.run_polling_pass().unwrap();
        mb.append(compose("s@x.org", "a@x.com", "two", &rfc2822(Utc::now())));
        assert_eq!(
            service.on_push_notification().unwrap(),
            PassOutcome::Completed { ingested: 1 }
        );
        // announcement consumed
        assert_eq!(service.on_push_notification().unwrap(), PassOutcome::Skipped);
    }

    #[test]
    fn pass_in_flight_skips_new_triggers() {
        let mb = Arc::new(MemoryMailbox::new());
        let (service, _) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();
        service.pass_in_flight.store(true, Ordering::SeqCst);
        assert_eq!(service.run_polling_pass().unwrap(), PassOutcome::Skipped);
        service.pass_in_flight.store(false, Ordering::SeqCst);
        assert!(matches!(
            service.run_polling_pass().unwrap(),
            PassOutcome::Completed { .. }
        ));
    }

    #[test]
    fn purge_respects_locks_and_examples() {
        let mb = Arc::new(MemoryMailbox::new());
        let now = Utc::now();
        let old = rfc2822(now - ChronoDuration::hours(50));
        let fresh = rfc2822(now - ChronoDuration::hours(1));
        let locked = mb.append(compose("s@x.org", "Locked@x.com", "keep", &old));
        let plain = mb.append(compose("s@x.org", "plain@x.com", "drop", &old));
        let example = mb.append(compose("s@x.org", "demo@x.com", "demo", &old));
        let recent = mb.append(compose("s@x.org", "plain@x.com", "new", &fresh));
        let both = mb.append(compose("s@x.org", "plain@x.com, locked@x.com", "cc", &old));

        let (service, events) = service(&mb, Arc::new(StaticLockOracle::new(["locked@x.com"])));
        let service = service.with_example(ExampleInbox::new("demo@x.com", vec![example]));
        service.connect().unwrap();

        let deleted = service
            .delete_old_mails(now - ChronoDuration::hours(48))
            .unwrap();
        assert_eq!(deleted, vec![plain]);
        assert_eq!(*events.deleted.lock().unwrap(), vec![plain]);
        for uid in [locked, example, recent, both] {
            assert!(mb.contains(uid));
        }
        assert!(!mb.contains(plain));
    }

    #[test]
    fn undated_mail_ages_from_first_sight() {
        let mb = Arc::new(MemoryMailbox::new());
        let uid = mb.append(b"To: a@x.com\r\nSubject: undated\r\n\r\nbody\r\n".to_vec());
        let (service, _) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();
        service.run_polling_pass().unwrap();

        let cutoff = Utc::now() - ChronoDuration::hours(1);
        assert!(service.delete_old_mails(cutoff).unwrap().is_empty());
        let deleted = service
            .delete_old_mails(Utc::now() + ChronoDuration::seconds(5))
            .unwrap();
        assert_eq!(deleted, vec![uid]);
    }

    #[test]
    fn purge_deletes_in_bounded_batches() {
        let mb = Arc::new(MemoryMailbox::new());
        let old = rfc2822(Utc::now() - ChronoDuration::days(3));
        for i in 0..250 {
            mb.append(compose("s@x.org", &format!("r{}@x.com", i), "old", &old));
        }
        let (service, events) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();
        let deleted = service.delete_old_mails(Utc::now()).unwrap();
        assert_eq!(deleted.len(), 250);
        let sizes: Vec<usize> = mb.delete_batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(events.deleted.lock().unwrap().len(), 250);
    }

    #[test]
    fn purge_during_pass_leaves_no_stale_mail() {
        let mb = Arc::new(MemoryMailbox::new());
        let old = rfc2822(Utc::now() - ChronoDuration::hours(50));
        let uid = mb.append(compose("s@x.org", "plain@x.com", "old", &old));
        let (service, events) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();
        mb.stall_next_header_fetch(Duration::from_millis(300));

        thread::scope(|s| {
            let pass = s.spawn(|| service.run_polling_pass().unwrap());
            thread::sleep(Duration::from_millis(50));
            let deleted = service
                .delete_old_mails(Utc::now() - ChronoDuration::hours(48))
                .unwrap();
            assert_eq!(deleted, vec![uid]);
            assert_eq!(pass.join().unwrap(), PassOutcome::Completed { ingested: 0 });
        });
        assert!(events.new.lock().unwrap().is_empty());
        assert_eq!(*events.deleted.lock().unwrap(), vec![uid]);
        assert!(!mb.contains(uid));

        // the next pass no longer lists the UID and forgets it
        service.run_polling_pass().unwrap();
        assert!(lock(&service.tombstones).is_empty());
    }

    #[test]
    fn delete_during_pass_leaves_no_stale_mail() {
        let mb = Arc::new(MemoryMailbox::new());
        let uid = mb.append(compose("s@x.org", "a@x.com", "hi", &rfc2822(Utc::now())));
        let kept = mb.append(compose("s@x.org", "b@x.com", "hi", &rfc2822(Utc::now())));
        let (service, events) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();
        mb.stall_next_header_fetch(Duration::from_millis(300));

        thread::scope(|s| {
            let pass = s.spawn(|| service.run_polling_pass().unwrap());
            thread::sleep(Duration::from_millis(50));
            assert!(service.delete_specific_email(uid).unwrap());
            pass.join().unwrap();
        });
        assert_eq!(*events.new.lock().unwrap(), vec![kept]);
        assert_eq!(*events.deleted.lock().unwrap(), vec![uid]);
    }

    #[test]
    fn partial_purge_reports_what_it_deleted() {
        let mb = Arc::new(MemoryMailbox::new());
        let old = rfc2822(Utc::now() - ChronoDuration::days(3));
        for i in 0..250 {
            mb.append(compose("s@x.org", &format!("r{}@x.com", i), "old", &old));
        }
        let (service, events) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();
        mb.fail_deletes_after(1);

        match service.delete_old_mails(Utc::now()) {
            Err(Error::PurgeIncomplete { deleted, source }) => {
                assert_eq!(deleted.len(), PURGE_BATCH_SIZE);
                assert_eq!(deleted, mb.delete_batches()[0]);
                assert!(matches!(*source, Error::Rejected(_)));
            }
            other => panic!("unexpected purge result: {:?}", other),
        }
        assert_eq!(events.deleted.lock().unwrap().len(), PURGE_BATCH_SIZE);
        assert_eq!(service.state(), ConnectionState::Connected);
    }

    #[test]
    fn purge_failing_up_front_deletes_nothing() {
        let mb = Arc::new(MemoryMailbox::new());
        let old = rfc2822(Utc::now() - ChronoDuration::days(3));
        let uid = mb.append(compose("s@x.org", "a@x.com", "old", &old));
        let (service, events) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();
        mb.fail_deletes_after(0);

        assert!(matches!(
            service.delete_old_mails(Utc::now()),
            Err(Error::Rejected(_))
        ));
        assert!(mb.contains(uid));
        assert!(events.deleted.lock().unwrap().is_empty());
    }

    #[test]
    fn connect_while_connecting_is_not_ready() {
        let mb = Arc::new(MemoryMailbox::new());
        let (service, _) = service(&mb, Arc::new(NoLocks));
        service.link.write().unwrap().state = ConnectionState::Connecting;
        assert!(matches!(service.connect(), Err(Error::NotReady)));
        assert_eq!(service.state(), ConnectionState::Connecting);

        service.link.write().unwrap().state = ConnectionState::Disconnected;
        service.connect().unwrap();
        assert_eq!(service.state(), ConnectionState::Connected);
    }

    #[test]
    fn example_messages_cannot_be_deleted() {
        let mb = Arc::new(MemoryMailbox::new());
        let uid = mb.append(compose("s@x.org", "demo@x.com", "demo", &rfc2822(Utc::now())));
        let (service, events) = service(&mb, Arc::new(NoLocks));
        let service = service.with_example(ExampleInbox::new("demo@x.com", vec![uid]));
        service.connect().unwrap();
        assert!(!service.delete_specific_email(uid).unwrap());
        assert!(mb.contains(uid));
        assert!(events.deleted.lock().unwrap().is_empty());
    }

    #[test]
    fn full_mail_requires_exact_recipient() {
        let mb = Arc::new(MemoryMailbox::new());
        let uid = mb.append(compose("s@x.org", "bob@x.com", "hello", &rfc2822(Utc::now())));
        let (service, _) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();

        assert!(service.fetch_one_full_mail("Bob@X.com", uid, false).unwrap().is_found());
        // the in-memory server matches substrings, like IMAP SEARCH
        assert_eq!(
            service.fetch_one_full_mail("b@x.com", uid, false).unwrap(),
            FetchOutcome::NotFound
        );
        assert_eq!(
            service.fetch_one_full_mail("carol@x.com", uid, false).unwrap(),
            FetchOutcome::NotFound
        );
        assert_eq!(
            service.fetch_one_full_mail("bob@x.com", uid + 10, false).unwrap(),
            FetchOutcome::NotFound
        );
        assert_eq!(
            service.fetch_one_full_mail("bob@x.com\r\n", uid, false).unwrap(),
            FetchOutcome::Found(FullMail::from_source(
                uid,
                &mb.fetch_message(uid).unwrap().unwrap(),
                false
            ))
        );
    }

    #[test]
    fn connection_fault_is_terminal() {
        let mb = Arc::new(MemoryMailbox::new());
        let (service, events) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();
        mb.break_connection();

        assert!(service.run_polling_pass().is_err());
        assert_eq!(service.state(), ConnectionState::Faulted);
        assert_eq!(events.errors.load(Ordering::SeqCst), 1);
        assert!(matches!(service.get_largest_uid(), Err(Error::Faulted(_))));
        assert!(matches!(service.connect(), Err(Error::Faulted(_))));
        assert_eq!(events.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn largest_uid_counts_deleted_mail() {
        let mb = Arc::new(MemoryMailbox::new());
        let (service, _) = service(&mb, Arc::new(NoLocks));
        service.connect().unwrap();
        assert_eq!(service.get_largest_uid().unwrap(), None);
        mb.append(compose("s@x.org", "a@x.com", "one", &rfc2822(Utc::now())));
        let last = mb.append(compose("s@x.org", "a@x.com", "two", &rfc2822(Utc::now())));
        mb.mark_deleted(last);
        assert_eq!(service.get_largest_uid().unwrap(), Some(last));
    }

    #[test]
    fn refresh_countdown() {
        let mb = Arc::new(MemoryMailbox::new());
        let (service, _) = service(&mb, Arc::new(NoLocks));
        let service = service.with_refresh_interval(Duration::from_secs(60));
        assert_eq!(service.get_seconds_until_next_refresh(), None);
        service.connect().unwrap();
        service.run_polling_pass().unwrap();
        let left = service.get_seconds_until_next_refresh().unwrap();
        assert!(left <= 60 && left >= 58, "{}", left);
    }
}
