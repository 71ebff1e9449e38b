//! An in-memory [`RemoteMailbox`].
//!
//! Behaves like a selected IMAP folder: UIDs are assigned in ascending order, messages can be
//! flagged deleted without being expunged, and `TO` matching is a case-insensitive substring
//! match the way IMAP `SEARCH` does it. It also records what was asked of it, which makes it
//! the backend of choice for exercising the engine without a server.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use mailparse::MailHeaderMap;

use crate::error::{Error, Result};
use crate::remote::{RawHeader, RemoteMailbox};
use crate::types::Uid;

#[derive(Debug)]
struct Message {
    raw: Vec<u8>,
    deleted: bool,
}

#[derive(Debug, Default)]
pub struct MemoryMailbox {
    messages: Mutex<BTreeMap<Uid, Message>>,
    last_uid: AtomicU32,
    header_batches: Mutex<Vec<Vec<Uid>>>,
    delete_batches: Mutex<Vec<Vec<Uid>>>,
    fetch_delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    fail_next_fetch: AtomicBool,
    stall_next_fetch: Mutex<Option<Duration>>,
    deletes_before_failure: Mutex<Option<usize>>,
    broken: AtomicBool,
    push: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Build a minimal RFC 5322 message.
pub fn compose(from: &str, to: &str, subject: &str, date: &str) -> Vec<u8> {
    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
        from, to, subject, date, subject
    )
    .into_bytes()
}

fn header_section(raw: &[u8]) -> &[u8] {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|end| &raw[..end + 4])
        .unwrap_or(raw)
}

impl MemoryMailbox {
    pub fn new() -> Self {
        MemoryMailbox::default()
    }

    /// Make every header fetch take at least `delay`.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Deliver a message; returns its UID.
    pub fn append(&self, raw: Vec<u8>) -> Uid {
        let uid = self.last_uid.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.messages).insert(uid, Message { raw, deleted: false });
        uid
    }

    /// Set `\Deleted` on a message without expunging it.
    pub fn mark_deleted(&self, uid: Uid) {
        if let Some(m) = lock(&self.messages).get_mut(&uid) {
            m.deleted = true;
        }
    }

    /// Whether a message with this UID exists and is not flagged deleted.
    pub fn contains(&self, uid: Uid) -> bool {
        lock(&self.messages).get(&uid).map_or(false, |m| !m.deleted)
    }

    /// Every header fetch batch requested so far, in request order.
    pub fn header_batches(&self) -> Vec<Vec<Uid>> {
        lock(&self.header_batches).clone()
    }

    /// Every delete batch requested so far, in request order.
    pub fn delete_batches(&self) -> Vec<Vec<Uid>> {
        lock(&self.delete_batches).clone()
    }

    /// The largest number of header fetches that were running at the same time.
    pub fn peak_concurrent_fetches(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Make the next header fetch fail with a server refusal.
    pub fn fail_next_header_fetch(&self) {
        self.fail_next_fetch.store(true, Ordering::SeqCst);
    }

    /// Make the next header fetch hold on to its result for `stall` before returning it.
    pub fn stall_next_header_fetch(&self, stall: Duration) {
        *lock(&self.stall_next_fetch) = Some(stall);
    }

    /// Let `batches` more delete requests through, then refuse the rest.
    pub fn fail_deletes_after(&self, batches: usize) {
        *lock(&self.deletes_before_failure) = Some(batches);
    }

    /// Make every later call fail as if the connection dropped.
    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Announce new mail, as an IMAP server would with `EXISTS`.
    pub fn signal_push(&self) {
        self.push.store(true, Ordering::SeqCst);
    }

    fn check_connection(&self) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        Ok(())
    }

    fn uids(&self, include_deleted: bool) -> Vec<Uid> {
        lock(&self.messages)
            .iter()
            .rev()
            .filter(|(_, m)| include_deleted || !m.deleted)
            .map(|(&uid, _)| uid)
            .collect()
    }
}

impl RemoteMailbox for MemoryMailbox {
    fn undeleted_uids(&self) -> Result<Vec<Uid>> {
        self.check_connection()?;
        Ok(self.uids(false))
    }

    fn all_uids(&self) -> Result<Vec<Uid>> {
        self.check_connection()?;
        Ok(self.uids(true))
    }

    fn fetch_headers(&self, uids: &[Uid]) -> Result<Vec<RawHeader>> {
        self.check_connection()?;
        if self.fail_next_fetch.swap(false, Ordering::SeqCst) {
            return Err(Error::Rejected("NO [UNAVAILABLE] try again later".to_string()));
        }
        lock(&self.header_batches).push(uids.to_vec());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            thread::sleep(self.fetch_delay);
        }
        let headers = {
            let messages = lock(&self.messages);
            uids.iter()
                .filter_map(|uid| {
                    messages.get(uid).map(|m| RawHeader {
                        uid: *uid,
                        bytes: header_section(&m.raw).to_vec(),
                    })
                })
                .collect()
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let stall = lock(&self.stall_next_fetch).take();
        if let Some(stall) = stall {
            thread::sleep(stall);
        }
        Ok(headers)
    }

    fn uid_addressed_to(&self, uid: Uid, address: &str) -> Result<bool> {
        self.check_connection()?;
        let messages = lock(&self.messages);
        let message = match messages.get(&uid) {
            Some(m) if !m.deleted => m,
            _ => return Ok(false),
        };
        let needle = address.to_lowercase();
        let matched = mailparse::parse_headers(&message.raw)
            .map(|(headers, _)| {
                headers
                    .get_all_values("To")
                    .iter()
                    .any(|to| to.to_lowercase().contains(&needle))
            })
            .unwrap_or(false);
        Ok(matched)
    }

    fn fetch_message(&self, uid: Uid) -> Result<Option<Vec<u8>>> {
        self.check_connection()?;
        Ok(lock(&self.messages).get(&uid).map(|m| m.raw.clone()))
    }

    fn delete(&self, uids: &[Uid]) -> Result<()> {
        self.check_connection()?;
        if let Some(left) = lock(&self.deletes_before_failure).as_mut() {
            if *left == 0 {
                return Err(Error::Rejected("NO [EXPUNGEISSUED] expunge failed".to_string()));
            }
            *left -= 1;
        }
        lock(&self.delete_batches).push(uids.to_vec());
        let mut messages = lock(&self.messages);
        for uid in uids {
            messages.remove(uid);
        }
        Ok(())
    }

    fn take_push(&self) -> Result<bool> {
        self.check_connection()?;
        Ok(self.push.swap(false, Ordering::SeqCst))
    }
}
