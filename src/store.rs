//! The in-memory recipient index.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::address;
use crate::types::{ExampleInbox, MailSummary, Uid};

#[derive(Debug, Default)]
struct Index {
    by_recipient: HashMap<String, Vec<MailSummary>>,
    // uid -> recipients holding it, so removal without an address needs no full scan
    by_uid: HashMap<Uid, HashSet<String>>,
}

impl Index {
    fn remove_from(&mut self, uid: Uid, recipient: &str) -> bool {
        let removed = match self.by_recipient.get_mut(recipient) {
            Some(bucket) => {
                let before = bucket.len();
                bucket.retain(|s| s.uid != uid);
                let removed = bucket.len() != before;
                if bucket.is_empty() {
                    self.by_recipient.remove(recipient);
                }
                removed
            }
            None => false,
        };
        if let Some(recipients) = self.by_uid.get_mut(&uid) {
            recipients.remove(recipient);
            if recipients.is_empty() {
                self.by_uid.remove(&uid);
            }
        }
        removed
    }
}

/// Newest first; UID breaks ties so the order never depends on insertion order.
fn by_date_desc(a: &MailSummary, b: &MailSummary) -> Ordering {
    b.date.cmp(&a.date).then_with(|| b.uid.cmp(&a.uid))
}

/// Recipient → message summaries, shared by ingestion, purge and user deletes.
#[derive(Debug, Default)]
pub struct MessageStore {
    index: RwLock<Index>,
    example: ExampleInbox,
}

impl MessageStore {
    pub fn new(example: ExampleInbox) -> Self {
        MessageStore {
            index: RwLock::new(Index::default()),
            example,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    /// File `summary` under `recipient`. Without a recipient this does nothing.
    ///
    /// Adding a UID that the bucket already holds replaces the old entry.
    pub fn add(&self, recipient: Option<&str>, summary: MailSummary) {
        let recipient = match recipient {
            Some(r) => address::normalize(r),
            None => return,
        };
        if recipient.is_empty() {
            return;
        }
        let mut index = self.write();
        let uid = summary.uid;
        let bucket = index.by_recipient.entry(recipient.clone()).or_default();
        bucket.retain(|s| s.uid != uid);
        bucket.push(summary);
        index.by_uid.entry(uid).or_default().insert(recipient);
    }

    /// The inbox of `address`, newest first.
    ///
    /// Reading the demo inbox also evicts every message in it that is not allow-listed, so
    /// arbitrary mail never piles up there.
    pub fn get_for_recipient(&self, address: &str) -> Vec<MailSummary> {
        let address = address::normalize(address);
        if self.example.is_example_address(&address) {
            let stray: Vec<Uid> = self
                .read()
                .by_recipient
                .get(&address)
                .map(|bucket| {
                    bucket
                        .iter()
                        .map(|s| s.uid)
                        .filter(|&uid| !self.example.is_example_uid(uid))
                        .collect()
                })
                .unwrap_or_default();
            if !stray.is_empty() {
                let mut index = self.write();
                for uid in &stray {
                    index.remove_from(*uid, &address);
                }
                debug!(count = stray.len(), "evicted non-example mail from the example inbox");
            }
        }

        let mut summaries = self
            .read()
            .by_recipient
            .get(&address)
            .cloned()
            .unwrap_or_default();
        summaries.sort_by(by_date_desc);
        summaries
    }

    /// Every indexed message, each UID once, newest first.
    pub fn get_all(&self) -> Vec<MailSummary> {
        let index = self.read();
        let mut seen = HashSet::new();
        let mut summaries: Vec<MailSummary> = index
            .by_recipient
            .values()
            .flatten()
            .filter(|s| seen.insert(s.uid))
            .cloned()
            .collect();
        drop(index);
        summaries.sort_by(by_date_desc);
        summaries
    }

    /// Remove `uid`, from the inbox of `address` only if one is given, else from every inbox.
    ///
    /// Allow-listed demo UIDs are never removed. Returns whether anything was removed.
    pub fn remove_uid(&self, uid: Uid, address: Option<&str>) -> bool {
        if self.example.is_example_uid(uid) {
            return false;
        }
        let mut index = self.write();
        match address {
            Some(a) => index.remove_from(uid, &address::normalize(a)),
            None => {
                let recipients: Vec<String> = index
                    .by_uid
                    .get(&uid)
                    .map(|r| r.iter().cloned().collect())
                    .unwrap_or_default();
                let mut removed = false;
                for recipient in recipients {
                    removed |= index.remove_from(uid, &recipient);
                }
                removed
            }
        }
    }

    /// Number of inboxes holding at least one message.
    pub fn mail_count(&self) -> usize {
        self.read()
            .by_recipient
            .values()
            .filter(|b| !b.is_empty())
            .count()
    }

    /// The addresses of every non-empty inbox, sorted.
    pub fn recipients(&self) -> Vec<String> {
        let mut recipients: Vec<String> = self
            .read()
            .by_recipient
            .iter()
            .filter(|(_, b)| !b.is_empty())
            .map(|(r, _)| r.clone())
            .collect();
        recipients.sort();
        recipients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn summary(uid: Uid, to: &[&str], hours_ago: i64) -> MailSummary {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        MailSummary {
            uid,
            to: to.iter().map(|s| s.to_string()).collect(),
            from: vec!["sender@x.org".to_string()],
            subject: format!("message {}", uid),
            date: base - Duration::hours(hours_ago),
        }
    }

    fn uids(summaries: &[MailSummary]) -> Vec<Uid> {
        summaries.iter().map(|s| s.uid).collect()
    }

    #[test]
    fn ordering_ignores_insertion_order() {
        let store = MessageStore::default();
        store.add(Some("a@x.com"), summary(1, &["a@x.com"], 1));
        store.add(Some("a@x.com"), summary(2, &["a@x.com"], 5));
        store.add(Some("A@X.com"), summary(3, &["a@x.com"], 0));
        store.add(Some("a@x.com"), summary(4, &["a@x.com"], 5));
        assert_eq!(uids(&store.get_for_recipient("a@x.com")), vec![3, 1, 4, 2]);
    }

    #[test]
    fn missing_recipient_is_ignored() {
        let store = MessageStore::default();
        store.add(None, summary(1, &["a@x.com"], 1));
        assert_eq!(store.mail_count(), 0);
        assert!(store.get_all().is_empty());
    }

    #[test]
    fn readding_does_not_duplicate() {
        let store = MessageStore::default();
        store.add(Some("a@x.com"), summary(1, &["a@x.com"], 1));
        store.add(Some("a@x.com"), summary(1, &["a@x.com"], 1));
        assert_eq!(store.get_for_recipient("a@x.com").len(), 1);
    }

    #[test]
    fn multi_recipient_lands_in_each_inbox() {
        let store = MessageStore::default();
        let s = summary(7, &["a@x.com", "b@x.com"], 1);
        store.add(Some("a@x.com"), s.clone());
        store.add(Some("b@x.com"), s);
        assert_eq!(store.mail_count(), 2);
        assert_eq!(uids(&store.get_all()), vec![7]);
        assert_eq!(store.recipients(), vec!["a@x.com", "b@x.com"]);

        assert!(store.remove_uid(7, Some("a@x.com")));
        assert!(store.get_for_recipient("a@x.com").is_empty());
        assert_eq!(uids(&store.get_for_recipient("b@x.com")), vec![7]);
        assert_eq!(store.mail_count(), 1);

        assert!(store.remove_uid(7, None));
        assert_eq!(store.mail_count(), 0);
        assert!(!store.remove_uid(7, None));
    }

    #[test]
    fn scoped_removal_misses_other_inboxes() {
        let store = MessageStore::default();
        store.add(Some("b@x.com"), summary(8, &["b@x.com"], 1));
        assert!(!store.remove_uid(8, Some("a@x.com")));
        assert_eq!(store.mail_count(), 1);
    }

    #[test]
    fn example_uids_are_never_removed() {
        let store = MessageStore::new(ExampleInbox::new("demo@x.com", vec![1]));
        store.add(Some("demo@x.com"), summary(1, &["demo@x.com"], 1));
        assert!(!store.remove_uid(1, None));
        assert!(!store.remove_uid(1, Some("demo@x.com")));
        assert_eq!(uids(&store.get_for_recipient("demo@x.com")), vec![1]);
    }

    #[test]
    fn example_inbox_evicts_strays() {
        let store = MessageStore::new(ExampleInbox::new("demo@x.com", vec![1, 2]));
        store.add(Some("demo@x.com"), summary(1, &["demo@x.com"], 1));
        store.add(Some("demo@x.com"), summary(5, &["demo@x.com", "c@x.com"], 0));
        store.add(Some("c@x.com"), summary(5, &["demo@x.com", "c@x.com"], 0));

        assert_eq!(uids(&store.get_for_recipient("Demo@X.com")), vec![1]);
        // evicted from the store, not merely hidden
        assert_eq!(store.recipients(), vec!["c@x.com", "demo@x.com"]);
        assert_eq!(uids(&store.get_for_recipient("c@x.com")), vec![5]);
        assert_eq!(uids(&store.get_all()), vec![5, 1]);
        assert!(store.remove_uid(5, None));
        assert_eq!(uids(&store.get_all()), vec![1]);
    }

    #[test]
    fn mail_count_counts_inboxes_not_messages() {
        let store = MessageStore::default();
        store.add(Some("a@x.com"), summary(1, &["a@x.com"], 1));
        store.add(Some("a@x.com"), summary(2, &["a@x.com"], 2));
        store.add(Some("b@x.com"), summary(3, &["b@x.com"], 3));
        assert_eq!(store.mail_count(), 2);
    }
}
