//! The narrow interface the engine needs from a remote mailbox.
//!
//! [`crate::connection::ImapMailbox`] implements it over a live IMAP session and
//! [`crate::memory::MemoryMailbox`] implements it in memory.

use crate::error::{Error, Result};
use crate::types::Uid;

/// Raw header bytes of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    pub uid: Uid,
    pub bytes: Vec<u8>,
}

/// A selected remote mailbox folder.
///
/// Implementations must be safe to call from several threads at once. A single IMAP session
/// satisfies this by funneling every command through one lock.
pub trait RemoteMailbox: Send + Sync {
    /// UIDs of every message without the `\Deleted` flag.
    fn undeleted_uids(&self) -> Result<Vec<Uid>>;

    /// UIDs of every message, deleted flag or not.
    fn all_uids(&self) -> Result<Vec<Uid>>;

    /// Header bytes for the given UIDs. UIDs that no longer exist are left out.
    fn fetch_headers(&self, uids: &[Uid]) -> Result<Vec<RawHeader>>;

    /// Whether the server reports message `uid` as addressed to `address`.
    ///
    /// The server's notion of "addressed to" may be looser than an exact match, so callers
    /// should verify the fetched header as well.
    fn uid_addressed_to(&self, uid: Uid, address: &str) -> Result<bool>;

    /// The full source of message `uid`, if it exists.
    fn fetch_message(&self, uid: Uid) -> Result<Option<Vec<u8>>>;

    /// Flag the given messages `\Deleted` and expunge them.
    fn delete(&self, uids: &[Uid]) -> Result<()>;

    /// Whether the server announced new mail since the last call. Clears the indication.
    ///
    /// This is best-effort; mail can arrive without an announcement, which is what periodic
    /// polling is for.
    fn take_push(&self) -> Result<bool>;
}

/// Quote an IMAP string argument.
pub(crate) fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', r"\\").replace('"', "\\\""))
}

/// Quote an IMAP string argument, rejecting characters that cannot appear in a quoted string.
pub(crate) fn validate_str(value: &str) -> Result<String> {
    let quoted = quote(value);
    if quoted.contains('\n') {
        return Err(Error::InvalidArgument('\n'));
    }
    if quoted.contains('\r') {
        return Err(Error::InvalidArgument('\r'));
    }
    Ok(quoted)
}

/// Render UIDs as an IMAP sequence set.
pub(crate) fn uid_set(uids: &[Uid]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
