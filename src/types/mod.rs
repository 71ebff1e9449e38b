//! This module contains the types shared by the store, the synchronization service and the
//! facade.

mod example;
mod mail;
mod summary;

pub use self::example::ExampleInbox;
pub use self::mail::{Attachment, FetchOutcome, FullMail, MailContent};
pub use self::summary::{HeaderFields, MailSummary};

/// A message's unique identifier within the mirrored folder.
///
/// Same as [`imap::types::Uid`]: assigned by the server in strictly ascending order and stable for
/// the lifetime of the message.
pub type Uid = imap::types::Uid;

/// Connection lifecycle of the synchronization service.
///
/// `Faulted` is terminal: the process has to be restarted to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}
