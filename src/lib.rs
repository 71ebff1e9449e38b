//! Disposable inboxes on top of one shared IMAP mailbox.
//!
//! Every distinct `To` address in the mirrored folder is a virtual inbox. The crate keeps an
//! in-memory index of those inboxes in step with the server, fetching only mail it has not seen
//! yet, and purges mail once it is past the retention window, unless its inbox is locked or it
//! belongs to the demo inbox.
//!
//! # Usage
//!
//! The crate owns no timers: the caller polls, checks for pushed mail and purges whenever it
//! sees fit.
//!
//! ```no_run
//! use std::sync::Arc;
//! use catchbox::collab::{LogNotifier, NoLocks};
//! use catchbox::connection::ImapConnector;
//! use catchbox::{Config, ProcessingFacade};
//!
//! fn main() -> catchbox::Result<()> {
//!     let config = Config::load(Some("catchbox.toml".as_ref()))?;
//!     let facade = ProcessingFacade::from_config(
//!         &config,
//!         ImapConnector::new(config.imap.clone()),
//!         Arc::new(NoLocks),
//!         Arc::new(LogNotifier),
//!     );
//!
//!     // returns once connected; the initial load runs in the background
//!     let initial = facade.sync().connect_and_load_messages()?;
//!     initial.join().ok();
//!
//!     for mail in facade.inbox("someone@example.org") {
//!         println!("{} {}", mail.uid, mail.subject);
//!     }
//!     facade.run_purge_pass();
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod collab;
pub mod config;
pub mod connection;
pub mod error;
pub mod facade;
pub mod memory;
pub mod remote;
pub mod retention;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod types;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::facade::ProcessingFacade;
pub use crate::sync::{MailEvents, PassOutcome, SyncService};

#[cfg(test)]
mod mock_stream;
