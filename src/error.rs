//! Errors produced by the synchronization engine.

use std::io::Error as IoError;
use std::net::TcpStream;
use std::result;

use native_tls::Error as TlsError;
use native_tls::HandshakeError as TlsHandshakeError;
use thiserror::Error;

use crate::types::Uid;

/// A convenience wrapper around `Result` for `catchbox::Error`.
pub type Result<T> = result::Result<T, Error>;

/// A set of errors that can occur while mirroring the remote mailbox.
#[derive(Debug, Error)]
pub enum Error {
    /// An error reported by the IMAP client.
    #[error("IMAP error: {0}")]
    Imap(#[from] imap::Error),
    /// An `io::Error` that occurred while trying to read or write to a network stream.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),
    /// An error from the `native_tls` library while managing the socket.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    /// The TLS handshake with the server failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
    /// Every connection attempt failed.
    #[error("could not connect after {attempts} attempts: {source}")]
    ConnectRetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error of the last attempt.
        #[source]
        source: Box<Error>,
    },
    /// A purge failed after some of its batches had already been deleted.
    #[error("purge stopped after deleting {} messages: {source}", deleted.len())]
    PurgeIncomplete {
        /// UIDs deleted before the failure.
        deleted: Vec<Uid>,
        /// The error that stopped the purge.
        #[source]
        source: Box<Error>,
    },
    /// No connection to the remote mailbox exists yet.
    #[error("the mailbox is not connected yet")]
    NotReady,
    /// The connection faulted earlier and is not recovered in-process.
    #[error("the mailbox connection has faulted: {0}")]
    Faulted(String),
    /// The server refused a command without losing the connection.
    #[error("the server rejected the command: {0}")]
    Rejected(String),
    /// An IMAP argument contained a character that cannot be quoted.
    #[error("invalid character in IMAP argument: {0:?}")]
    InvalidArgument(char),
    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The configuration file could not be parsed.
    #[error("could not parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl From<TlsHandshakeError<TcpStream>> for Error {
    fn from(err: TlsHandshakeError<TcpStream>) -> Error {
        Error::TlsHandshake(err.to_string())
    }
}

impl Error {
    /// Whether this error means the underlying connection can no longer be used.
    ///
    /// Server refusals and validation failures leave the session intact; anything that broke
    /// the transport does not.
    pub fn is_connection_fault(&self) -> bool {
        match *self {
            Error::Imap(ref e) => matches!(e, imap::Error::Io(_) | imap::Error::ConnectionLost),
            Error::PurgeIncomplete { ref source, .. } => source.is_connection_fault(),
            Error::Io(_)
            | Error::Tls(_)
            | Error::TlsHandshake(_)
            | Error::ConnectRetriesExhausted { .. }
            | Error::Faulted(_) => true,
            _ => false,
        }
    }
}
