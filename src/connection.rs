//! Connection management: one retrying connection to the remote mailbox, and the IMAP-backed
//! [`RemoteMailbox`].

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use imap::types::{Fetches, UnsolicitedResponse};
use imap::Session;
use native_tls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::{ImapConfig, Security};
use crate::error::{Error, Result};
use crate::remote::{uid_set, validate_str, RawHeader, RemoteMailbox};
use crate::types::Uid;

/// Number of connection attempts before giving up for good.
pub const MAX_CONNECT_ATTEMPTS: u32 = 5;

/// A transport an IMAP session can run over.
pub trait MailStream: Read + Write + Send {}

impl<T> MailStream for T where T: Read + Write + Send {}

/// Something that can open a fresh connection to the remote mailbox.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn RemoteMailbox>>;
}

impl<F> Connector for F
where
    F: Fn() -> Result<Arc<dyn RemoteMailbox>> + Send + Sync,
{
    fn connect(&self) -> Result<Arc<dyn RemoteMailbox>> {
        self()
    }
}

/// Drives a [`Connector`] with bounded retries and exponential backoff.
pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    max_attempts: u32,
    backoff: Duration,
}

impl ConnectionManager {
    /// `backoff` is the delay before the second attempt; it doubles for every further attempt.
    pub fn new<C>(connector: C, backoff: Duration) -> Self
    where
        C: Connector + 'static,
    {
        ConnectionManager {
            connector: Box::new(connector),
            max_attempts: MAX_CONNECT_ATTEMPTS,
            backoff,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Connect, retrying failed attempts. Running out of attempts is fatal.
    pub fn connect(&self) -> Result<Arc<dyn RemoteMailbox>> {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect() {
                Ok(mailbox) => {
                    info!(attempt, "connected to remote mailbox");
                    return Ok(mailbox);
                }
                Err(e) if attempt >= self.max_attempts => {
                    return Err(Error::ConnectRetriesExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, retry_in = ?delay, "connection attempt failed");
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }
}

/// Opens IMAP sessions as described by an [`ImapConfig`].
pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        ImapConnector { config }
    }

    // resolve the host and try every address in order, each bounded by the auth timeout
    fn open_tcp(&self) -> Result<TcpStream> {
        let timeout = self.config.auth_timeout();
        let addrs = (self.config.host.as_str(), self.config.port).to_socket_addrs()?;

        let mut last = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(tcp) => return Ok(tcp),
                Err(e) => {
                    debug!(%addr, error = %e, "could not connect");
                    last = Some(e);
                }
            }
        }
        Err(Error::Io(last.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        })))
    }

    /// Open, authenticate and select the configured folder.
    pub fn open(&self) -> Result<ImapMailbox<Box<dyn MailStream>>> {
        let host = self.config.host.as_str();
        let tcp = self.open_tcp()?;

        // the handshake and login are bounded by the auth timeout; `control` shares the socket
        // so the timeouts can be relaxed once the session is up
        let control = tcp.try_clone()?;
        control.set_read_timeout(Some(self.config.auth_timeout()))?;
        control.set_write_timeout(Some(self.config.auth_timeout()))?;

        let stream: Box<dyn MailStream> = match self.config.security {
            Security::Plain => Box::new(tcp),
            Security::Tls => Box::new(TlsConnector::new()?.connect(host, tcp)?),
            Security::StartTls => {
                let tcp = starttls(tcp)?;
                Box::new(TlsConnector::new()?.connect(host, tcp)?)
            }
        };

        let mut client = imap::Client::new(stream);
        if self.config.security != Security::StartTls {
            // with STARTTLS the greeting was consumed before the upgrade
            client.read_greeting()?;
        }
        let mut session = client
            .login(&self.config.user, &self.config.password)
            .map_err(|(e, _)| e)?;
        session.select(&self.config.folder)?;

        control.set_read_timeout(Some(self.config.command_timeout()))?;
        control.set_write_timeout(Some(self.config.command_timeout()))?;
        info!(
            host,
            folder = %self.config.folder,
            security = ?self.config.security,
            "mailbox selected"
        );
        Ok(ImapMailbox::new(session))
    }
}

impl Connector for ImapConnector {
    fn connect(&self) -> Result<Arc<dyn RemoteMailbox>> {
        Ok(Arc::new(self.open()?))
    }
}

// Read the greeting and negotiate STARTTLS, handing the stream back for the TLS handshake.
fn starttls<S: Read + Write>(stream: S) -> Result<S> {
    let mut client = imap::Client::new(stream);
    let greeting = client.read_greeting()?;
    // STARTTLS is only valid before authentication, which rules out PREAUTH
    if !greeting.starts_with(b"* OK") {
        return Err(Error::Rejected(format!(
            "cannot start TLS after greeting {:?}",
            String::from_utf8_lossy(&greeting).trim_end()
        )));
    }
    client.run_command_and_check_ok("STARTTLS")?;
    Ok(client.into_inner()?)
}

/// A [`RemoteMailbox`] over one IMAP session.
///
/// Every command goes through a single lock, so concurrent callers are served one at a time on
/// the one connection. Unsolicited `EXISTS`/`RECENT` responses that arrive with any command
/// are remembered as a push notification.
pub struct ImapMailbox<T: Read + Write> {
    session: Mutex<Session<T>>,
    push_pending: AtomicBool,
}

impl<T: Read + Write + Send> ImapMailbox<T> {
    /// Wrap a logged-in session that has its folder selected.
    pub fn new(session: Session<T>) -> Self {
        ImapMailbox {
            session: Mutex::new(session),
            push_pending: AtomicBool::new(false),
        }
    }

    fn with_session<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Session<T>) -> imap::error::Result<R>,
    {
        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let res = f(&mut session);
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            match response {
                UnsolicitedResponse::Exists(n) | UnsolicitedResponse::Recent(n) => {
                    debug!(n, "server announced mail");
                    self.push_pending.store(true, Ordering::SeqCst);
                }
                _ => {}
            }
        }
        Ok(res?)
    }
}

fn headers_of(fetches: &Fetches) -> Vec<RawHeader> {
    fetches
        .iter()
        .filter_map(|f| match (f.uid, f.header()) {
            (Some(uid), Some(bytes)) => Some(RawHeader {
                uid,
                bytes: bytes.to_vec(),
            }),
            _ => None,
        })
        .collect()
}

fn sorted_desc(uids: impl IntoIterator<Item = Uid>) -> Vec<Uid> {
    let mut uids: Vec<Uid> = uids.into_iter().collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    uids
}

impl<T: Read + Write + Send> RemoteMailbox for ImapMailbox<T> {
    fn undeleted_uids(&self) -> Result<Vec<Uid>> {
        self.with_session(|s| s.uid_search("UNDELETED"))
            .map(sorted_desc)
    }

    fn all_uids(&self) -> Result<Vec<Uid>> {
        self.with_session(|s| s.uid_search("ALL")).map(sorted_desc)
    }

    fn fetch_headers(&self, uids: &[Uid]) -> Result<Vec<RawHeader>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uid_set(uids);
        self.with_session(|s| {
            let fetches = s.uid_fetch(&set, "(UID BODY.PEEK[HEADER])")?;
            Ok(headers_of(&fetches))
        })
    }

    fn uid_addressed_to(&self, uid: Uid, address: &str) -> Result<bool> {
        let query = format!("UID {} TO {}", uid, validate_str(address)?);
        self.with_session(|s| s.uid_search(&query))
            .map(|found| found.contains(&uid))
    }

    fn fetch_message(&self, uid: Uid) -> Result<Option<Vec<u8>>> {
        self.with_session(|s| {
            let fetches = s.uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")?;
            let body = fetches
                .iter()
                .filter(|f| f.uid.map_or(true, |u| u == uid))
                .find_map(|f| f.body())
                .map(<[u8]>::to_vec);
            Ok(body)
        })
    }

    fn delete(&self, uids: &[Uid]) -> Result<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let set = uid_set(uids);
        self.with_session(|s| {
            s.uid_store(&set, "+FLAGS.SILENT (\\Deleted)")?;
            s.expunge()?;
            Ok(())
        })
    }

    fn take_push(&self) -> Result<bool> {
        self.with_session(|s| s.noop())?;
        Ok(self.push_pending.swap(false, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMailbox;
    use crate::mock_stream::MockStream;
    use std::sync::atomic::AtomicU32;

    fn mailbox(responses: &str) -> (ImapMailbox<MockStream>, Arc<Mutex<Vec<u8>>>) {
        let response = format!("a1 OK Logged in\r\n{}", responses);
        let stream = MockStream::new(response.into_bytes());
        let written = stream.written();
        let session = imap::Client::new(stream)
            .login("user", "pass")
            .map_err(|(e, _)| e)
            .unwrap();
        (ImapMailbox::new(session), written)
    }

    fn written_after_login(written: &Arc<Mutex<Vec<u8>>>) -> String {
        let bytes = written.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        text.splitn(2, "\r\n").nth(1).unwrap_or("").to_string()
    }

    #[test]
    fn undeleted_uids_newest_first() {
        let (mb, written) = mailbox("* SEARCH 3 9 4\r\na2 OK Search completed\r\n");
        assert_eq!(mb.undeleted_uids().unwrap(), vec![9, 4, 3]);
        assert_eq!(written_after_login(&written), "a2 UID SEARCH UNDELETED\r\n");
    }

    #[test]
    fn addressed_to_quotes_the_address() {
        let (mb, written) = mailbox("* SEARCH 5\r\na2 OK Search completed\r\n");
        assert!(mb.uid_addressed_to(5, "bob@x.com").unwrap());
        assert_eq!(
            written_after_login(&written),
            "a2 UID SEARCH UID 5 TO \"bob@x.com\"\r\n"
        );
    }

    #[test]
    fn addressed_to_rejects_injection() {
        let (mb, _) = mailbox("");
        assert!(matches!(
            mb.uid_addressed_to(5, "bob@x.com\r\na3 EXPUNGE"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn delete_flags_then_expunges() {
        let (mb, written) = mailbox("a2 OK Store completed\r\na3 OK Expunge completed\r\n");
        mb.delete(&[7, 5]).unwrap();
        assert_eq!(
            written_after_login(&written),
            "a2 UID STORE 7,5 +FLAGS.SILENT (\\Deleted)\r\na3 EXPUNGE\r\n"
        );
    }

    #[test]
    fn fetch_headers_reads_header_section() {
        let header = "To: someone@inbox.test\r\nSubject: hi\r\n\r\n";
        let (mb, written) = mailbox(&format!(
            "* 1 FETCH (UID 5 BODY[HEADER] {{{}}}\r\n{})\r\na2 OK Fetch completed\r\n",
            header.len(),
            header
        ));
        let headers = mb.fetch_headers(&[5]).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].uid, 5);
        assert_eq!(headers[0].bytes, header.as_bytes());
        assert_eq!(
            written_after_login(&written),
            "a2 UID FETCH 5 (UID BODY.PEEK[HEADER])\r\n"
        );
    }

    #[test]
    fn exists_marks_push_pending() {
        let (mb, _) = mailbox(
            "* 12 EXISTS\r\na2 OK NOOP completed\r\na3 OK NOOP completed\r\n",
        );
        assert!(mb.take_push().unwrap());
        assert!(!mb.take_push().unwrap());
    }

    #[test]
    fn lost_connection_is_a_fault() {
        let (mb, _) = mailbox("");
        let err = mb.undeleted_uids().unwrap_err();
        assert!(err.is_connection_fault(), "{:?}", err);
    }

    #[test]
    fn starttls_negotiates_through_the_client() {
        let stream = MockStream::new(
            b"* OK IMAP4rev1 ready\r\na1 OK Begin TLS negotiation now\r\n".to_vec(),
        );
        let written = stream.written();
        starttls(stream).unwrap();
        let sent = String::from_utf8(written.lock().unwrap().clone()).unwrap();
        assert_eq!(sent, "a1 STARTTLS\r\n");
    }

    #[test]
    fn starttls_refuses_preauth() {
        let stream = MockStream::new(b"* PREAUTH already logged in\r\n".to_vec());
        let written = stream.written();
        assert!(matches!(starttls(stream), Err(Error::Rejected(_))));
        assert!(written.lock().unwrap().is_empty());
    }

    #[test]
    fn starttls_refused_by_server() {
        let stream = MockStream::new(b"* OK ready\r\na1 BAD STARTTLS unavailable\r\n".to_vec());
        let err = starttls(stream).unwrap_err();
        assert!(matches!(err, Error::Imap(_)), "{:?}", err);
        assert!(!err.is_connection_fault());
    }

    #[test]
    fn broken_socket_during_starttls_is_a_fault() {
        let stream = MockStream::new(Vec::new()).with_err();
        let err = starttls(stream).unwrap_err();
        assert!(err.is_connection_fault(), "{:?}", err);
    }

    #[test]
    fn retries_until_connected() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let manager = ConnectionManager::new(
            move || -> Result<Arc<dyn RemoteMailbox>> {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Rejected("try again".to_string()))
                } else {
                    Ok(Arc::new(MemoryMailbox::new()))
                }
            },
            Duration::from_millis(0),
        );
        assert!(manager.connect().is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_five_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let manager = ConnectionManager::new(
            move || -> Result<Arc<dyn RemoteMailbox>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Rejected("bad credentials".to_string()))
            },
            Duration::from_millis(0),
        );
        match manager.connect() {
            Err(Error::ConnectRetriesExhausted { attempts: n, .. }) => assert_eq!(n, 5),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("connected without a server"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_CONNECT_ATTEMPTS);
    }
}
