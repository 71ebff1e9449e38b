//! Fetching headers for many UIDs in bounded, concurrent chunks.

use std::collections::VecDeque;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use tracing::debug;

use crate::error::Result;
use crate::remote::RemoteMailbox;
use crate::types::{HeaderFields, Uid};

pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Splits work into chunks and runs at most `concurrency` chunk fetches at a time.
#[derive(Debug, Clone, Copy)]
pub struct FetchScheduler {
    chunk_size: usize,
    concurrency: usize,
}

impl Default for FetchScheduler {
    fn default() -> Self {
        FetchScheduler::new(DEFAULT_CHUNK_SIZE, DEFAULT_CONCURRENCY)
    }
}

impl FetchScheduler {
    pub fn new(chunk_size: usize, concurrency: usize) -> Self {
        FetchScheduler {
            chunk_size: chunk_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The server UIDs not yet known, newest first.
    pub fn pending<F>(server: &[Uid], is_known: F) -> Vec<Uid>
    where
        F: Fn(Uid) -> bool,
    {
        let mut pending: Vec<Uid> = server.iter().copied().filter(|&u| !is_known(u)).collect();
        pending.sort_unstable_by(|a, b| b.cmp(a));
        pending.dedup();
        pending
    }

    /// Fetch and parse the headers of `uids`.
    ///
    /// Chunks are handed to worker threads from a shared queue. The first failing chunk stops
    /// the workers from taking more work and its error is returned; results of chunks that
    /// completed are discarded with it. On success the headers come back ordered newest first,
    /// whatever order the chunks completed in.
    pub fn fetch_headers(
        &self,
        mailbox: &dyn RemoteMailbox,
        uids: &[Uid],
    ) -> Result<Vec<HeaderFields>> {
        let queue: VecDeque<(usize, &[Uid])> = uids.chunks(self.chunk_size).enumerate().collect();
        if queue.is_empty() {
            return Ok(Vec::new());
        }
        let workers = self.concurrency.min(queue.len());
        let queue = Mutex::new(queue);
        let failed = AtomicBool::new(false);

        let results: Vec<Result<Vec<HeaderFields>>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let queue = &queue;
                    let failed = &failed;
                    scope.spawn(move || {
                        let mut out = Vec::new();
                        while !failed.load(Ordering::SeqCst) {
                            let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                            let Some((index, chunk)) = next else {
                                break;
                            };
                            debug!(worker, chunk = index, size = chunk.len(), "fetching headers");
                            match mailbox.fetch_headers(chunk) {
                                Ok(headers) => out.extend(
                                    headers
                                        .into_iter()
                                        .map(|h| HeaderFields::parse(h.uid, &h.bytes)),
                                ),
                                Err(e) => {
                                    failed.store(true, Ordering::SeqCst);
                                    return Err(e);
                                }
                            }
                        }
                        Ok(out)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| panic::resume_unwind(e)))
                .collect()
        });

        let mut headers = Vec::with_capacity(uids.len());
        for result in results {
            headers.extend(result?);
        }
        headers.sort_unstable_by(|a, b| b.uid.cmp(&a.uid));
        Ok(headers)
    }
}
