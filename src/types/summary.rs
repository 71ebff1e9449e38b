use chrono::{DateTime, Utc};
use mailparse::MailHeaderMap;
use serde::Serialize;

use super::Uid;
use crate::address;

/// The header fields the index cares about, as parsed from a fetched message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFields {
    pub uid: Uid,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: String,
    /// `None` when the `Date` header is missing or unparsable.
    pub date: Option<DateTime<Utc>>,
}

impl HeaderFields {
    /// Parse the `From`, `To`, `Subject` and `Date` fields out of raw header bytes.
    ///
    /// Parsing is lenient: anything missing or malformed yields an empty value rather than an
    /// error, since a message with a broken header still has to be accounted for.
    pub fn parse(uid: Uid, raw: &[u8]) -> HeaderFields {
        let headers = match mailparse::parse_headers(raw) {
            Ok((headers, _)) => headers,
            Err(e) => {
                tracing::warn!(uid, error = %e, "could not parse message header");
                Vec::new()
            }
        };

        let to = headers
            .get_all_headers("To")
            .into_iter()
            .flat_map(address::from_header)
            .collect();
        let from = headers
            .get_first_header("From")
            .map(address::from_header)
            .unwrap_or_default();
        let subject = headers.get_first_value("Subject").unwrap_or_default();
        let date = headers
            .get_first_value("Date")
            .and_then(|d| mailparse::dateparse(&d).ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0));

        HeaderFields {
            uid,
            from,
            to,
            subject,
            date,
        }
    }

    /// Whether `address` (already normalized) is one of the `To` recipients.
    pub fn addressed_to(&self, address: &str) -> bool {
        self.to.iter().any(|a| a == address)
    }
}

/// What the index knows about a message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailSummary {
    pub uid: Uid,
    /// Lowercase recipient addresses, each one an inbox this message shows up in.
    pub to: Vec<String>,
    pub from: Vec<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
}

impl MailSummary {
    /// Build a summary from parsed header fields.
    ///
    /// Returns `None` for messages without a usable `To`, which are never indexed. A missing
    /// date falls back to `seen_at`, the time the message was ingested.
    pub fn from_header(fields: HeaderFields, seen_at: DateTime<Utc>) -> Option<MailSummary> {
        if fields.to.is_empty() {
            return None;
        }
        Some(MailSummary {
            uid: fields.uid,
            to: fields.to,
            from: fields.from,
            subject: fields.subject,
            date: fields.date.unwrap_or(seen_at),
        })
    }
}
