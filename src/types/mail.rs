use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use serde::Serialize;

use super::{HeaderFields, Uid};

/// Result of looking up one full message for an inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "mail", rename_all = "snake_case")]
pub enum FetchOutcome {
    Found(FullMail),
    /// No message with that UID is addressed to the inbox. This is not an error.
    NotFound,
}

impl FetchOutcome {
    pub fn is_found(&self) -> bool {
        matches!(*self, FetchOutcome::Found(_))
    }
}

/// A full message as served to an inbox reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FullMail {
    Parsed(MailContent),
    /// The raw message source, as requested by the caller.
    Raw { uid: Uid, source: String },
    /// MIME parsing failed; the raw source is served as text instead.
    Unparsed {
        uid: Uid,
        source: String,
        error: String,
    },
}

/// The decoded parts of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailContent {
    pub uid: Uid,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// An attachment descriptor. Contents are not kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub size: usize,
}

impl FullMail {
    /// Build the reader's view of a raw message.
    ///
    /// With `raw` set the source is returned untouched. Otherwise the message is decoded; a
    /// message that fails to decode degrades to [`FullMail::Unparsed`].
    pub fn from_source(uid: Uid, source: &[u8], raw: bool) -> FullMail {
        if raw {
            return FullMail::Raw {
                uid,
                source: String::from_utf8_lossy(source).into_owned(),
            };
        }
        match mailparse::parse_mail(source) {
            Ok(parsed) => FullMail::Parsed(MailContent::from_parsed(uid, source, &parsed)),
            Err(e) => {
                tracing::warn!(uid, error = %e, "could not decode message, serving raw source");
                FullMail::Unparsed {
                    uid,
                    source: String::from_utf8_lossy(source).into_owned(),
                    error: e.to_string(),
                }
            }
        }
    }

    pub fn uid(&self) -> Uid {
        match *self {
            FullMail::Parsed(ref c) => c.uid,
            FullMail::Raw { uid, .. } | FullMail::Unparsed { uid, .. } => uid,
        }
    }
}

impl MailContent {
    fn from_parsed(uid: Uid, source: &[u8], parsed: &ParsedMail<'_>) -> MailContent {
        let header_len = mailparse::parse_headers(source)
            .map(|(_, len)| len)
            .unwrap_or(source.len());
        let fields = HeaderFields::parse(uid, &source[..header_len]);

        let mut content = MailContent {
            uid,
            from: fields.from,
            to: fields.to,
            subject: parsed.headers.get_first_value("Subject").unwrap_or(fields.subject),
            date: fields.date,
            text: None,
            html: None,
            attachments: Vec::new(),
        };
        content.collect_parts(parsed);
        content
    }

    fn collect_parts(&mut self, part: &ParsedMail<'_>) {
        if !part.subparts.is_empty() {
            for sub in &part.subparts {
                self.collect_parts(sub);
            }
            return;
        }

        let disposition = part.get_content_disposition();
        let mimetype = part.ctype.mimetype.to_ascii_lowercase();
        let is_attachment = matches!(disposition.disposition, DispositionType::Attachment)
            || (!mimetype.starts_with("text/") && mimetype != "message/rfc822");

        if !is_attachment {
            let slot = match mimetype.as_str() {
                "text/html" => &mut self.html,
                _ => &mut self.text,
            };
            if slot.is_none() {
                match part.get_body() {
                    Ok(body) => *slot = Some(body),
                    Err(e) => tracing::debug!(uid = self.uid, error = %e, "undecodable text part"),
                }
                return;
            }
        }

        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned();
        let size = part.get_body_raw().map(|b| b.len()).unwrap_or(0);
        self.attachments.push(Attachment {
            filename,
            content_type: mimetype,
            size,
        });
    }
}
