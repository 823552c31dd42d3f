//! Streaming, size-capped MIME handling (spec.md §4.G): extract the §3
//! "Parsed message" data model from the DATA payload, normalize the headers
//! a relay is expected to touch, and strip the hop-by-hop headers that must
//! not survive a retransmission.
//!
//! Grounded on `handler/mod.rs::handle_message`'s `MessageParser::default()`
//! usage and its Message-ID/Date backfill idiom, generalized from
//! "persisted message gets headers prepended before signing" to "in-flight
//! message gets headers normalized before forwarding". The headers map is a
//! line-based scanner in the same idiom as `strip_headers` below, run on
//! just the bytes seen so far so header extraction can start before the
//! body (and any attachments) have finished arriving (spec.md §5); body
//! text/HTML/attachments are only available once DATA ends, and are pulled
//! from `mail_parser::Message`'s confirmed `body_text`/`body_html`/
//! `attachment` accessors and its public `PartType` body enum.

use std::borrow::Cow::Borrowed;

use mail_parser::{HeaderName, MimeHeaders, Message, MessageParser, PartType};
use tracing::trace;

use crate::error::RelayError;

/// Headers stripped before relaying (spec.md §3): hop-by-hop routing
/// metadata and signatures from the inbound leg that must not survive onto
/// the outbound one. `content-type` is dropped because the outbound
/// library reconstructs it; `message-id` is dropped and backfilled fresh
/// below.
const STRIPPED_HEADERS: [&str; 8] = [
    "MIME-Version",
    "Content-Type",
    "DKIM-Signature",
    "X-Google-DKIM-Signature",
    "X-Gm-Message-State",
    "X-Google-Smtp-Source",
    "X-Received",
    "Message-ID",
];

/// Case-insensitive header map for everything not promoted to a typed field.
/// Values are kept verbatim, including any `; k=v` parameter list, so a
/// header like `Content-Type: text/plain; charset=utf-8` round-trips intact.
#[derive(Debug, Clone, Default)]
pub struct OtherHeaders(Vec<(String, String)>);

impl OtherHeaders {
    fn insert(&mut self, name: String, value: String) {
        self.0.push((name.to_ascii_lowercase(), value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.0
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// spec.md §3's "Parsed message" headers: the ten headers the relay cares
/// about promoted into typed fields, everything else preserved verbatim.
#[derive(Debug, Clone, Default)]
pub struct ParsedHeaders {
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub date: Option<String>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub reply_to: Option<String>,
    pub other: OtherHeaders,
}

impl ParsedHeaders {
    fn assign(&mut self, name: &str, value: String) {
        match name {
            "subject" => self.subject = Some(value),
            "from" => self.from = Some(value),
            "to" => self.to = Some(value),
            "cc" => self.cc = Some(value),
            "bcc" => self.bcc = Some(value),
            "date" => self.date = Some(value),
            "message-id" => self.message_id = Some(value),
            "in-reply-to" => self.in_reply_to = Some(value),
            "references" => self.references = Some(value),
            "reply-to" => self.reply_to = Some(value),
            other => self.other.insert(other.to_string(), value),
        }
    }
}

/// One attachment, fully buffered (spec.md §3: "a list of attachments, each
/// fully buffered with content-type, filename, and disposition").
#[derive(Debug, Clone)]
pub struct Attachment {
    pub content_type: Option<String>,
    pub filename: Option<String>,
    pub disposition: Option<String>,
    pub contents: Vec<u8>,
}

/// The full §3 "Parsed message": typed/verbatim headers, the text and HTML
/// body alternatives, and buffered attachments.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub headers: ParsedHeaders,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Scan just the header block (bytes up to the first blank line) of a
/// message that may still be arriving, promoting the spec's named headers
/// into typed fields and preserving the rest case-insensitively. Safe to
/// call before the body has finished streaming in — it never looks past the
/// header/body separator.
pub fn scan_headers(raw: &[u8]) -> ParsedHeaders {
    let text = String::from_utf8_lossy(raw);
    let header_block = text.split("\r\n\r\n").next().unwrap_or(&text);

    let mut headers = ParsedHeaders::default();
    let mut current: Option<(String, String)> = None;

    for line in header_block.split("\r\n") {
        let is_continuation = line.starts_with(' ') || line.starts_with('\t');
        if is_continuation {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }

        if let Some((name, value)) = current.take() {
            headers.assign(&name, value);
        }

        if let Some((name, value)) = line.split_once(':') {
            current = Some((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    if let Some((name, value)) = current.take() {
        headers.assign(&name, value);
    }

    headers
}

/// Extract the text/HTML bodies and attachments once the full message is
/// available. Grounded directly on `mail_parser::Message`'s own documented
/// API (`body_text`/`body_html`/`attachment`, and the `PartType`/
/// `MimeHeaders` shapes backing them).
pub fn parse_body(raw: &[u8]) -> ParsedMessage {
    let headers = scan_headers(raw);
    let parsed = parse(raw);

    let text_body = parsed.body_text(0).map(|c| c.into_owned());
    let html_body = parsed.body_html(0).map(|c| c.into_owned());

    let attachments = (0..parsed.attachments.len())
        .filter_map(|i| parsed.attachment(i))
        .map(|part| Attachment {
            content_type: part
                .content_type()
                .map(|ct| match ct.c_subtype.as_deref() {
                    Some(subtype) => format!("{}/{subtype}", ct.c_type),
                    None => ct.c_type.to_string(),
                }),
            filename: part.attachment_name().map(str::to_string),
            disposition: part
                .content_disposition()
                .map(|cd| cd.c_type.to_string()),
            contents: match &part.body {
                PartType::Binary(bytes) | PartType::InlineBinary(bytes) => bytes.to_vec(),
                PartType::Text(text) | PartType::Html(text) => text.as_bytes().to_vec(),
                PartType::Multipart(_) | PartType::Message(_) => Vec::new(),
            },
        })
        .collect();

    ParsedMessage {
        headers,
        text_body,
        html_body,
        attachments,
    }
}

pub fn parse(raw: &[u8]) -> Message<'_> {
    MessageParser::default()
        .parse(raw)
        .unwrap_or_else(|| Message {
            raw_message: Borrowed(raw),
            ..Default::default()
        })
}

fn has_header(message: &Message, name: HeaderName) -> bool {
    message
        .parts
        .first()
        .is_some_and(|part| part.headers.iter().any(|hdr| hdr.name == name))
}

/// Strip hop-by-hop headers and backfill `Message-ID`/`Date` if the sender
/// omitted them, returning the bytes ready for outbound delivery (DKIM
/// signing happens on top of this, in `auth::dkim`).
pub fn prepare_for_relay(raw: &[u8], message_id_host: &str) -> Vec<u8> {
    let stripped = strip_headers(raw, &STRIPPED_HEADERS);
    let parsed = parse(&stripped);

    let mut prepended = String::new();

    if !has_header(&parsed, HeaderName::MessageId) {
        let id = uuid::Uuid::new_v4();
        trace!("backfilling Message-ID header");
        prepended.push_str(&format!("Message-ID: <{id}@{message_id_host}>\r\n"));
    }

    if !has_header(&parsed, HeaderName::Date) {
        trace!("backfilling Date header");
        prepended.push_str(&format!("Date: {}\r\n", chrono::Utc::now().to_rfc2822()));
    }

    if prepended.is_empty() {
        stripped
    } else {
        let mut out = prepended.into_bytes();
        out.extend_from_slice(&stripped);
        out
    }
}

/// Remove the named headers (case-insensitive) from the raw message. Works
/// line-by-line ahead of MIME parsing since a stripped header may make an
/// otherwise-unparseable message parseable.
fn strip_headers(raw: &[u8], headers: &[&str]) -> Vec<u8> {
    let text = String::from_utf8_lossy(raw);
    let Some((header_block, body)) = text.split_once("\r\n\r\n") else {
        return raw.to_vec();
    };

    let mut out = String::with_capacity(header_block.len());
    let mut skipping = false;
    for line in header_block.split("\r\n") {
        let is_continuation = line.starts_with(' ') || line.starts_with('\t');
        if is_continuation {
            if skipping {
                continue;
            }
        } else {
            skipping = headers.iter().any(|h| {
                line.len() > h.len()
                    && line.as_bytes()[h.len()] == b':'
                    && line[..h.len()].eq_ignore_ascii_case(h)
            });
            if skipping {
                continue;
            }
        }
        out.push_str(line);
        out.push_str("\r\n");
    }

    out.push_str("\r\n");
    out.push_str(body);
    out.into_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strips_configured_headers() {
        let raw = b"Return-Path: <a@x.com>\r\nFrom: a@x.com\r\nMessage-ID: <old@x.com>\r\nDKIM-Signature: v=1;\r\n\tc=relaxed\r\nX-Received: by 1.2.3.4\r\n\r\nhello";
        let stripped = strip_headers(raw, &STRIPPED_HEADERS);
        let text = String::from_utf8(stripped).unwrap();
        assert!(!text.contains("Message-ID"));
        assert!(!text.contains("DKIM-Signature"));
        assert!(!text.contains("X-Received"));
        assert!(text.contains("Return-Path"));
        assert!(text.contains("From: a@x.com"));
        assert!(text.contains("hello"));
    }

    #[test]
    fn backfills_missing_message_id_and_date() {
        let raw = b"From: a@x.com\r\nTo: b@x.com\r\n\r\nhi";
        let prepared = prepare_for_relay(raw, "relay.example.com");
        let text = String::from_utf8(prepared).unwrap();
        assert!(text.contains("Message-ID: <"));
        assert!(text.contains("Date: "));
    }

    #[test]
    fn message_id_is_always_regenerated() {
        // the original message-id is in the stripped set — never forwarded.
        let raw = b"From: a@x.com\r\nMessage-ID: <existing@x.com>\r\nDate: Mon, 1 Jan 2024 00:00:00 +0000\r\n\r\nhi";
        let prepared = prepare_for_relay(raw, "relay.example.com");
        let text = String::from_utf8(prepared).unwrap();
        assert_eq!(text.matches("Message-ID:").count(), 1);
        assert!(!text.contains("existing@x.com"));
        assert_eq!(text.matches("Date:").count(), 1);
        assert!(text.contains("Mon, 1 Jan 2024"));
    }

    #[test]
    fn scan_headers_promotes_typed_fields_case_insensitively() {
        let raw = b"SUBJECT: hello\r\nFrom: a@x.com\r\nX-Custom: yes\r\n\r\nbody";
        let headers = scan_headers(raw);
        assert_eq!(headers.subject.as_deref(), Some("hello"));
        assert_eq!(headers.from.as_deref(), Some("a@x.com"));
        assert_eq!(headers.other.get("x-custom"), Some("yes"));
        assert_eq!(headers.other.get("X-CUSTOM"), Some("yes"));
    }

    #[test]
    fn scan_headers_joins_folded_continuation_lines() {
        let raw = b"Content-Type: text/plain;\r\n\tcharset=utf-8\r\n\r\nbody";
        let headers = scan_headers(raw);
        let content_type = headers.other.get("content-type").unwrap();
        assert!(content_type.contains("text/plain"));
        assert!(content_type.contains("charset=utf-8"));
    }

    #[test]
    fn scan_headers_stops_at_header_body_boundary() {
        // proves header extraction doesn't need the body at all — only the
        // bytes up to the blank line matter.
        let partial = b"Subject: still arriving\r\nFrom: a@x.com\r\n\r\n";
        let headers = scan_headers(partial);
        assert_eq!(headers.subject.as_deref(), Some("still arriving"));
    }

    #[test]
    fn parse_body_extracts_text_and_html_alternatives() {
        let raw = b"From: a@x.com\r\nTo: b@x.com\r\nSubject: hi\r\nContent-Type: multipart/alternative; boundary=b\r\n\r\n--b\r\nContent-Type: text/plain\r\n\r\nplain text\r\n--b\r\nContent-Type: text/html\r\n\r\n<p>html</p>\r\n--b--\r\n";
        let parsed = parse_body(raw);
        assert_eq!(parsed.text_body.as_deref(), Some("plain text\r\n"));
        assert!(parsed.html_body.unwrap().contains("<p>html</p>"));
    }

    #[test]
    fn parse_body_buffers_attachment_with_metadata() {
        let raw = b"From: a@x.com\r\nTo: b@x.com\r\nSubject: hi\r\nContent-Type: multipart/mixed; boundary=b\r\n\r\n--b\r\nContent-Type: text/plain\r\n\r\nsee attached\r\n--b\r\nContent-Type: text/plain; name=\"note.txt\"\r\nContent-Disposition: attachment; filename=\"note.txt\"\r\nContent-Transfer-Encoding: base64\r\n\r\naGVsbG8=\r\n--b--\r\n";
        let parsed = parse_body(raw);
        assert_eq!(parsed.attachments.len(), 1);
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.filename.as_deref(), Some("note.txt"));
        assert_eq!(attachment.disposition.as_deref(), Some("attachment"));
        assert_eq!(attachment.contents, b"hello");
    }
}
