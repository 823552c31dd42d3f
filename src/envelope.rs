//! The relay's data model (spec.md §3): one inbound envelope plus its
//! resolved, deduplicated delivery targets.
//!
//! Grounded on `message.rs::Message`'s plain-struct shape (sender, recipient
//! list, raw bytes, timestamps), trimmed to what a stateless relay needs —
//! no persistence id, no delivery-attempt bookkeeping.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One SMTP session's envelope, built up across MAIL FROM / RCPT TO / DATA.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub session_id: Uuid,
    pub remote_ip: IpAddr,
    pub helo: String,
    pub mail_from: String,
    pub recipients: Vec<String>,
    /// Recipients after TXT-forwarding resolution, populated by RCPT TO
    /// handling alongside `recipients`; deduplicated by forwarding target
    /// only once the transaction completes, via `dedup_by_target`.
    pub resolved: Vec<ResolvedRecipient>,
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(session_id: Uuid, remote_ip: IpAddr, helo: String) -> Self {
        Self {
            session_id,
            remote_ip,
            helo,
            mail_from: String::new(),
            recipients: Vec::new(),
            resolved: Vec::new(),
            received_at: Utc::now(),
        }
    }

    /// Adds a recipient, rejecting a literal duplicate of the original
    /// address (spec.md §4.F: `RCPT TO` dedup happens before forwarding
    /// resolution, so `a@x` and `a+tag@x` are still distinct here).
    pub fn add_recipient(&mut self, address: String) -> bool {
        if self.recipients.contains(&address) {
            return false;
        }
        self.recipients.push(address);
        true
    }
}

/// One recipient after TXT-forwarding resolution, ready for outbound
/// delivery. `original` is kept for logging/bounce purposes even though
/// delivery only needs `forwarded_to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecipient {
    pub original: String,
    pub forwarded_to: String,
}

/// Deduplicate resolved recipients by their forwarding target so that two
/// original recipients forwarding to the same mailbox produce a single
/// outbound delivery attempt (spec.md §4.F).
pub fn dedup_by_target(recipients: Vec<ResolvedRecipient>) -> Vec<ResolvedRecipient> {
    let mut seen = std::collections::HashSet::new();
    recipients
        .into_iter()
        .filter(|r| seen.insert(r.forwarded_to.clone()))
        .collect()
}
