use std::borrow::Cow;

use thiserror::Error;

/// Every typed error a component can raise. The session state machine
/// (`smtp::session`) is the single place these get turned into wire replies;
/// nothing downstream of a component call is allowed to swallow one.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0} does not resolve to a FQDN")]
    BadClientHostname(String),

    #[error("{0}")]
    InvalidDomain(String),

    #[error("{0}")]
    InvalidTxt(String),

    #[error("{0}")]
    InvalidMx(String),

    #[error("rate limited, retry in {0}")]
    RateLimited(String),

    #[error("message too large")]
    MessageTooLarge,

    #[error("No passing DKIM signature found")]
    ProvenanceFailed,

    #[error("DNS transport error: {0}")]
    TransientDns(String),

    #[error("SPF verifier transport error: {0}")]
    TransientSpf(String),

    #[error("DKIM verifier transport error: {0}")]
    TransientDkim(String),

    #[error("downstream SMTP error {code}: {message}")]
    DownstreamSmtp { code: u16, message: String },
}

impl RelayError {
    /// The reply code and human-readable line for this error, per spec §7.
    pub fn reply(&self) -> (u16, Cow<'_, str>) {
        match self {
            RelayError::BadClientHostname(msg) => (550, Cow::Owned(msg.clone())),
            RelayError::InvalidDomain(msg) => (550, Cow::Borrowed(msg)),
            RelayError::InvalidTxt(msg) => (550, Cow::Borrowed(msg)),
            RelayError::InvalidMx(msg) => (550, Cow::Borrowed(msg)),
            RelayError::RateLimited(hint) => {
                (451, Cow::Owned(format!("retry in {hint}")))
            }
            RelayError::MessageTooLarge => (450, Cow::Borrowed("message too large")),
            RelayError::ProvenanceFailed => {
                (550, Cow::Borrowed("No passing DKIM signature found"))
            }
            RelayError::TransientDns(msg) => (421, Cow::Owned(msg.clone())),
            RelayError::TransientSpf(msg) => (421, Cow::Owned(msg.clone())),
            RelayError::TransientDkim(msg) => (421, Cow::Owned(msg.clone())),
            RelayError::DownstreamSmtp { code, message } => {
                (*code, Cow::Borrowed(message.as_str()))
            }
        }
    }

    /// Whether this error's reply code is a permanent (5xx) failure.
    pub fn is_fatal(&self) -> bool {
        self.reply().0 >= 500
    }
}
