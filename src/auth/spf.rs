//! SPF verification for an inbound sender (spec.md §4.E).
//!
//! The teacher only ever checks its *own* SPF record against an expected
//! `include:` clause (`handler/dns.rs::verify_spf`); here the same
//! `mail_auth` crate is pointed the other way, authenticating a remote
//! sender's claimed identity against the IP the connection actually came
//! from.

use std::net::IpAddr;

use mail_auth::{MessageAuthenticator, SpfResult, spf::SpfParameters};
use tracing::trace;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfOutcome {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl SpfOutcome {
    pub fn is_pass(self) -> bool {
        matches!(self, SpfOutcome::Pass)
    }
}

impl From<SpfResult> for SpfOutcome {
    fn from(result: SpfResult) -> Self {
        match result {
            SpfResult::Pass => SpfOutcome::Pass,
            SpfResult::Fail => SpfOutcome::Fail,
            SpfResult::SoftFail => SpfOutcome::SoftFail,
            SpfResult::Neutral => SpfOutcome::Neutral,
            SpfResult::None => SpfOutcome::None,
            SpfResult::TempError => SpfOutcome::TempError,
            SpfResult::PermError => SpfOutcome::PermError,
        }
    }
}

pub struct SpfVerifier {
    authenticator: MessageAuthenticator,
    #[cfg(test)]
    forced: Option<SpfOutcome>,
}

impl SpfVerifier {
    pub fn new() -> Result<Self, RelayError> {
        let authenticator = MessageAuthenticator::new_cloudflare_tls()
            .map_err(|e| RelayError::TransientSpf(format!("failed to build SPF resolver: {e}")))?;
        Ok(Self {
            authenticator,
            #[cfg(test)]
            forced: None,
        })
    }

    /// A verifier that always reports `outcome`, without touching the
    /// network — for driving the session state machine end-to-end in tests.
    #[cfg(test)]
    pub fn mock(outcome: SpfOutcome) -> Self {
        let authenticator = MessageAuthenticator::new_cloudflare_tls()
            .expect("building a resolver-backed authenticator needs no network access");
        Self {
            authenticator,
            forced: Some(outcome),
        }
    }

    /// Evaluate SPF for a connection, given the client's source IP, its HELO
    /// name, and the MAIL FROM domain.
    pub async fn verify(&self, ip: IpAddr, helo: &str, mail_from_domain: &str) -> SpfOutcome {
        #[cfg(test)]
        if let Some(outcome) = self.forced {
            return outcome;
        }

        let parameters = SpfParameters::verify_mail_from(ip, helo, mail_from_domain);
        let output = self.authenticator.verify_spf(parameters).await;
        trace!(?ip, helo, mail_from_domain, result = ?output.result(), "spf verification");
        SpfOutcome::from(output.result())
    }
}
