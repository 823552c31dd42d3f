//! Sender provenance (spec.md §4.E): SPF and DKIM are two independent tracks
//! evaluated against the same message; a message is accepted if either track
//! passes.
//!
//! Grounded on the teacher's `handler/dns.rs::verify_spf`/`verify_dkim` (which
//! check the relay's own outbound DNS records) generalized to authenticating
//! a third-party sender's inbound mail, and on `dkim/mod.rs::PrivateKey` for
//! outbound signing.

pub mod dkim;
pub mod spf;

use crate::error::RelayError;

/// Combine the two tracks: pass if either SPF or DKIM passes, per spec.md's
/// dual-track provenance model. A transport error on either track (a DNS
/// hiccup mid-verification, not a definitive fail) is surfaced as transient
/// rather than folded into a permanent `ProvenanceFailed`, so the sender's
/// MTA retries instead of bouncing.
pub fn accept(spf: spf::SpfOutcome, dkim: dkim::DkimOutcome) -> Result<(), RelayError> {
    if spf.is_pass() || dkim.is_pass() {
        return Ok(());
    }

    if spf == spf::SpfOutcome::TempError {
        return Err(RelayError::TransientSpf(
            "SPF verification hit a transient DNS error".to_string(),
        ));
    }

    if dkim == dkim::DkimOutcome::TempError {
        return Err(RelayError::TransientDkim(
            "DKIM verification hit a transient DNS error".to_string(),
        ));
    }

    Err(RelayError::ProvenanceFailed)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auth::{dkim::DkimOutcome, spf::SpfOutcome};

    #[test]
    fn passes_when_spf_passes_even_if_dkim_fails() {
        assert!(accept(SpfOutcome::Pass, DkimOutcome::Fail).is_ok());
    }

    #[test]
    fn passes_when_dkim_passes_even_if_spf_fails() {
        assert!(accept(SpfOutcome::Fail, DkimOutcome::Pass).is_ok());
    }

    #[test]
    fn fails_permanently_when_neither_track_passes() {
        let err = accept(SpfOutcome::Fail, DkimOutcome::Fail).unwrap_err();
        assert!(matches!(err, RelayError::ProvenanceFailed));
    }

    #[test]
    fn spf_transport_error_is_transient_not_permanent() {
        let err = accept(SpfOutcome::TempError, DkimOutcome::Fail).unwrap_err();
        assert!(matches!(err, RelayError::TransientSpf(_)));
    }

    #[test]
    fn dkim_transport_error_is_transient_not_permanent() {
        let err = accept(SpfOutcome::Fail, DkimOutcome::TempError).unwrap_err();
        assert!(matches!(err, RelayError::TransientDkim(_)));
    }

    #[test]
    fn spf_pass_wins_even_when_dkim_hit_a_transport_error() {
        assert!(accept(SpfOutcome::Pass, DkimOutcome::TempError).is_ok());
    }
}
