//! DKIM verification of inbound mail and signing of outbound mail
//! (spec.md §4.E, §4.G).
//!
//! `DkimSigner` is adapted directly from the teacher's `dkim/mod.rs::PrivateKey`
//! (same signed-header set, same `mail_auth::dkim::DkimSigner` builder), with
//! the key now loaded from the relay's configured PEM file instead of a
//! hardcoded `dkim_key.pem` fixture. `DkimVerifier` is new: the teacher never
//! authenticates someone else's signature, only its own record's public key.

use mail_auth::{
    MessageAuthenticator,
    common::{
        crypto::{RsaKey, Sha256},
        headers::HeaderWriter,
    },
    dkim::DkimSigner,
};

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DkimOutcome {
    Pass,
    Fail,
    Neutral,
    PermError,
    TempError,
    None,
}

impl DkimOutcome {
    pub fn is_pass(self) -> bool {
        matches!(self, DkimOutcome::Pass)
    }
}

pub struct DkimVerifier {
    authenticator: MessageAuthenticator,
    #[cfg(test)]
    forced: Option<DkimOutcome>,
}

impl DkimVerifier {
    pub fn new() -> Result<Self, RelayError> {
        let authenticator = MessageAuthenticator::new_cloudflare_tls().map_err(|e| {
            RelayError::TransientDkim(format!("failed to build DKIM resolver: {e}"))
        })?;
        Ok(Self {
            authenticator,
            #[cfg(test)]
            forced: None,
        })
    }

    /// A verifier that always reports `outcome`, without touching the
    /// network — for driving the session state machine end-to-end in tests.
    #[cfg(test)]
    pub fn mock(outcome: DkimOutcome) -> Self {
        let authenticator = MessageAuthenticator::new_cloudflare_tls()
            .expect("building a resolver-backed authenticator needs no network access");
        Self {
            authenticator,
            forced: Some(outcome),
        }
    }

    /// Verify every DKIM-Signature header on the raw message bytes. Passes if
    /// at least one signature verifies; an unsigned message yields `None`,
    /// which the caller treats as a non-pass (the SPF track may still carry
    /// the message through spec.md's dual-track provenance). A transport
    /// error while resolving a signer's public key yields `TempError`,
    /// distinct from a signature that was checked and found invalid.
    pub async fn verify(&self, raw_message: &[u8]) -> DkimOutcome {
        #[cfg(test)]
        if let Some(outcome) = self.forced {
            return outcome;
        }

        let Some(auth_message) = mail_auth::AuthenticatedMessage::parse(raw_message) else {
            return DkimOutcome::None;
        };

        let outputs = self.authenticator.verify_dkim(&auth_message).await;
        if outputs.is_empty() {
            return DkimOutcome::None;
        }

        if outputs.iter().any(|o| o.result() == &mail_auth::DkimResult::Pass) {
            return DkimOutcome::Pass;
        }

        if outputs
            .iter()
            .any(|o| matches!(o.result(), mail_auth::DkimResult::TempError(_)))
        {
            return DkimOutcome::TempError;
        }

        if outputs
            .iter()
            .any(|o| matches!(o.result(), mail_auth::DkimResult::PermError(_)))
        {
            return DkimOutcome::PermError;
        }

        if outputs
            .iter()
            .all(|o| matches!(o.result(), mail_auth::DkimResult::Neutral(_)))
        {
            return DkimOutcome::Neutral;
        }

        DkimOutcome::Fail
    }
}

const SIGNED_HEADERS: [&str; 26] = [
    "From",
    "Subject",
    "Date",
    "Message-ID",
    "To",
    "Cc",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "Content-ID",
    "Content-Description",
    "Resent-Date",
    "Resent-From",
    "Resent-Sender",
    "Resent-To",
    "Resent-Cc",
    "Resent-Message-ID",
    "In-Reply-To",
    "References",
    "List-Id",
    "List-Help",
    "List-Unsubscribe",
    "List-Subscribe",
    "List-Post",
    "List-Owner",
    "List-Archive",
];

pub struct DkimSigningKey {
    domain: String,
    selector: String,
    sign_key: RsaKey<Sha256>,
}

impl DkimSigningKey {
    pub fn from_pem_file(
        domain: impl Into<String>,
        selector: impl Into<String>,
        pem_path: &std::path::Path,
    ) -> Result<Self, RelayError> {
        let pem = std::fs::read_to_string(pem_path).map_err(|e| {
            RelayError::TransientDkim(format!(
                "could not read DKIM private key {}: {e}",
                pem_path.display()
            ))
        })?;
        let sign_key = RsaKey::<Sha256>::from_pkcs8_pem(&pem).map_err(|e| {
            RelayError::TransientDkim(format!("could not parse DKIM private key: {e}"))
        })?;

        Ok(Self {
            domain: domain.into(),
            selector: selector.into(),
            sign_key,
        })
    }

    /// Produce the `DKIM-Signature:` header to prepend to the outbound
    /// message.
    pub fn sign_header(&self, msg: &mail_parser::Message) -> Result<String, RelayError> {
        let signer = DkimSigner::from_key(self.sign_key.clone())
            .domain(&self.domain)
            .selector(&self.selector)
            .headers(SIGNED_HEADERS);

        signer
            .sign(&msg.raw_message)
            .map(|sig| sig.to_header())
            .map_err(|e| RelayError::TransientDkim(format!("failed to sign message: {e}")))
    }
}
