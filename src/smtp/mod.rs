//! SMTP front end (spec.md §4.I): the inbound session state machine, the
//! line/chunk transport loop around it, and the listener that ties the two
//! together with TLS.
//!
//! Grounded directly on the teacher's `smtp/session.rs`, `smtp/connection.rs`,
//! and `smtp/server.rs` — the AUTH PLAIN submission flow is dropped (this
//! relay receives mail from arbitrary internet MTAs, it does not accept
//! authenticated user submissions) and the PROXY protocol passthrough
//! (`smtp/proxy_protocol.rs`) is dropped with it, since nothing in this
//! relay's deployment model terminates PROXY protocol in front of it.

pub mod connection;
pub mod server;
pub mod session;

use std::sync::Arc;

use crate::{
    auth::{
        dkim::{DkimSigningKey, DkimVerifier},
        spf::SpfVerifier,
    },
    config::RelayConfig,
    delivery::DeliveryClient,
    disposable::DisposableDomains,
    dns::DnsResolver,
    forwarding::ForwardingResolver,
    ratelimit::RateLimiter,
};

/// Everything an `SmtpSession` needs, built once at startup and cheaply
/// cloned into every accepted connection.
#[derive(Clone)]
pub struct RelayServices {
    pub config: Arc<RelayConfig>,
    pub disposable: Arc<DisposableDomains>,
    pub rate_limiter: RateLimiter,
    pub forwarding: Arc<ForwardingResolver>,
    pub spf: Arc<SpfVerifier>,
    pub dkim_verifier: Arc<DkimVerifier>,
    pub dkim_signer: Option<Arc<DkimSigningKey>>,
    pub delivery: Arc<DeliveryClient>,
    /// Used directly by the session state machine for the sender-domain MX
    /// existence check on MAIL FROM (spec.md §4.I); recipient-domain MX/TXT
    /// lookups go through `forwarding` instead.
    pub dns: DnsResolver,
}
