//! DNS resolver facade (spec.md §4.B): typed MX and TXT lookups with error
//! classification.
//!
//! Grounded on `handler/dns.rs`'s `DnsResolver` (a thin wrapper around
//! `hickory_resolver::Resolver` with a `#[cfg(test)]` mock swap-in) and
//! `handler/mock.rs`'s minimal resolver stand-in, generalized from "look up
//! our own DKIM/SPF/A records" to "resolve a recipient's MX set and TXT
//! records for forwarding".

#[cfg(not(test))]
use hickory_resolver::{
    Resolver,
    config::{LookupIpStrategy::Ipv4Only, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use tracing::{debug, trace};

use crate::error::RelayError;

/// One MX record, in sorted-ascending-by-priority order once returned from
/// `resolve_mx`. `port` is always 25 outside of tests — hickory's MX records
/// carry no port — but the mock resolver can override it so integration
/// tests can point delivery at a local catcher process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailExchanger {
    pub exchange: String,
    pub priority: u16,
    pub port: u16,
}

#[derive(Clone)]
pub struct DnsResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    resolver: mock::MockResolver,
}

#[cfg(not(test))]
impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResolver {
    #[cfg(not(test))]
    pub fn new() -> Self {
        let mut options = ResolverOpts::default();
        options.ip_strategy = Ipv4Only;
        options.negative_max_ttl = Some(std::time::Duration::from_secs(20));
        options.attempts = 4;

        Self {
            resolver: Resolver::builder_with_config(
                ResolverConfig::cloudflare(),
                TokioConnectionProvider::default(),
            )
            .with_options(options)
            .build(),
        }
    }

    #[cfg(test)]
    pub fn mock() -> mock::MockResolverBuilder {
        mock::MockResolverBuilder::default()
    }

    /// Non-empty list of `{exchange, priority}` sorted ascending by priority.
    /// Empty result or NXDOMAIN maps to `InvalidMx(550)`; transport failure
    /// maps to `TransientDns(421)`.
    pub async fn resolve_mx(&self, domain: &str) -> Result<Vec<MailExchanger>, RelayError> {
        let fqdn = fqdn(domain);
        trace!("resolving MX for {fqdn}");

        let lookup = self.resolver.mx_lookup(&fqdn).await.map_err(|e| {
            if e.is_no_records_found() {
                RelayError::InvalidMx(format!("no MX records for {domain}"))
            } else {
                RelayError::TransientDns(format!("could not resolve MX for {domain}: {e}"))
            }
        })?;

        let mut exchanges: Vec<MailExchanger> = lookup
            .iter()
            .map(|mx| MailExchanger {
                exchange: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                priority: mx.preference(),
                port: 25,
            })
            .collect();

        #[cfg(test)]
        for (exchange, mx) in exchanges.iter_mut().zip(lookup.iter()) {
            exchange.port = mx.port();
        }

        if exchanges.is_empty() {
            return Err(RelayError::InvalidMx(format!(
                "no MX records for {domain}"
            )));
        }

        exchanges.sort_by_key(|mx| mx.priority);
        debug!("resolved {} MX record(s) for {domain}", exchanges.len());
        Ok(exchanges)
    }

    /// TXT records for `domain`, with multi-chunk records joined in order.
    /// Missing record maps to `InvalidTxt(550)`.
    pub async fn resolve_txt(&self, domain: &str) -> Result<Vec<String>, RelayError> {
        let fqdn = fqdn(domain);
        trace!("resolving TXT for {fqdn}");

        let lookup = self.resolver.txt_lookup(&fqdn).await.map_err(|e| {
            if e.is_no_records_found() {
                RelayError::InvalidTxt(format!("no TXT records for {domain}"))
            } else {
                RelayError::TransientDns(format!("could not resolve TXT for {domain}: {e}"))
            }
        })?;

        let records: Vec<String> = lookup
            .iter()
            .map(|record| {
                record
                    .txt_data()
                    .iter()
                    .flat_map(|chunk| chunk.iter().copied())
                    .collect::<Vec<u8>>()
            })
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .collect();

        if records.is_empty() {
            return Err(RelayError::InvalidTxt(format!(
                "no TXT records for {domain}"
            )));
        }

        Ok(records)
    }
}

/// Whether every `required` exchange name appears among the resolved MX
/// set, per spec.md §4.I's RCPT TO check ("MX of domain(addr) must include
/// every configured relay exchange name"). Comparison is case-insensitive
/// and ignores a trailing dot on either side.
pub fn exchanges_present(mxs: &[MailExchanger], required: &[String]) -> bool {
    required.iter().all(|want| {
        let want = want.trim_end_matches('.');
        mxs.iter()
            .any(|mx| mx.exchange.trim_end_matches('.').eq_ignore_ascii_case(want))
    })
}

fn fqdn(domain: &str) -> String {
    // hickory-resolver: queries ending with '.' are fully-qualified and
    // cheaper to resolve (no search-suffix probing).
    format!("{domain}{}", if domain.ends_with('.') { "" } else { "." })
}

#[cfg(test)]
pub mod mock {
    //! A minimal mock-up for hickory_resolver, grounded on `handler/mock.rs`.

    use std::collections::HashMap;

    use super::DnsResolver;

    #[derive(Debug, thiserror::Error)]
    #[error("mock DNS error: {0}")]
    pub struct MockDnsError(pub String);

    impl MockDnsError {
        pub fn is_no_records_found(&self) -> bool {
            self.0 == "NXDOMAIN"
        }
    }

    #[derive(Clone, Default)]
    pub struct MockResolver {
        mx: HashMap<String, Vec<(String, u16, u16)>>,
        txt: HashMap<String, Vec<String>>,
    }

    impl MockResolver {
        pub async fn mx_lookup(&self, domain: &str) -> Result<MxResult, MockDnsError> {
            let domain = domain.trim_end_matches('.');
            match self.mx.get(domain) {
                Some(records) => Ok(MxResult(records.clone())),
                None => Err(MockDnsError("NXDOMAIN".into())),
            }
        }

        pub async fn txt_lookup(&self, domain: &str) -> Result<TxtResult, MockDnsError> {
            let domain = domain.trim_end_matches('.');
            match self.txt.get(domain) {
                Some(chunks) => Ok(TxtResult(chunks.clone())),
                None => Err(MockDnsError("NXDOMAIN".into())),
            }
        }
    }

    pub struct MxResult(Vec<(String, u16, u16)>);

    impl MxResult {
        pub fn iter(&self) -> impl Iterator<Item = MxRecord<'_>> {
            self.0.iter().map(|(exchange, priority, port)| MxRecord {
                exchange,
                priority: *priority,
                port: *port,
            })
        }
    }

    pub struct MxRecord<'a> {
        exchange: &'a str,
        priority: u16,
        port: u16,
    }

    impl MxRecord<'_> {
        pub fn exchange(&self) -> MxExchange<'_> {
            MxExchange(self.exchange)
        }

        pub fn preference(&self) -> u16 {
            self.priority
        }

        /// Mock-only: the port `DeliveryClient` should dial instead of 25,
        /// so integration tests can point delivery at a local catcher.
        pub fn port(&self) -> u16 {
            self.port
        }
    }

    pub struct MxExchange<'a>(&'a str);

    impl MxExchange<'_> {
        pub fn to_utf8(&self) -> String {
            format!("{}.", self.0)
        }
    }

    /// A TXT record may be chunked; each element of `TxtResult` is one
    /// DNS-level record, and each record's `txt_data()` yields its chunks.
    pub struct TxtResult(Vec<String>);

    impl TxtResult {
        pub fn iter(&self) -> impl Iterator<Item = TxtRecord<'_>> {
            self.0.iter().map(|s| TxtRecord(s))
        }
    }

    pub struct TxtRecord<'a>(&'a str);

    impl TxtRecord<'_> {
        pub fn txt_data(&self) -> Vec<Vec<u8>> {
            vec![self.0.as_bytes().to_vec()]
        }
    }

    #[derive(Default)]
    pub struct MockResolverBuilder {
        resolver: MockResolver,
    }

    impl MockResolverBuilder {
        pub fn with_mx(mut self, domain: &str, records: &[(&str, u16)]) -> Self {
            self.resolver.mx.insert(
                domain.to_string(),
                records
                    .iter()
                    .map(|(ex, prio)| (ex.to_string(), *prio, 25))
                    .collect(),
            );
            self
        }

        /// Like `with_mx`, but the single MX entry dials `port` instead of
        /// 25 — grounded on the teacher's `DnsResolver::mock(domain, port)`
        /// used to redirect outbound delivery at a local mailcrab instance.
        pub fn with_mx_port(mut self, domain: &str, exchange: &str, priority: u16, port: u16) -> Self {
            self.resolver
                .mx
                .insert(domain.to_string(), vec![(exchange.to_string(), priority, port)]);
            self
        }

        pub fn with_txt(mut self, domain: &str, records: &[&str]) -> Self {
            self.resolver.txt.insert(
                domain.to_string(),
                records.iter().map(|s| s.to_string()).collect(),
            );
            self
        }

        pub fn build(self) -> DnsResolver {
            DnsResolver {
                resolver: self.resolver,
            }
        }
    }
}
