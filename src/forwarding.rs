//! TXT forwarding resolver (spec.md §4.D): parse `forward-email=` TXT records
//! and compute the forwarded envelope address for one recipient.
//!
//! The comma-split/prefix-match idiom is grounded on
//! `handler/dns.rs::get_singular_dns_record` (filtering `txt_lookup` results
//! by a string prefix); the forwarding-table semantics themselves are new to
//! this spec.

use crate::{address, disposable::DisposableDomains, dns::DnsResolver, error::RelayError};

const PREFIX: &str = "forward-email=";

enum Entry {
    Wildcard(String),
    PerUser { local: String, target: String },
}

pub struct ForwardingResolver {
    dns: DnsResolver,
}

impl ForwardingResolver {
    pub fn new(dns: DnsResolver) -> Self {
        Self { dns }
    }

    /// Resolve `recipient` (an original RCPT TO address) to its forwarding
    /// address, preserving any plus-tag. Per spec.md §9's recommendation,
    /// per-user entries always take precedence over a wildcard entry
    /// regardless of which appears first in the TXT record — resolution is
    /// therefore independent of record ordering.
    ///
    /// Also enforces spec.md §4.I's RCPT TO admission rule: the recipient
    /// domain's MX set must include every one of `required_exchanges`, or
    /// the domain hasn't delegated mail to this relay and the recipient is
    /// rejected with `InvalidMx`.
    pub async fn resolve(
        &self,
        recipient: &str,
        disposable: &DisposableDomains,
        required_exchanges: &[String],
    ) -> Result<String, RelayError> {
        let domain = address::parse_domain(recipient, disposable)?;

        let mxs = self.dns.resolve_mx(domain).await?;
        if !crate::dns::exchanges_present(&mxs, required_exchanges) {
            return Err(RelayError::InvalidMx(format!(
                "Missing required DNS MX records: {}",
                required_exchanges.join(", ")
            )));
        }

        let records = self.dns.resolve_txt(domain).await?;

        let forwarding_record = records
            .iter()
            .find_map(|record| record.strip_prefix(PREFIX))
            .ok_or_else(|| {
                RelayError::InvalidTxt(format!("no forward-email TXT record for {domain}"))
            })?;

        let entries = parse_entries(forwarding_record)?;

        let local = address::parse_local(recipient);
        let target = entries
            .iter()
            .find_map(|entry| match entry {
                Entry::PerUser { local: l, target } if l == local => Some(target.as_str()),
                _ => None,
            })
            .or_else(|| {
                entries.iter().find_map(|entry| match entry {
                    Entry::Wildcard(target) => Some(target.as_str()),
                    _ => None,
                })
            })
            .ok_or_else(|| {
                RelayError::InvalidTxt(format!(
                    "no matching forward-email entry for {recipient}"
                ))
            })?;

        Ok(apply_plus_tag(recipient, target)?)
    }
}

fn parse_entries(record: &str) -> Result<Vec<Entry>, RelayError> {
    let raw_entries: Vec<&str> = record.split(',').map(str::trim).collect();
    if raw_entries.is_empty() || raw_entries.iter().all(|e| e.is_empty()) {
        return Err(RelayError::InvalidTxt(
            "forward-email record has no entries".to_string(),
        ));
    }

    let mut entries = Vec::with_capacity(raw_entries.len());
    for raw in raw_entries {
        if raw.is_empty() {
            continue;
        }

        match raw.split_once(':') {
            None => {
                if !address::is_valid_email(raw) || address::split_domain(raw).is_none() {
                    return Err(RelayError::InvalidTxt(format!(
                        "invalid forward-email wildcard entry: {raw}"
                    )));
                }
                entries.push(Entry::Wildcard(raw.to_string()));
            }
            Some((local, target)) => {
                if local.is_empty() || !address::is_valid_email(target) {
                    return Err(RelayError::InvalidTxt(format!(
                        "invalid forward-email entry: {raw}"
                    )));
                }
                entries.push(Entry::PerUser {
                    local: local.to_string(),
                    target: target.to_string(),
                });
            }
        }
    }

    Ok(entries)
}

/// The forwarding target's domain is outside our jurisdiction — it is
/// whatever the TXT record says, not something we police for FQDN-ness or
/// disposability. Use `split_domain`, matching `address.rs`'s documented
/// intent for forwarding targets.
fn apply_plus_tag(recipient: &str, target: &str) -> Result<String, RelayError> {
    let filter = address::parse_filter(recipient);
    if filter.is_empty() {
        return Ok(target.to_string());
    }

    let target_local = address::parse_local(target);
    let target_domain = address::split_domain(target)
        .ok_or_else(|| RelayError::InvalidDomain(format!("{target} has no domain")))?;
    Ok(format!("{target_local}+{filter}@{target_domain}"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dns::DnsResolver;

    fn disposable() -> DisposableDomains {
        DisposableDomains::load(None)
    }

    fn exchanges() -> Vec<String> {
        vec!["mx1.forwardemail.net".to_string(), "mx2.forwardemail.net".to_string()]
    }

    fn resolver_for(domain: &str, txt: &str) -> ForwardingResolver {
        let dns = DnsResolver::mock()
            .with_mx(domain, &[("mx1.forwardemail.net", 10), ("mx2.forwardemail.net", 20)])
            .with_txt(domain, &[txt])
            .build();
        ForwardingResolver::new(dns)
    }

    #[tokio::test]
    async fn wildcard_redirect_preserves_plus_tag() {
        let resolver = resolver_for(
            "niftylettuce.com",
            "forward-email=niftylettuce@gmail.com",
        );

        let resolved = resolver
            .resolve("hello+test@niftylettuce.com", &disposable(), &exchanges())
            .await
            .unwrap();

        assert_eq!(resolved, "niftylettuce+test@gmail.com");
    }

    #[tokio::test]
    async fn plus_tag_redirect_is_consistent_regardless_of_whether_sender_tagged() {
        // the forwarding target is the same whether or not the recipient
        // used a plus-tag — applying a tag must never change whether the
        // target's domain is accepted.
        let resolver = resolver_for("niftylettuce.com", "forward-email=niftylettuce@mailinator.com");

        let untagged = resolver
            .resolve("hello@niftylettuce.com", &disposable(), &exchanges())
            .await
            .unwrap();
        let tagged = resolver
            .resolve("hello+invoice@niftylettuce.com", &disposable(), &exchanges())
            .await
            .unwrap();

        assert_eq!(untagged, "niftylettuce@mailinator.com");
        assert_eq!(tagged, "niftylettuce+invoice@mailinator.com");
    }

    #[tokio::test]
    async fn per_user_redirect_with_fallthrough() {
        let resolver = resolver_for(
            "niftylettuce.com",
            "forward-email=hello:a@gmail.com, support:b@gmail.com",
        );
        let disposable = disposable();

        assert_eq!(
            resolver
                .resolve("hello@niftylettuce.com", &disposable, &exchanges())
                .await
                .unwrap(),
            "a@gmail.com"
        );
        assert_eq!(
            resolver
                .resolve("support@niftylettuce.com", &disposable, &exchanges())
                .await
                .unwrap(),
            "b@gmail.com"
        );

        let err = resolver
            .resolve("other@niftylettuce.com", &disposable, &exchanges())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidTxt(_)));
    }

    #[tokio::test]
    async fn per_user_wins_over_wildcard_regardless_of_order() {
        // wildcard appears first in the record, but the per-user entry for
        // "hello" must still win.
        let resolver = resolver_for(
            "niftylettuce.com",
            "forward-email=fallback@gmail.com, hello:specific@gmail.com",
        );

        let resolved = resolver
            .resolve("hello@niftylettuce.com", &disposable(), &exchanges())
            .await
            .unwrap();

        assert_eq!(resolved, "specific@gmail.com");
    }

    #[tokio::test]
    async fn idempotent_resolution() {
        let resolver = resolver_for(
            "niftylettuce.com",
            "forward-email=niftylettuce@gmail.com",
        );
        let disposable = disposable();

        let first = resolver
            .resolve("hello+a@niftylettuce.com", &disposable, &exchanges())
            .await
            .unwrap();
        let second = resolver
            .resolve("hello+a@niftylettuce.com", &disposable, &exchanges())
            .await
            .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn rejects_domain_missing_a_required_exchange() {
        let dns = DnsResolver::mock()
            .with_mx("elsewhere.com", &[("mx1.forwardemail.net", 10)])
            .with_txt("elsewhere.com", &["forward-email=a@gmail.com"])
            .build();
        let resolver = ForwardingResolver::new(dns);

        let err = resolver
            .resolve("hello@elsewhere.com", &disposable(), &exchanges())
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::InvalidMx(_)));
    }
}
