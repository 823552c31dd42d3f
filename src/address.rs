//! RFC 5322 address splitting: local-part, plus-tag filter, and FQDN domain.
//!
//! Grounded on the teacher's `EmailAddress` parsing idiom
//! (`smtp/session.rs`: `from.address.parse::<EmailAddress>()`) and its
//! domain-shape checks (`handler/mod.rs::is_valid_domain`), extended with
//! FQDN-ness and the disposable-domain check spec.md §4.A requires.

use email_address::EmailAddress;

use crate::disposable::DisposableDomains;
use crate::error::RelayError;

/// The local-part with any plus-tag stripped: `"hello+spam@x"` -> `"hello"`.
pub fn parse_local(address: &str) -> &str {
    let local = address.split('@').next().unwrap_or(address);
    match local.split_once('+') {
        Some((base, _filter)) => base,
        None => local,
    }
}

/// The plus-tag without the leading `+`, or `""` if there is none.
pub fn parse_filter(address: &str) -> &str {
    let local = address.split('@').next().unwrap_or(address);
    match local.split_once('+') {
        Some((_base, filter)) => filter,
        None => "",
    }
}

/// The domain part of the address, verified to be a FQDN and checked against
/// the disposable-domain deny-list. Fails with `InvalidDomain(550)` otherwise.
pub fn parse_domain<'a>(
    address: &'a str,
    disposable: &DisposableDomains,
) -> Result<&'a str, RelayError> {
    let domain = address
        .rsplit_once('@')
        .map(|(_, d)| d)
        .ok_or_else(|| RelayError::InvalidDomain(format!("{address} has no domain")))?;

    if !is_fqdn(domain) {
        return Err(RelayError::InvalidDomain(format!(
            "{domain} is not a fully qualified domain name"
        )));
    }

    if disposable.is_disposable(domain) {
        return Err(RelayError::InvalidDomain(format!(
            "Disposable email domains are not allowed: {domain}"
        )));
    }

    Ok(domain)
}

/// The domain part of an address with no FQDN or disposable-domain check —
/// used for forwarding targets, where the destination mailbox is outside our
/// jurisdiction. `None` if the address has no `@`.
pub fn split_domain(address: &str) -> Option<&str> {
    address.rsplit_once('@').map(|(_, d)| d)
}

/// Syntactic FQDN check: at least two non-empty, hyphen-clean labels, no
/// leading/trailing dot, RFC 1035-safe character set.
pub fn is_fqdn(domain: &str) -> bool {
    if domain.is_empty() || domain.starts_with('.') || domain.ends_with('.') {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    labels.iter().all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Full syntactic validation of an address (used before any DNS lookup).
pub fn is_valid_email(address: &str) -> bool {
    address.parse::<EmailAddress>().is_ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_local_and_filter() {
        assert_eq!(parse_local("hello+spam@x.com"), "hello");
        assert_eq!(parse_filter("hello+spam@x.com"), "spam");
        assert_eq!(parse_local("hello@x.com"), "hello");
        assert_eq!(parse_filter("hello@x.com"), "");
    }

    #[test]
    fn fqdn_shape() {
        assert!(is_fqdn("niftylettuce.com"));
        assert!(is_fqdn("mail.niftylettuce.com"));
        assert!(!is_fqdn("localhost"));
        assert!(!is_fqdn(".niftylettuce.com"));
        assert!(!is_fqdn("niftylettuce.com."));
        assert!(!is_fqdn("nifty_lettuce.com"));
    }

    #[test]
    fn rejects_disposable_domain() {
        let disposable = DisposableDomains::load(None);
        let err = parse_domain("user@mailinator.com", &disposable).unwrap_err();
        assert!(err.to_string().contains("Disposable"));
    }

    #[test]
    fn accepts_valid_domain() {
        let disposable = DisposableDomains::load(None);
        assert_eq!(
            parse_domain("user@niftylettuce.com", &disposable).unwrap(),
            "niftylettuce.com"
        );
    }
}
