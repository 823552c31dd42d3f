//! Static disposable-domain deny-list. Bundled at build time and loaded once
//! at startup, matching the design note in spec.md §9: "Disposable-domain
//! list is a static resource; bundle at build or load once at startup;
//! matching is exact + suffix-wildcard."

use std::collections::HashSet;

const BUNDLED: &str = include_str!("../assets/disposable_domains.txt");

pub struct DisposableDomains {
    exact: HashSet<String>,
    wildcard_suffixes: Vec<String>,
}

impl DisposableDomains {
    /// Parse the bundled list, optionally merging in an operator-supplied
    /// extra file (one domain per line, same `*.`-wildcard syntax).
    pub fn load(extra: Option<&str>) -> Self {
        let mut domains = Self {
            exact: HashSet::new(),
            wildcard_suffixes: Vec::new(),
        };
        domains.parse_into(BUNDLED);
        if let Some(extra) = extra {
            domains.parse_into(extra);
        }
        domains
    }

    fn parse_into(&mut self, source: &str) {
        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.to_ascii_lowercase();
            if let Some(suffix) = line.strip_prefix("*.") {
                self.wildcard_suffixes.push(suffix.to_string());
            } else {
                self.exact.insert(line);
            }
        }
    }

    /// True if `domain` is the exact disposable domain, or a subdomain of a
    /// wildcard entry (`x.y.disposable.tld` matches wildcard `disposable.tld`).
    pub fn is_disposable(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        if self.exact.contains(&domain) {
            return true;
        }
        self.wildcard_suffixes.iter().any(|suffix| {
            domain == *suffix || domain.ends_with(&format!(".{suffix}"))
        })
    }
}
