/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Wildcard domain patterns (`*.example.com`, `update.*.example.io`).
//!
//! A `*` matches any run of characters, dots included, so `*.com` matches
//! `www.google.com` but not the bare `com`.

use ahash::AHashMap;
use regex::{Regex, RegexBuilder};

#[inline]
pub fn is_wildcard(domain: &str) -> bool {
    domain.contains('*')
}

/// Translate a wildcard into an anchored regular expression.
pub fn wildcard_to_regex_string(wildcard: &str) -> String {
    let parts: Vec<String> = wildcard.split('*').map(regex::escape).collect();
    format!("^{}$", parts.join(".*"))
}

/// Compiled wildcard patterns, keyed by the wildcard text.
///
/// Patterns are only compiled when a consumer asks for a wildcard's IPs, and
/// kept for the lifetime of the store so new names can be matched against
/// them as they are learnt.
#[derive(Debug, Default)]
pub(crate) struct WildcardCache {
    patterns: AHashMap<String, Regex>,
}

impl WildcardCache {
    pub(crate) fn get_or_compile(&mut self, wildcard: &str) -> Result<&Regex, regex::Error> {
        if !self.patterns.contains_key(wildcard) {
            let regex = RegexBuilder::new(&wildcard_to_regex_string(wildcard)).build()?;
            self.patterns.insert(wildcard.to_string(), regex);
        }
        // Present: inserted above or already cached.
        Ok(&self.patterns[wildcard])
    }

    /// Wildcards that match `name`.
    pub(crate) fn matching<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.patterns
            .iter()
            .filter(move |(_, regex)| regex.is_match(name))
            .map(|(wildcard, _)| wildcard)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.patterns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_wildcard() {
        assert!(is_wildcard("*.com"));
        assert!(!is_wildcard(".com"));
        assert!(!is_wildcard("google.com"));
        assert!(is_wildcard("*.google.com"));
        assert!(is_wildcard("update.*.tigera.io"));
        assert!(!is_wildcard("cpanel.blog.org"));
    }

    #[test]
    fn test_regex_strings() {
        assert_eq!(wildcard_to_regex_string("*.com"), "^.*\\.com$");
        assert_eq!(wildcard_to_regex_string("*.google.com"), "^.*\\.google\\.com$");
        assert_eq!(
            wildcard_to_regex_string("update.*.tigera.io"),
            "^update\\..*\\.tigera\\.io$"
        );
    }

    #[test]
    fn test_wildcard_matching() {
        let cases = [
            ("*.com", "google.com", true),
            ("*.com", "www.google.com", true),
            ("*.com", "com", false),
            ("*.com", "tigera.io", false),
            ("*.google.com", "www.google.com", true),
            ("*.google.com", "ipv6.google.com", true),
            ("*.google.com", "ipv6google.com", false),
            ("*.google.com", "ipv6.experimental.google.com", true),
            ("update.*.tigera.io", "update.calico.tigera.io", true),
            ("update.*.tigera.io", "update.tsee.tigera.io", true),
            ("update.*.tigera.io", "update.security.tsee.tigera.io", true),
            ("update.*.tigera.io", "update.microsoft.com", false),
        ];

        let mut cache = WildcardCache::default();
        for (wildcard, name, expected) in cases {
            let regex = cache.get_or_compile(wildcard).unwrap();
            assert_eq!(
                regex.is_match(name),
                expected,
                "{wildcard} against {name}"
            );
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_matching_lists_every_matching_pattern() {
        let mut cache = WildcardCache::default();
        cache.get_or_compile("*.google.com").unwrap();
        cache.get_or_compile("*.com").unwrap();
        cache.get_or_compile("*.io").unwrap();

        let mut matched: Vec<&String> = cache.matching("www.google.com").collect();
        matched.sort();
        assert_eq!(matched, vec!["*.com", "*.google.com"]);
    }
}
