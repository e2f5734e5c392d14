//! Scan-target filtering with glob-style whitelist/blacklist rules.
//!
//! Patterns are globs where `*` matches any run of characters; matching
//! is anchored and case-insensitive. The blacklist always wins; when a
//! whitelist is present, a target must match it to pass.

use regex::Regex;

pub struct ScanFilter {
    whitelist: Vec<Regex>,
    blacklist: Vec<Regex>,
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| {
            let escaped = regex::escape(p).replace("\\*", ".*");
            Regex::new(&format!("(?i)^{escaped}$")).ok()
        })
        .collect()
}

impl ScanFilter {
    pub fn new(whitelist: Vec<String>, blacklist: Vec<String>) -> Self {
        ScanFilter {
            whitelist: compile_patterns(&whitelist),
            blacklist: compile_patterns(&blacklist),
        }
    }

    /// Whether `target` is allowed for scanning.
    pub fn is_allowed(&self, target: &str) -> bool {
        if self.blacklist.iter().any(|p| p.is_match(target)) {
            return false;
        }
        if !self.whitelist.is_empty() {
            return self.whitelist.iter().any(|p| p.is_match(target));
        }
        true
    }

    pub fn filter_targets<'a, I>(&self, targets: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        targets
            .into_iter()
            .filter(|t| self.is_allowed(t))
            .map(|t| t.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_filter_allows_everything() {
        let f = ScanFilter::new(vec![], vec![]);
        assert!(f.is_allowed("anything.example.com"));
    }

    #[test]
    fn blacklist_takes_precedence() {
        let f = ScanFilter::new(
            strings(&["*.example.com"]),
            strings(&["admin.example.com"]),
        );
        assert!(f.is_allowed("www.example.com"));
        assert!(!f.is_allowed("admin.example.com"));
    }

    #[test]
    fn whitelist_requires_match() {
        let f = ScanFilter::new(strings(&["*.example.com"]), vec![]);
        assert!(f.is_allowed("api.example.com"));
        assert!(!f.is_allowed("api.other.org"));
    }

    #[test]
    fn globs_are_anchored_and_case_insensitive() {
        let f = ScanFilter::new(vec![], strings(&["*.internal.example.com"]));
        assert!(!f.is_allowed("DB.Internal.Example.Com"));
        // The anchor means the bare zone itself is not covered by the glob.
        assert!(f.is_allowed("internal.example.com"));
        // Dots are literal, not wildcards.
        assert!(f.is_allowed("dbXinternalXexample.com"));
    }

    #[test]
    fn filter_targets_keeps_order() {
        let f = ScanFilter::new(vec![], strings(&["bad.example.com"]));
        let out = f.filter_targets(["a.example.com", "bad.example.com", "b.example.com"]);
        assert_eq!(out, strings(&["a.example.com", "b.example.com"]));
    }
}
