//! Fingerprint matching.

use regex::Regex;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// One technology identification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchResult {
    pub fingerprint_id: String,
    pub name: String,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub tags: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FingerprintRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub info: RuleInfo,
    #[serde(default)]
    pub http: Vec<HttpProbe>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RuleInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub metadata: RuleMetadata,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RuleMetadata {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct HttpProbe {
    #[serde(default)]
    pub matchers: Vec<Matcher>,
}

fn default_part() -> String {
    "body".to_string()
}

fn default_condition() -> String {
    "or".to_string()
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Matcher {
    Word {
        #[serde(default)]
        words: Vec<String>,
        #[serde(default, rename = "case-insensitive")]
        case_insensitive: bool,
        #[serde(default = "default_condition")]
        condition: String,
        #[serde(default)]
        negative: bool,
        #[serde(default = "default_part")]
        part: String,
    },
    Regex {
        #[serde(default)]
        regex: Vec<String>,
        #[serde(default = "default_condition")]
        condition: String,
        #[serde(default)]
        negative: bool,
        #[serde(default = "default_part")]
        part: String,
    },
    Favicon {
        #[serde(default)]
        hash: Vec<String>,
        #[serde(default)]
        negative: bool,
    },
}

enum CompiledCheck {
    Word {
        words: Vec<String>,
        case_insensitive: bool,
        all: bool,
        negative: bool,
        header_part: bool,
    },
    Regex {
        // Invalid patterns compile to None and never match.
        patterns: Vec<Option<Regex>>,
        all: bool,
        negative: bool,
        header_part: bool,
    },
    Favicon {
        hashes: Vec<String>,
        negative: bool,
    },
}

struct CompiledRule {
    result: MatchResult,
    checks: Vec<CompiledCheck>,
}

/// Engine over a compiled rule set; safe for concurrent use.
pub struct FingerprintEngine {
    rules: Vec<CompiledRule>,
}

impl FingerprintEngine {
    pub fn new(rules: Vec<FingerprintRule>) -> Self {
        let compiled = rules.into_iter().map(compile_rule).collect::<Vec<_>>();
        FingerprintEngine { rules: compiled }
    }

    /// Parse raw JSON rule values, skipping malformed entries.
    pub fn from_values(values: Vec<Value>) -> Self {
        let rules = values
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<FingerprintRule>(value) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    debug!(error = %e, "skipping malformed fingerprint rule");
                    None
                }
            })
            .collect();
        Self::new(rules)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Match a response against every rule. A rule matches when any of
    /// its matchers does.
    pub fn match_response(
        &self,
        body: &str,
        headers: &FxHashMap<String, String>,
        favicon_hash: Option<&str>,
    ) -> Vec<MatchResult> {
        let header_str = headers
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n");

        self.rules
            .iter()
            .filter(|rule| {
                rule.checks
                    .iter()
                    .any(|check| check_matches(check, body, &header_str, favicon_hash))
            })
            .map(|rule| rule.result.clone())
            .collect()
    }
}

fn compile_rule(rule: FingerprintRule) -> CompiledRule {
    let name = if rule.info.name.is_empty() {
        rule.id.clone()
    } else {
        rule.info.name.clone()
    };
    let result = MatchResult {
        fingerprint_id: if rule.id.is_empty() {
            "unknown".to_string()
        } else {
            rule.id.clone()
        },
        name: if name.is_empty() {
            "unknown".to_string()
        } else {
            name
        },
        vendor: rule.info.metadata.vendor.clone(),
        product: rule.info.metadata.product.clone(),
        version: rule.info.metadata.version.clone(),
        tags: rule.info.tags.clone(),
    };

    let mut checks = Vec::new();
    for probe in rule.http {
        for matcher in probe.matchers {
            checks.push(compile_matcher(matcher));
        }
    }
    CompiledRule { result, checks }
}

fn compile_matcher(matcher: Matcher) -> CompiledCheck {
    match matcher {
        Matcher::Word {
            words,
            case_insensitive,
            condition,
            negative,
            part,
        } => CompiledCheck::Word {
            words: if case_insensitive {
                words.iter().map(|w| w.to_lowercase()).collect()
            } else {
                words
            },
            case_insensitive,
            all: condition == "and",
            negative,
            header_part: part == "header",
        },
        Matcher::Regex {
            regex,
            condition,
            negative,
            part,
        } => CompiledCheck::Regex {
            patterns: regex
                .iter()
                .map(|p| Regex::new(&format!("(?i){p}")).ok())
                .collect(),
            all: condition == "and",
            negative,
            header_part: part == "header",
        },
        Matcher::Favicon { hash, negative } => CompiledCheck::Favicon {
            hashes: hash.iter().map(|h| h.to_lowercase()).collect(),
            negative,
        },
    }
}

fn check_matches(
    check: &CompiledCheck,
    body: &str,
    header_str: &str,
    favicon_hash: Option<&str>,
) -> bool {
    match check {
        CompiledCheck::Word {
            words,
            case_insensitive,
            all,
            negative,
            header_part,
        } => {
            if words.is_empty() {
                return false;
            }
            let content = if *header_part { header_str } else { body };
            let content = if *case_insensitive {
                content.to_lowercase()
            } else {
                content.to_string()
            };
            let matched = if *all {
                words.iter().all(|w| content.contains(w))
            } else {
                words.iter().any(|w| content.contains(w))
            };
            matched != *negative
        }
        CompiledCheck::Regex {
            patterns,
            all,
            negative,
            header_part,
        } => {
            if patterns.is_empty() {
                return false;
            }
            let content = if *header_part { header_str } else { body };
            let results: Vec<bool> = patterns
                .iter()
                .map(|p| p.as_ref().map(|r| r.is_match(content)).unwrap_or(false))
                .collect();
            let matched = if *all {
                results.iter().all(|r| *r)
            } else {
                results.iter().any(|r| *r)
            };
            matched != *negative
        }
        CompiledCheck::Favicon { hashes, negative } => {
            let Some(favicon) = favicon_hash else {
                return false;
            };
            let matched = hashes.contains(&favicon.to_lowercase());
            matched != *negative
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(rules: Value) -> FingerprintEngine {
        let values = rules.as_array().cloned().unwrap_or_default();
        FingerprintEngine::from_values(values)
    }

    fn names(results: &[MatchResult]) -> Vec<&str> {
        results.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn word_matcher_or_condition() {
        let e = engine(json!([{
            "id": "nginx",
            "info": {"name": "Nginx"},
            "http": [{"matchers": [{
                "type": "word",
                "words": ["nginx", "openresty"],
                "case-insensitive": true
            }]}]
        }]));
        let headers = FxHashMap::default();
        assert_eq!(
            names(&e.match_response("powered by NGINX", &headers, None)),
            vec!["Nginx"]
        );
        assert!(e.match_response("apache here", &headers, None).is_empty());
    }

    #[test]
    fn word_matcher_and_condition() {
        let e = engine(json!([{
            "id": "combo",
            "info": {"name": "Combo"},
            "http": [{"matchers": [{
                "type": "word",
                "words": ["alpha", "beta"],
                "condition": "and"
            }]}]
        }]));
        let headers = FxHashMap::default();
        assert!(e.match_response("alpha only", &headers, None).is_empty());
        assert!(!e.match_response("alpha and beta", &headers, None).is_empty());
    }

    #[test]
    fn negative_matcher_inverts() {
        let e = engine(json!([{
            "id": "not-nginx",
            "info": {"name": "NotNginx"},
            "http": [{"matchers": [{
                "type": "word",
                "words": ["nginx"],
                "negative": true
            }]}]
        }]));
        let headers = FxHashMap::default();
        assert!(e.match_response("nginx", &headers, None).is_empty());
        assert!(!e.match_response("caddy", &headers, None).is_empty());
    }

    #[test]
    fn header_part_matches_headers_only() {
        let e = engine(json!([{
            "id": "srv",
            "info": {"name": "Srv"},
            "http": [{"matchers": [{
                "type": "word",
                "words": ["server: caddy"],
                "case-insensitive": true,
                "part": "header"
            }]}]
        }]));
        let mut headers = FxHashMap::default();
        headers.insert("Server".to_string(), "Caddy".to_string());
        assert!(!e.match_response("body without it", &headers, None).is_empty());
        assert!(e
            .match_response("server: caddy", &FxHashMap::default(), None)
            .is_empty());
    }

    #[test]
    fn invalid_regex_never_matches() {
        let e = engine(json!([{
            "id": "broken",
            "info": {"name": "Broken"},
            "http": [{"matchers": [{
                "type": "regex",
                "regex": ["[unclosed"]
            }]}]
        }]));
        assert!(e
            .match_response("[unclosed", &FxHashMap::default(), None)
            .is_empty());
    }

    #[test]
    fn regex_matcher_is_case_insensitive() {
        let e = engine(json!([{
            "id": "wp",
            "info": {"name": "WordPress"},
            "http": [{"matchers": [{
                "type": "regex",
                "regex": ["wp-content/themes"]
            }]}]
        }]));
        assert!(!e
            .match_response("/WP-Content/Themes/x.css", &FxHashMap::default(), None)
            .is_empty());
    }

    #[test]
    fn favicon_hash_compare_is_case_insensitive() {
        let e = engine(json!([{
            "id": "fav",
            "info": {"name": "Fav"},
            "http": [{"matchers": [{
                "type": "favicon",
                "hash": ["ABCDEF123456"]
            }]}]
        }]));
        let headers = FxHashMap::default();
        assert!(!e.match_response("", &headers, Some("abcdef123456")).is_empty());
        assert!(e.match_response("", &headers, Some("000000")).is_empty());
        assert!(e.match_response("", &headers, None).is_empty());
    }

    #[test]
    fn malformed_rules_are_skipped() {
        let e = engine(json!([
            {"id": "ok", "info": {"name": "Ok"},
             "http": [{"matchers": [{"type": "word", "words": ["ok"]}]}]},
            {"http": "not-a-list"}
        ]));
        assert_eq!(e.rule_count(), 1);
    }
}
