//! Vulnerability confidence scoring and multi-source merging.

use serde_json::Value;

use crate::types::Severity;

/// Confidence score 0..=100 for a finding.
///
/// The base depends on the scanner's historical precision; evidence,
/// corroboration from a second scanner, and a historical hit each add a
/// fixed bonus.
pub fn calculate_confidence(
    scanner: &str,
    has_evidence: bool,
    multi_source: bool,
    historical_hit: bool,
) -> u8 {
    let base: u8 = match scanner.to_ascii_lowercase().as_str() {
        "nuclei" => 60,
        "xray" => 65,
        "manual" => 90,
        _ => 40,
    };
    let mut score = base as u32;
    if has_evidence {
        score += 15;
    }
    if multi_source {
        score += 20;
    }
    if historical_hit {
        score += 10;
    }
    score.min(100) as u8
}

fn severity_rank(finding: &Value) -> u8 {
    finding
        .get("severity")
        .and_then(Value::as_str)
        .and_then(Severity::parse)
        .map(|s| s.rank())
        .unwrap_or(0)
}

/// Merge findings that describe the same issue from multiple scanners:
/// the highest severity wins, and the `sources` / `multi_source` fields
/// record the corroboration.
pub fn merge_sources(findings: &[Value]) -> Value {
    let Some(first) = findings.first() else {
        return Value::Object(serde_json::Map::new());
    };
    let mut merged = first.clone();

    let mut sources: Vec<String> = vec![
        first
            .get("scanner")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
    ];

    for finding in &findings[1..] {
        let scanner = finding
            .get("scanner")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        if !sources.contains(&scanner) {
            sources.push(scanner);
        }
        if severity_rank(finding) > severity_rank(&merged) {
            if let Some(severity) = finding.get("severity").cloned() {
                merged["severity"] = severity;
            }
        }
    }

    let multi_source = sources.len() > 1;
    merged["sources"] = Value::Array(sources.into_iter().map(Value::String).collect());
    merged["multi_source"] = Value::Bool(multi_source);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_scores_by_scanner() {
        assert_eq!(calculate_confidence("nuclei", false, false, false), 60);
        assert_eq!(calculate_confidence("xray", false, false, false), 65);
        assert_eq!(calculate_confidence("manual", false, false, false), 90);
        assert_eq!(calculate_confidence("mystery", false, false, false), 40);
    }

    #[test]
    fn bonuses_accumulate_and_cap() {
        assert_eq!(calculate_confidence("nuclei", true, false, false), 75);
        assert_eq!(calculate_confidence("nuclei", true, true, false), 95);
        // 90 + 15 + 20 + 10 would exceed the cap.
        assert_eq!(calculate_confidence("manual", true, true, true), 100);
    }

    #[test]
    fn merge_takes_highest_severity() {
        let findings = vec![
            json!({"scanner": "nuclei", "severity": "medium", "title": "x"}),
            json!({"scanner": "xray", "severity": "critical"}),
        ];
        let merged = merge_sources(&findings);
        assert_eq!(merged["severity"], "critical");
        assert_eq!(merged["title"], "x");
        assert_eq!(merged["multi_source"], true);
        assert_eq!(merged["sources"], json!(["nuclei", "xray"]));
    }

    #[test]
    fn single_source_is_not_multi() {
        let findings = vec![json!({"scanner": "nuclei", "severity": "low"})];
        let merged = merge_sources(&findings);
        assert_eq!(merged["multi_source"], false);
    }

    #[test]
    fn empty_input_merges_to_empty_object() {
        assert_eq!(merge_sources(&[]), json!({}));
    }
}
