//! Aggregator: dedup, cross-record correlation, final ordering.
//!
//! `aggregate` is a pure function of the finding multiset: input order
//! never changes the output, and feeding the output back in returns it
//! unchanged.

use std::collections::{BTreeMap, HashMap};

use crate::{
    config::{CorrelationConfig, ScoringConfig},
    finding::{evidence, preferred, report_order, Finding},
    run_result::RuleSheet,
    types::Severity,
};

pub const CORRELATED_ACTOR: &str = "correlated_actor";

/// Record id prefix of correlated findings.
pub const ACTOR_PREFIX: &str = "actor:";

pub fn is_correlated(finding: &Finding) -> bool {
    finding.rule_name == CORRELATED_ACTOR
}

/// Evidence sheet of correlated findings.
pub fn correlated_sheet() -> RuleSheet {
    RuleSheet::new(CORRELATED_ACTOR, &[evidence::FINDING_COUNT, evidence::RULES])
}

pub fn aggregate(
    findings: impl IntoIterator<Item = Finding>,
    correlation: &CorrelationConfig,
    scoring: &ScoringConfig,
) -> Vec<Finding> {
    let mut unique = dedup(findings);
    if correlation.enabled {
        let correlated = correlate(&unique, correlation, scoring);
        // Recomputed correlations replace any carried in from a previous pass.
        unique.retain(|f| !is_correlated(f));
        unique.extend(correlated);
    }
    unique.sort_by(report_order);
    unique
}

/// Keep one finding per `(record_id, rule_name)`: the highest-scoring,
/// with a full-field tie-break so the survivor is order independent.
pub fn dedup(findings: impl IntoIterator<Item = Finding>) -> Vec<Finding> {
    let mut best: HashMap<(String, String), Finding> = HashMap::new();
    for finding in findings {
        let key = (finding.record_id.clone(), finding.rule_name.clone());
        match best.get_mut(&key) {
            Some(current) => {
                if preferred(&finding, current).is_gt() {
                    *current = finding;
                }
            }
            None => {
                best.insert(key, finding);
            }
        }
    }
    best.into_values().collect()
}

/// One critical finding per actor with at least `min_findings` distinct
/// rule findings at or above `min_severity`.
fn correlate(
    findings: &[Finding],
    correlation: &CorrelationConfig,
    scoring: &ScoringConfig,
) -> Vec<Finding> {
    let mut by_actor: BTreeMap<&str, Vec<&Finding>> = BTreeMap::new();
    for f in findings {
        if !is_correlated(f) && f.severity >= correlation.min_severity {
            by_actor.entry(f.actor_id.as_str()).or_default().push(f);
        }
    }

    by_actor
        .into_iter()
        .filter(|(_, members)| members.len() >= correlation.min_findings)
        .map(|(actor, mut members)| {
            members.sort_by(|a, b| a.key().cmp(&b.key()));
            let earliest = members.iter().map(|f| f.timestamp).min().unwrap_or_default();
            let top = members.iter().map(|f| f.score).fold(0.0_f64, f64::max);
            let top_band = scoring.floor(correlation.min_severity);
            // Where the strongest constituent sits inside its own band
            // carries over into the critical band.
            let intensity = if top_band < 1.0 { (top - top_band) / (1.0 - top_band) } else { 0.0 };
            let mut rules: Vec<&str> = members.iter().map(|f| f.rule_name.as_str()).collect();
            rules.sort_unstable();
            rules.dedup();

            let rules = rules.join(", ");
            let finding = Finding {
                record_id:   format!("{ACTOR_PREFIX}{actor}"),
                actor_id:    actor.to_string(),
                timestamp:   earliest,
                rule_name:   CORRELATED_ACTOR.to_string(),
                severity:    Severity::Critical,
                score:       scoring.score(Severity::Critical, intensity),
                explanation: format!(
                    "Actor {actor} has {} findings at {} severity or above (rules: {})",
                    members.len(),
                    correlation.min_severity,
                    rules
                ),
                related:     members.iter().map(|f| f.reference()).collect(),
                evidence:    BTreeMap::new(),
            };
            finding
                .with_evidence(evidence::FINDING_COUNT, members.len() as i64)
                .with_evidence(evidence::RULES, rules)
        })
        .collect()
}
