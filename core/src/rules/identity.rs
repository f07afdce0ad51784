//! Identity usurpation: the same beneficiary treated by several care
//! structures on the same (UTC) day.

use std::collections::BTreeSet;

use crate::{
    config::ScoringConfig,
    finding::{evidence, Finding},
    record::{fields, Record},
    rules::{DetectionRule, RuleResult, RuleScope, Subject},
    types::Severity,
    window::TimeWindow,
};

pub const IDENTITY_USURPATION: &str = "identity_usurpation";

const BENEFICIARY: &[&str] = &[
    fields::BENEFICIARY_ID,
    fields::BENEFICIARY_NAME,
    fields::BENEFICIARY_MATRICULE,
    fields::BENEFICIARY_CONTACT,
];

const EVIDENCE: &[&str] = &[
    fields::BENEFICIARY_ID,
    fields::BENEFICIARY_NAME,
    fields::BENEFICIARY_MATRICULE,
    fields::BENEFICIARY_CONTACT,
    evidence::DAY,
    evidence::STRUCTURE_COUNT,
    evidence::STRUCTURES,
];

pub struct IdentityUsurpationRule {
    min_structures: usize,
    scoring:        ScoringConfig,
}

impl IdentityUsurpationRule {
    pub fn new(min_structures: usize, scoring: ScoringConfig) -> Self {
        Self { min_structures, scoring }
    }
}

impl DetectionRule for IdentityUsurpationRule {
    fn name(&self) -> &'static str {
        IDENTITY_USURPATION
    }

    fn scope(&self) -> RuleScope {
        RuleScope::Grouped
    }

    fn evidence_fields(&self) -> &'static [&'static str] {
        EVIDENCE
    }

    fn group_key(&self, record: &Record) -> Option<String> {
        record.key(fields::STRUCTURE_ID)?;
        let beneficiary = record.key(fields::BENEFICIARY_ID)?;
        Some(format!("{beneficiary}|{}", record.timestamp.format("%Y-%m-%d")))
    }

    fn evaluate(&self, subject: Subject<'_>, _window: &TimeWindow) -> RuleResult {
        let Subject::Group { records, .. } = subject else {
            return Err(format!("{} expects a record group", self.name()));
        };
        let Some(&anchor) = records.first() else {
            return Ok(vec![]);
        };

        let structures: BTreeSet<String> =
            records.iter().filter_map(|r| r.key(fields::STRUCTURE_ID)).collect();
        if structures.len() < self.min_structures {
            return Ok(vec![]);
        }

        let extra = structures.len() - self.min_structures;
        let intensity = extra as f64 / self.min_structures as f64;
        let beneficiary = match (anchor.key(fields::BENEFICIARY_NAME), anchor.key(fields::BENEFICIARY_ID)) {
            (Some(name), Some(id)) => format!("{name} ({id})"),
            (_, Some(id)) => id,
            _ => "?".to_string(),
        };
        let day = anchor.timestamp.format("%Y-%m-%d").to_string();
        let listed = structures.iter().cloned().collect::<Vec<_>>().join(",");
        let explanation = format!(
            "Beneficiary {beneficiary} treated by {} structures on {day}: {listed} (threshold {})",
            structures.len(),
            self.min_structures,
        );
        let related = records[1..].iter().map(|r| r.id.clone()).collect();

        Ok(vec![Finding::for_record(
            anchor,
            self.name(),
            Severity::High,
            self.scoring.score(Severity::High, intensity),
            explanation,
        )
        .with_related(related)
        .with_fields_from(anchor, BENEFICIARY)
        .with_evidence(evidence::DAY, day)
        .with_evidence(evidence::STRUCTURE_COUNT, structures.len() as i64)
        .with_evidence(evidence::STRUCTURES, listed)])
    }
}
