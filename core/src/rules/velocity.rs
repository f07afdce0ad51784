//! Velocity check: bursts of claims from one actor in a short span.
//! A claim counts once however many lines it carries; every record of a
//! qualifying burst is flagged.

use chrono::Duration;
use std::collections::HashMap;

use crate::{
    config::ScoringConfig,
    finding::{evidence, timestamp_text, Finding},
    record::{fields, Record},
    rules::{DetectionRule, RuleResult, RuleScope, Subject},
    types::Severity,
    window::TimeWindow,
};

pub const VELOCITY_CHECK: &str = "velocity_check";

/// Copied from each flagged record.
const RECORD_FIELDS: &[&str] = &[fields::STRUCTURE_ID, fields::STRUCTURE_NAME, fields::TRANSACTION_ID];

const EVIDENCE: &[&str] = &[
    fields::STRUCTURE_ID,
    fields::STRUCTURE_NAME,
    fields::TRANSACTION_ID,
    evidence::BURST_CLAIMS,
    evidence::BURST_START,
    evidence::BURST_END,
];

pub struct VelocityCheckRule {
    span:         Duration,
    span_minutes: i64,
    min_claims:   usize,
    scoring:      ScoringConfig,
}

impl VelocityCheckRule {
    pub fn new(span_minutes: i64, min_claims: usize, scoring: ScoringConfig) -> Self {
        Self {
            span: Duration::minutes(span_minutes),
            span_minutes,
            min_claims,
            scoring,
        }
    }
}

/// The claim a record belongs to; records without one stand alone.
fn claim_of(record: &Record) -> String {
    record.key(fields::TRANSACTION_ID).unwrap_or_else(|| record.id.clone())
}

/// Largest qualifying burst a record belongs to.
#[derive(Clone, Copy)]
struct Burst {
    claims: usize,
    first:  usize,
    last:   usize,
}

impl DetectionRule for VelocityCheckRule {
    fn name(&self) -> &'static str {
        VELOCITY_CHECK
    }

    fn scope(&self) -> RuleScope {
        RuleScope::Grouped
    }

    fn evidence_fields(&self) -> &'static [&'static str] {
        EVIDENCE
    }

    fn group_key(&self, record: &Record) -> Option<String> {
        (!record.actor_id.is_empty()).then(|| record.actor_id.clone())
    }

    fn evaluate(&self, subject: Subject<'_>, _window: &TimeWindow) -> RuleResult {
        let Subject::Group { key, records } = subject else {
            return Err(format!("{} expects a record group", self.name()));
        };

        let claims: Vec<String> = records.iter().map(|r| claim_of(r)).collect();
        // Lines per claim inside the trailing span [t - span, t].
        let mut in_span: HashMap<&str, usize> = HashMap::new();
        let mut bursts: Vec<Option<Burst>> = vec![None; records.len()];
        let mut first = 0;
        for (last, record) in records.iter().enumerate() {
            *in_span.entry(claims[last].as_str()).or_insert(0) += 1;
            while record.timestamp - records[first].timestamp > self.span {
                if let Some(lines) = in_span.get_mut(claims[first].as_str()) {
                    *lines -= 1;
                    if *lines == 0 {
                        in_span.remove(claims[first].as_str());
                    }
                }
                first += 1;
            }
            let size = in_span.len();
            if size < self.min_claims {
                continue;
            }
            for slot in &mut bursts[first..=last] {
                if slot.map_or(true, |b| size > b.claims) {
                    *slot = Some(Burst { claims: size, first, last });
                }
            }
        }

        let findings = records
            .iter()
            .zip(bursts)
            .filter_map(|(&record, burst)| burst.map(|b| (record, b)))
            .map(|(record, burst)| {
                let intensity = (burst.claims - self.min_claims) as f64 / self.min_claims as f64;
                Finding::for_record(
                    record,
                    self.name(),
                    Severity::High,
                    self.scoring.score(Severity::High, intensity),
                    format!(
                        "Actor {key} filed {} claims within {} minutes (threshold {})",
                        burst.claims, self.span_minutes, self.min_claims
                    ),
                )
                .with_fields_from(record, RECORD_FIELDS)
                .with_evidence(evidence::BURST_CLAIMS, burst.claims as i64)
                .with_evidence(evidence::BURST_START, timestamp_text(records[burst.first].timestamp))
                .with_evidence(evidence::BURST_END, timestamp_text(records[burst.last].timestamp))
            })
            .collect();
        Ok(findings)
    }
}
