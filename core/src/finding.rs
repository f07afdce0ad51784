//! Findings: one rule's flagged output for a record or record group.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::{
    record::Record,
    types::{ActorId, FieldValue, RecordId, Severity},
};

/// Evidence names computed by rules, beside the record fields they copy.
pub mod evidence {
    pub const AMOUNT_GAP:         &str = "amount_gap";
    pub const PERIOD_START:       &str = "period_start";
    pub const PERIOD_END:         &str = "period_end";
    pub const ACT_COUNT:          &str = "act_count";
    pub const POSITIVE_GAP_COUNT: &str = "positive_gap_count";
    pub const DAY:                &str = "day";
    pub const STRUCTURE_COUNT:    &str = "structure_count";
    pub const STRUCTURES:         &str = "structures";
    pub const BURST_CLAIMS:       &str = "burst_claims";
    pub const BURST_START:        &str = "burst_start";
    pub const BURST_END:          &str = "burst_end";
    pub const FINDING_COUNT:      &str = "finding_count";
    pub const RULES:              &str = "rules";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub record_id:   RecordId,
    pub actor_id:    ActorId,
    pub timestamp:   DateTime<Utc>,
    pub rule_name:   String,
    pub severity:    Severity,
    pub score:       f64,
    pub explanation: String,
    /// Other records (group findings) or `record_id/rule_name`
    /// constituents (correlated findings) this finding refers to.
    #[serde(default)]
    pub related:     Vec<String>,
    /// Structured evidence behind the explanation, one value per column
    /// of the rule's evidence sheet.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub evidence:    BTreeMap<String, FieldValue>,
}

impl Finding {
    /// A finding anchored on `record`.
    pub fn for_record(
        record: &Record,
        rule_name: &str,
        severity: Severity,
        score: f64,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            record_id:   record.id.clone(),
            actor_id:    record.actor_id.clone(),
            timestamp:   record.timestamp,
            rule_name:   rule_name.to_string(),
            severity,
            score:       score.clamp(0.0, 1.0),
            explanation: explanation.into(),
            related:     Vec::new(),
            evidence:    BTreeMap::new(),
        }
    }

    pub fn with_related(mut self, related: Vec<String>) -> Self {
        self.related = related;
        self
    }

    pub fn with_evidence(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.evidence.insert(name.to_string(), value.into());
        self
    }

    /// Copy `names` from the record's attributes; absent ones stay null.
    pub fn with_fields_from(mut self, record: &Record, names: &[&str]) -> Self {
        for name in names {
            self.evidence.insert(name.to_string(), record.get(name).clone());
        }
        self
    }

    /// Dedup key: at most one finding per record and rule.
    pub fn key(&self) -> (&str, &str) {
        (self.record_id.as_str(), self.rule_name.as_str())
    }

    /// `record_id/rule_name`, the reference form used by correlated findings.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.record_id, self.rule_name)
    }
}

/// RFC 3339 with an explicit `+00:00`, the form every report uses.
pub fn timestamp_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Report order: severity desc, score desc, timestamp asc, record id asc,
/// rule name asc. Total over findings with distinct `(record_id, rule_name)`.
pub fn report_order(a: &Finding, b: &Finding) -> Ordering {
    b.severity
        .cmp(&a.severity)
        .then_with(|| b.score.total_cmp(&a.score))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.record_id.cmp(&b.record_id))
        .then_with(|| a.rule_name.cmp(&b.rule_name))
}

/// Which of two findings with the same key survives dedup. Compares every
/// field so the winner never depends on arrival order.
pub fn preferred(a: &Finding, b: &Finding) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| a.severity.cmp(&b.severity))
        .then_with(|| b.timestamp.cmp(&a.timestamp))
        .then_with(|| b.explanation.cmp(&a.explanation))
        .then_with(|| b.actor_id.cmp(&a.actor_id))
        .then_with(|| b.related.cmp(&a.related))
        .then_with(|| evidence_text(b).cmp(&evidence_text(a)))
}

fn evidence_text(f: &Finding) -> Vec<(&str, String)> {
    f.evidence.iter().map(|(k, v)| (k.as_str(), v.to_string())).collect()
}
