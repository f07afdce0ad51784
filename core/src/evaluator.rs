//! Rule Evaluator: runs every enabled rule over the record stream.
//!
//! EXECUTION ORDER (fixed):
//!   1. Per-record rules, in registration order, as each record arrives.
//!   2. Grouped rules, in registration order, once the stream is drained;
//!      groups visited in ascending key order, records in stream order.
//!
//! RULES:
//!   - A record is buffered once, and only if some grouped rule keys it;
//!     groups hold indices into that buffer.
//!   - A failing rule (error or panic) loses only that invocation's
//!     output. It is logged, counted and reported, never fatal.
//!   - Source errors ARE fatal and propagate immediately.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use crate::{
    config::EngineConfig,
    error::{FraudError, FraudResult},
    finding::Finding,
    record::Record,
    rules::{builtin_rules, DetectionRule, RuleScope, Subject},
    run_result::RuleSheet,
    window::TimeWindow,
};

pub struct RuleEvaluator {
    rules: Vec<Box<dyn DetectionRule>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleStats {
    pub rule_name:     String,
    pub invocations:   u64,
    pub finding_count: u64,
    pub error_count:   u64,
}

/// An isolated rule failure, kept for the run summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFailure {
    pub rule_name: String,
    /// Record id or group key the rule was evaluating.
    pub subject:   String,
    pub message:   String,
}

impl RuleFailure {
    pub fn to_error(&self) -> FraudError {
        FraudError::RuleExecution {
            rule: self.rule_name.clone(),
            message: format!("{}: {}", self.subject, self.message),
        }
    }
}

/// Output of one evaluation pass, before aggregation.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub findings:     Vec<Finding>,
    pub record_count: u64,
    pub rule_stats:   Vec<RuleStats>,
    pub failures:     Vec<RuleFailure>,
}

impl RuleEvaluator {
    pub fn new(rules: Vec<Box<dyn DetectionRule>>) -> Self {
        Self { rules }
    }

    /// The enabled built-in rules for `config`.
    pub fn from_config(config: &EngineConfig) -> FraudResult<Self> {
        Ok(Self::new(builtin_rules(config)?))
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// One evidence sheet per rule, in registration order.
    pub fn sheets(&self) -> Vec<RuleSheet> {
        self.rules
            .iter()
            .map(|r| RuleSheet::new(r.name(), r.evidence_fields()))
            .collect()
    }

    pub fn evaluate<I>(&self, records: I, window: &TimeWindow) -> FraudResult<Evaluation>
    where
        I: IntoIterator<Item = FraudResult<Record>>,
    {
        let mut out = Evaluation {
            rule_stats: self
                .rules
                .iter()
                .map(|r| RuleStats { rule_name: r.name().to_string(), ..RuleStats::default() })
                .collect(),
            ..Evaluation::default()
        };
        let mut buffered: Vec<Record> = Vec::new();
        let mut groups: Vec<BTreeMap<String, Vec<usize>>> = vec![BTreeMap::new(); self.rules.len()];
        let mut previous: Option<(DateTime<Utc>, String)> = None;

        for record in records {
            let record = record?;
            if let Some((ts, id)) = &previous {
                if record.sort_key() <= (*ts, id.as_str()) {
                    return Err(FraudError::SourceQuery(format!(
                        "record {} arrived after {id} out of (timestamp, id) order",
                        record.id
                    )));
                }
            }
            out.record_count += 1;

            let slot = buffered.len();
            let mut grouped = false;
            for (idx, rule) in self.rules.iter().enumerate() {
                match rule.scope() {
                    RuleScope::PerRecord => {
                        let result = invoke(rule.as_ref(), Subject::Record(&record), window);
                        collect(&mut out, idx, rule.name(), &record.id, result);
                    }
                    RuleScope::Grouped => {
                        if let Some(key) = rule.group_key(&record) {
                            groups[idx].entry(key).or_default().push(slot);
                            grouped = true;
                        }
                    }
                }
            }
            previous = Some((record.timestamp, record.id.clone()));
            if grouped {
                buffered.push(record);
            }
        }
        log::debug!("buffered {} of {} records for grouped rules", buffered.len(), out.record_count);

        for (idx, rule) in self.rules.iter().enumerate() {
            for (key, slots) in std::mem::take(&mut groups[idx]) {
                let members: Vec<&Record> = slots.iter().map(|&i| &buffered[i]).collect();
                let subject = Subject::Group { key: &key, records: &members };
                let result = invoke(rule.as_ref(), subject, window);
                collect(&mut out, idx, rule.name(), &key, result);
            }
        }

        log::info!(
            "evaluated {} records with {} rules: {} findings, {} rule failures",
            out.record_count,
            self.rules.len(),
            out.findings.len(),
            out.failures.len()
        );
        Ok(out)
    }
}

/// Run one rule invocation with panics contained.
fn invoke(rule: &dyn DetectionRule, subject: Subject<'_>, window: &TimeWindow) -> Result<Vec<Finding>, String> {
    let findings = match panic::catch_unwind(AssertUnwindSafe(|| rule.evaluate(subject, window))) {
        Ok(result) => result?,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic with non-string payload".to_string());
            return Err(format!("panicked: {message}"));
        }
    };
    if let Some(bad) = findings.iter().find(|f| !f.score.is_finite()) {
        return Err(format!("produced a non-finite score for record {}", bad.record_id));
    }
    if let Some(bad) = findings.iter().find(|f| f.rule_name != rule.name()) {
        return Err(format!("produced a finding attributed to '{}'", bad.rule_name));
    }
    Ok(findings)
}

fn collect(
    out: &mut Evaluation,
    idx: usize,
    rule_name: &str,
    subject: &str,
    result: Result<Vec<Finding>, String>,
) {
    let stats = &mut out.rule_stats[idx];
    stats.invocations += 1;
    match result {
        Ok(findings) => {
            stats.finding_count += findings.len() as u64;
            out.findings.extend(findings);
        }
        Err(message) => {
            stats.error_count += 1;
            let failure = RuleFailure {
                rule_name: rule_name.to_string(),
                subject: subject.to_string(),
                message,
            };
            log::warn!("{}: {}", crate::error::ErrorKind::RuleExecution, failure.to_error());
            out.failures.push(failure);
        }
    }
}
