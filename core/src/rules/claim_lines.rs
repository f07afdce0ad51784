//! Per-record checks on individual claim lines and headers.

use crate::{
    config::ScoringConfig,
    finding::{evidence, Finding},
    record::{fields, Record},
    rules::{money, DetectionRule, RuleResult, RuleScope, Subject},
    types::{FieldValue, Severity},
    window::TimeWindow,
};

pub const TRANSACTION_WITHOUT_LINES: &str = "transaction_without_lines";
pub const MISSING_EXECUTION_DATE: &str = "missing_execution_date";
pub const OVERBILLING: &str = "overbilling";

fn single_record<'a>(rule: &str, subject: Subject<'a>) -> Result<&'a Record, String> {
    match subject {
        Subject::Record(r) => Ok(r),
        Subject::Group { key, .. } => Err(format!("{rule} is per-record, got group '{key}'")),
    }
}

fn has_line(record: &Record) -> bool {
    !record.get(fields::LINE_ID).is_null()
}

/// Evidence columns shared by every claim-line rule: the claim's parties
/// and labels, then the billed amount against the tariff.
const LINE_EVIDENCE: &[&str] = &[
    fields::TRANSACTION_ID,
    fields::STRUCTURE_ID,
    fields::STRUCTURE_CODE,
    fields::STRUCTURE_NAME,
    fields::STRUCTURE_TYPE_LABEL,
    fields::BENEFICIARY_ID,
    fields::BENEFICIARY_NAME,
    fields::BENEFICIARY_MATRICULE,
    fields::BENEFICIARY_CONTACT,
    fields::PRESTATION_TYPE_ID,
    fields::PRESTATION_TYPE_LABEL,
    fields::ACT_ID,
    fields::ACT_CODE,
    fields::ACT_LABEL,
    fields::EXECUTION_DATE,
    fields::AMOUNT,
    fields::OFFICIAL_TARIFF,
    evidence::AMOUNT_GAP,
];

/// Amount minus tariff; a missing tariff counts as zero, a missing
/// amount leaves the gap empty.
fn amount_gap(record: &Record) -> Option<f64> {
    let amount = record.f64(fields::AMOUNT)?;
    Some(amount - record.f64(fields::OFFICIAL_TARIFF).unwrap_or(0.0))
}

fn line_finding(finding: Finding, record: &Record) -> Finding {
    // Every column but the trailing gap is a copied record attribute.
    finding
        .with_fields_from(record, &LINE_EVIDENCE[..LINE_EVIDENCE.len() - 1])
        .with_evidence(evidence::AMOUNT_GAP, FieldValue::from(amount_gap(record)))
}

// ── Claim header with no lines ───────────────────────────────────────────────

pub struct TransactionWithoutLinesRule {
    scoring: ScoringConfig,
}

impl TransactionWithoutLinesRule {
    pub fn new(scoring: ScoringConfig) -> Self {
        Self { scoring }
    }
}

impl DetectionRule for TransactionWithoutLinesRule {
    fn name(&self) -> &'static str {
        TRANSACTION_WITHOUT_LINES
    }

    fn scope(&self) -> RuleScope {
        RuleScope::PerRecord
    }

    fn evidence_fields(&self) -> &'static [&'static str] {
        LINE_EVIDENCE
    }

    fn evaluate(&self, subject: Subject<'_>, _window: &TimeWindow) -> RuleResult {
        let record = single_record(self.name(), subject)?;
        if has_line(record) {
            return Ok(vec![]);
        }
        let transaction = record.key(fields::TRANSACTION_ID).unwrap_or_else(|| record.id.clone());
        let finding = Finding::for_record(
            record,
            self.name(),
            Severity::Medium,
            self.scoring.score(Severity::Medium, 0.0),
            format!("Claim {transaction} has no billed acts attached"),
        );
        Ok(vec![line_finding(finding, record)])
    }
}

// ── Claim line without execution date ────────────────────────────────────────

pub struct MissingExecutionDateRule {
    scoring: ScoringConfig,
}

impl MissingExecutionDateRule {
    pub fn new(scoring: ScoringConfig) -> Self {
        Self { scoring }
    }
}

impl DetectionRule for MissingExecutionDateRule {
    fn name(&self) -> &'static str {
        MISSING_EXECUTION_DATE
    }

    fn scope(&self) -> RuleScope {
        RuleScope::PerRecord
    }

    fn evidence_fields(&self) -> &'static [&'static str] {
        LINE_EVIDENCE
    }

    fn evaluate(&self, subject: Subject<'_>, _window: &TimeWindow) -> RuleResult {
        let record = single_record(self.name(), subject)?;
        if !has_line(record) || record.key(fields::EXECUTION_DATE).is_some() {
            return Ok(vec![]);
        }
        // Billed lines weigh a little more than free ones.
        let intensity = match record.f64(fields::AMOUNT) {
            Some(a) if a > 0.0 => 0.5,
            _ => 0.0,
        };
        let act = record.key(fields::ACT_CODE).unwrap_or_else(|| "?".into());
        let finding = Finding::for_record(
            record,
            self.name(),
            Severity::Low,
            self.scoring.score(Severity::Low, intensity),
            format!("Act {act} billed without an execution date"),
        );
        Ok(vec![line_finding(finding, record)])
    }
}

// ── Billed amount above the official tariff ──────────────────────────────────

pub struct OverbillingRule {
    tolerance_pct: f64,
    high_excess:   f64,
    scoring:       ScoringConfig,
}

impl OverbillingRule {
    pub fn new(tolerance_pct: f64, high_excess: f64, scoring: ScoringConfig) -> Self {
        Self { tolerance_pct, high_excess, scoring }
    }
}

impl DetectionRule for OverbillingRule {
    fn name(&self) -> &'static str {
        OVERBILLING
    }

    fn scope(&self) -> RuleScope {
        RuleScope::PerRecord
    }

    fn evidence_fields(&self) -> &'static [&'static str] {
        LINE_EVIDENCE
    }

    fn evaluate(&self, subject: Subject<'_>, _window: &TimeWindow) -> RuleResult {
        let record = single_record(self.name(), subject)?;
        let (Some(amount), Some(tariff)) =
            (record.f64(fields::AMOUNT), record.f64(fields::OFFICIAL_TARIFF))
        else {
            return Ok(vec![]);
        };
        if amount <= tariff * (1.0 + self.tolerance_pct) {
            return Ok(vec![]);
        }

        // Relative excess over the tariff; a zero tariff makes any charge maximal.
        let excess = if tariff > 0.0 { amount / tariff - 1.0 } else { f64::INFINITY };
        let severity = if excess >= self.high_excess { Severity::High } else { Severity::Medium };
        let intensity = if severity == Severity::High {
            (excess - self.high_excess) / self.high_excess
        } else {
            excess / self.high_excess
        };
        let act = record.key(fields::ACT_CODE).unwrap_or_else(|| "?".into());
        let excess_txt = if excess.is_finite() {
            format!("+{:.1}%", excess * 100.0)
        } else {
            "tariff is zero".to_string()
        };

        let finding = Finding::for_record(
            record,
            self.name(),
            severity,
            self.scoring.score(severity, intensity),
            format!(
                "Act {act} billed {} against official tariff {} ({excess_txt}, tolerance {:.2})",
                money(amount),
                money(tariff),
                self.tolerance_pct
            ),
        );
        Ok(vec![line_finding(finding, record)])
    }
}
