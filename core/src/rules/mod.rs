//! Detection rules and their registry.
//!
//! RULE: Every rule implements DetectionRule.
//! Rules are pure: same subject + same window → same findings. They
//! never read the clock, never touch storage, and share no state.
//! The evaluator invokes them in registration order.

use crate::{
    config::EngineConfig,
    error::{FraudError, FraudResult},
    finding::Finding,
    record::Record,
    window::TimeWindow,
};

pub mod claim_lines;
pub mod collusion;
pub mod identity;
pub mod velocity;

pub use claim_lines::{MissingExecutionDateRule, OverbillingRule, TransactionWithoutLinesRule};
pub use collusion::CollusionPatternRule;
pub use identity::IdentityUsurpationRule;
pub use velocity::VelocityCheckRule;

/// How a rule wants its records delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// Called once per record, as records stream in.
    PerRecord,
    /// Called once per maximal group sharing `group_key`, after the
    /// whole window has been read.
    Grouped,
}

/// What a rule is evaluated against.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Record(&'a Record),
    Group { key: &'a str, records: &'a [&'a Record] },
}

/// Rule-level failure. Never aborts a run.
pub type RuleResult = Result<Vec<Finding>, String>;

/// The contract every detection rule must fulfil.
pub trait DetectionRule: Send + Sync {
    /// Unique stable name; used in config, findings and reports.
    fn name(&self) -> &'static str;

    fn scope(&self) -> RuleScope;

    /// Grouping key for grouped rules. Records returning None are not
    /// buffered for this rule.
    fn group_key(&self, _record: &Record) -> Option<String> {
        None
    }

    fn evaluate(&self, subject: Subject<'_>, window: &TimeWindow) -> RuleResult;

    /// Evidence names this rule attaches to its findings, in the column
    /// order of its evidence sheet.
    fn evidence_fields(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Names of every built-in rule, in registration order.
pub const BUILTIN_RULES: [&str; 6] = [
    claim_lines::TRANSACTION_WITHOUT_LINES,
    claim_lines::MISSING_EXECUTION_DATE,
    claim_lines::OVERBILLING,
    collusion::COLLUSION_PATTERN,
    identity::IDENTITY_USURPATION,
    velocity::VELOCITY_CHECK,
];

/// Build the enabled built-in rules, in their fixed order. Naming an
/// unknown rule in the config is an error rather than a silent no-op.
pub fn builtin_rules(config: &EngineConfig) -> FraudResult<Vec<Box<dyn DetectionRule>>> {
    if let Some(unknown) = config.rules.keys().find(|k| !BUILTIN_RULES.contains(&k.as_str())) {
        return Err(FraudError::config(format!(
            "unknown rule '{unknown}' in configuration (known: {})",
            BUILTIN_RULES.join(", ")
        )));
    }

    let t = &config.thresholds;
    let s = &config.scoring;
    let all: Vec<Box<dyn DetectionRule>> = vec![
        Box::new(TransactionWithoutLinesRule::new(s.clone())),
        Box::new(MissingExecutionDateRule::new(s.clone())),
        Box::new(OverbillingRule::new(
            t.overbilling_tolerance_pct,
            t.overbilling_high_excess,
            s.clone(),
        )),
        Box::new(CollusionPatternRule::new(
            t.collusion_span_days,
            t.collusion_min_acts,
            t.collusion_min_positive_gaps,
            s.clone(),
        )),
        Box::new(IdentityUsurpationRule::new(t.usurpation_min_structures, s.clone())),
        Box::new(VelocityCheckRule::new(
            t.velocity_span_minutes,
            t.velocity_min_claims,
            s.clone(),
        )),
    ];

    Ok(all.into_iter().filter(|r| config.rule_enabled(r.name())).collect())
}

/// Format a money amount the way explanations show it.
pub(crate) fn money(v: f64) -> String {
    format!("{v:.2}")
}
