//! The finalized output of one run, handed to the Report Writer.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    evaluator::{RuleFailure, RuleStats},
    finding::Finding,
    orchestrator::RunState,
    types::RunId,
    window::TimeWindow,
};

#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub run_id:           RunId,
    pub window:           TimeWindow,
    pub record_count:     u64,
    pub finding_count:    u64,
    pub correlated_count: u64,
    pub rule_error_count: u64,
    pub started_at:       DateTime<Utc>,
    pub finished_at:      DateTime<Utc>,
    pub status:           RunState,
}

/// Ordered, deduplicated findings plus everything the reports need.
/// Written once by the orchestrator, then only read.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub metadata:      RunMetadata,
    pub findings:      Vec<Finding>,
    pub rule_stats:    Vec<RuleStats>,
    pub rule_failures: Vec<RuleFailure>,
    pub rule_sheets:   Vec<RuleSheet>,
}

/// Columns of one rule's evidence sheet, beyond the fixed lead columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSheet {
    pub rule_name: String,
    pub columns:   Vec<String>,
}

impl RuleSheet {
    pub fn new(rule_name: &str, columns: &[&str]) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            columns:   columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}
