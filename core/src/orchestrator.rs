//! Run Orchestrator: sequences one run and owns its lifecycle.
//!
//! EXECUTION ORDER (fixed):
//!   1. Resolving    validate config, resolve the TimeWindow
//!   2. Fetching     open the record stream
//!   3. Evaluating   run every enabled rule over the stream
//!   4. Aggregating  dedup, correlate, order
//!   5. Writing      stage and commit the run directory
//!
//! RULES:
//!   - Single flight: a second `start_run` while a run is active is
//!     rejected with `RunInProgress` and does not touch the active run.
//!   - `Completed` is reached only after the report commit succeeds.
//!   - Every other path ends in `Failed`, including a panic mid-run.
//!   - Stages share a `RunContext`, never global state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    aggregator::{aggregate, correlated_sheet, is_correlated},
    clock::Clock,
    config::EngineConfig,
    error::{Component, ErrorKind, FraudError, FraudResult},
    evaluator::{RuleEvaluator, RuleFailure},
    report::ReportWriter,
    run_result::{RunMetadata, RunResult},
    source::{self, RecordSource},
    types::RunId,
    window::{resolve_window, TimeWindow},
};

/// `run_YYYYmmdd_HHMMSS`, always UTC.
pub const RUN_ID_FORMAT: &str = "run_%Y%m%d_%H%M%S";

pub fn run_id_for(started_at: DateTime<Utc>) -> RunId {
    started_at.format(RUN_ID_FORMAT).to_string()
}

// ── Run state ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Resolving,
    Fetching,
    Evaluating,
    Aggregating,
    Writing,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending     => "pending",
            RunState::Resolving   => "resolving",
            RunState::Fetching    => "fetching",
            RunState::Evaluating  => "evaluating",
            RunState::Aggregating => "aggregating",
            RunState::Writing     => "writing",
            RunState::Completed   => "completed",
            RunState::Failed      => "failed",
        }
    }

    /// Anything but the two terminal states holds the run lock.
    pub fn is_active(&self) -> bool {
        !matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Run lock ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct LockSlot {
    run_id: RunId,
    state:  RunState,
}

/// Mutual exclusion for runs over one dataset. Holds the state of the
/// most recent run; a new run may start only once that state is terminal.
#[derive(Debug, Default)]
pub struct RunLock {
    slot: Mutex<Option<LockSlot>>,
}

impl RunLock {
    fn slot(&self) -> MutexGuard<'_, Option<LockSlot>> {
        // The slot is plain data; a poisoned lock still holds a valid value.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock for `run_id`, entering `Pending`.
    pub fn acquire(&self, run_id: &str) -> FraudResult<RunGuard<'_>> {
        let mut slot = self.slot();
        if let Some(active) = slot.as_ref().filter(|s| s.state.is_active()) {
            return Err(FraudError::RunInProgress {
                run_id: active.run_id.clone(),
                state:  active.state,
            });
        }
        *slot = Some(LockSlot { run_id: run_id.to_string(), state: RunState::Pending });
        Ok(RunGuard { lock: self, run_id: run_id.to_string(), finished: false })
    }

    /// Id and state of the current or most recent run.
    pub fn current(&self) -> Option<(RunId, RunState)> {
        self.slot().as_ref().map(|s| (s.run_id.clone(), s.state))
    }
}

/// Proof of holding the run lock. Dropped without `finish`, it marks
/// the run `Failed` so an abandoned run never blocks the next one.
pub struct RunGuard<'a> {
    lock:     &'a RunLock,
    run_id:   RunId,
    finished: bool,
}

impl RunGuard<'_> {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn set(&self, state: RunState) -> RunState {
        let mut slot = self.lock.slot();
        match slot.as_mut() {
            Some(s) if s.run_id == self.run_id => std::mem::replace(&mut s.state, state),
            _ => RunState::Failed,
        }
    }

    pub fn advance(&self, state: RunState) {
        let from = self.set(state);
        log::info!("{}: {from} -> {state}", self.run_id);
    }

    pub fn finish(mut self, state: RunState) {
        self.advance(state);
        self.finished = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let from = self.set(RunState::Failed);
            log::error!("{}: abandoned in {from}, marked failed", self.run_id);
        }
    }
}

// ── Context and summary ───────────────────────────────────────────────────────

/// Everything the stages of one run share. Lives only for that run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id:           RunId,
    pub started_at:       DateTime<Utc>,
    pub out_dir:          PathBuf,
    pub window:           Option<TimeWindow>,
    pub record_count:     u64,
    pub finding_count:    u64,
    pub correlated_count: u64,
    pub rule_failures:    Vec<RuleFailure>,
}

impl RunContext {
    fn new(run_id: RunId, started_at: DateTime<Utc>, out_dir: &Path) -> Self {
        Self {
            run_id,
            started_at,
            out_dir: out_dir.to_path_buf(),
            window: None,
            record_count: 0,
            finding_count: 0,
            correlated_count: 0,
            rule_failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed {
        component: Component,
        kind:      ErrorKind,
        message:   String,
    },
}

/// What the caller gets back from `start_run`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id:           RunId,
    pub status:           RunStatus,
    pub window:           Option<TimeWindow>,
    pub record_count:     u64,
    pub finding_count:    u64,
    pub correlated_count: u64,
    pub rule_error_count: u64,
    pub rule_failures:    Vec<RuleFailure>,
    pub started_at:       DateTime<Utc>,
    pub finished_at:      DateTime<Utc>,
    /// Committed run directory. `None` unless completed.
    pub report_dir:       Option<PathBuf>,
    #[serde(skip)]
    error:                Option<FraudError>,
}

impl RunSummary {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn error(&self) -> Option<&FraudError> {
        self.error.as_ref()
    }

    /// The summary of a completed run, or the error that failed it.
    pub fn into_result(self) -> FraudResult<RunSummary> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            RunStatus::Completed => write!(
                f,
                "{} completed: {} records, {} findings ({} correlated), {} rule errors",
                self.run_id,
                self.record_count,
                self.finding_count,
                self.correlated_count,
                self.rule_failures.len()
            )?,
            RunStatus::Failed { component, kind, message } => {
                write!(f, "{} failed in {component} ({kind}): {message}", self.run_id)?
            }
        }
        if let Some(dir) = &self.report_dir {
            write!(f, " -> {}", dir.display())?;
        }
        Ok(())
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct RunOrchestrator {
    config:    EngineConfig,
    source:    Box<dyn RecordSource>,
    evaluator: RuleEvaluator,
    clock:     Arc<dyn Clock>,
    lock:      RunLock,
}

impl RunOrchestrator {
    pub fn new(
        config: EngineConfig,
        source: Box<dyn RecordSource>,
        evaluator: RuleEvaluator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, source, evaluator, clock, lock: RunLock::default() }
    }

    /// Wire the configured source and built-in rules.
    pub fn from_config(config: EngineConfig, clock: Arc<dyn Clock>) -> FraudResult<Self> {
        let source = source::from_config(&config.source);
        let evaluator = RuleEvaluator::from_config(&config)?;
        Ok(Self::new(config, source, evaluator, clock))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Id and state of the current or most recent run.
    pub fn current_run(&self) -> Option<(RunId, RunState)> {
        self.lock.current()
    }

    /// Run with the configured window length and output directory.
    pub fn start_configured_run(&self) -> FraudResult<RunSummary> {
        let out_dir = self.config.out_dir.clone();
        self.start_run(self.config.window_days, &out_dir)
    }

    /// Execute one run end to end. Only a rejected trigger is an `Err`;
    /// a run that starts and fails comes back as a `Failed` summary.
    pub fn start_run(&self, window_days: i64, out_dir: &Path) -> FraudResult<RunSummary> {
        let started_at = self.clock.now();
        let run_id = run_id_for(started_at);
        let guard = self.lock.acquire(&run_id)?;
        log::info!(
            "{run_id}: started with {} over {window_days} days, rules: {}",
            self.source.describe(),
            self.evaluator.rule_names().join(", ")
        );

        let mut ctx = RunContext::new(run_id, started_at, out_dir);
        let outcome = self.execute(&guard, &mut ctx, window_days);
        let finished_at = self.clock.now();

        let (status, report_dir, error) = match outcome {
            Ok(dir) => {
                guard.finish(RunState::Completed);
                (RunStatus::Completed, Some(dir), None)
            }
            Err(err) => {
                guard.finish(RunState::Failed);
                log::error!("{}: {} in {}: {err}", ctx.run_id, err.kind(), err.component());
                let status = RunStatus::Failed {
                    component: err.component(),
                    kind:      err.kind(),
                    message:   err.to_string(),
                };
                (status, None, Some(err))
            }
        };

        let summary = RunSummary {
            run_id: ctx.run_id,
            status,
            window: ctx.window,
            record_count: ctx.record_count,
            finding_count: ctx.finding_count,
            correlated_count: ctx.correlated_count,
            rule_error_count: ctx.rule_failures.len() as u64,
            rule_failures: ctx.rule_failures,
            started_at,
            finished_at,
            report_dir,
            error,
        };
        log::info!("{summary}");
        Ok(summary)
    }

    fn execute(&self, guard: &RunGuard<'_>, ctx: &mut RunContext, window_days: i64) -> FraudResult<PathBuf> {
        guard.advance(RunState::Resolving);
        self.config.validate_run(window_days, &ctx.out_dir)?;
        let window = resolve_window(window_days, ctx.started_at)?;
        ctx.window = Some(window);

        guard.advance(RunState::Fetching);
        let records = self.source.open(&window)?;

        guard.advance(RunState::Evaluating);
        let evaluation = self.evaluator.evaluate(records, &window)?;
        ctx.record_count = evaluation.record_count;
        ctx.rule_failures = evaluation.failures;

        guard.advance(RunState::Aggregating);
        let findings = aggregate(evaluation.findings, &self.config.correlation, &self.config.scoring);
        ctx.finding_count = findings.len() as u64;
        ctx.correlated_count = findings.iter().filter(|f| is_correlated(f)).count() as u64;

        guard.advance(RunState::Writing);
        let mut rule_sheets = self.evaluator.sheets();
        if self.config.correlation.enabled {
            rule_sheets.push(correlated_sheet());
        }
        let result = RunResult {
            metadata: RunMetadata {
                run_id:           ctx.run_id.clone(),
                window,
                record_count:     ctx.record_count,
                finding_count:    ctx.finding_count,
                correlated_count: ctx.correlated_count,
                rule_error_count: ctx.rule_failures.len() as u64,
                started_at:       ctx.started_at,
                finished_at:      self.clock.now(),
                status:           RunState::Completed,
            },
            findings,
            rule_stats:    evaluation.rule_stats,
            rule_failures: ctx.rule_failures.clone(),
            rule_sheets,
        };
        ReportWriter::new(&ctx.out_dir).commit(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_id_is_utc_second_resolution() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 7, 8, 9).unwrap();
        assert_eq!(run_id_for(ts), "run_20240301_070809");
    }

    #[test]
    fn lock_rejects_while_active_and_frees_on_terminal_state() {
        let lock = RunLock::default();
        let guard = lock.acquire("run_a").unwrap();
        guard.advance(RunState::Evaluating);

        match lock.acquire("run_b") {
            Err(FraudError::RunInProgress { run_id, state }) => {
                assert_eq!(run_id, "run_a");
                assert_eq!(state, RunState::Evaluating);
            }
            _ => panic!("second acquire must be rejected"),
        }
        assert_eq!(lock.current(), Some(("run_a".to_string(), RunState::Evaluating)));

        guard.finish(RunState::Completed);
        assert!(lock.acquire("run_b").is_ok());
    }

    #[test]
    fn dropped_guard_marks_the_run_failed() {
        let lock = RunLock::default();
        {
            let guard = lock.acquire("run_a").unwrap();
            guard.advance(RunState::Fetching);
        }
        assert_eq!(lock.current(), Some(("run_a".to_string(), RunState::Failed)));
    }
}
