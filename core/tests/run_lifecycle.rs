//! End-to-end runs: state machine, run lock, artifacts and failure paths.

use chrono::{DateTime, Duration, TimeZone, Utc};
use fraudscan_core::{
    clock::FixedClock,
    config::EngineConfig,
    error::{Component, ErrorKind, FraudError},
    evaluator::RuleEvaluator,
    finding::Finding,
    orchestrator::{RunOrchestrator, RunState, RunStatus},
    record::Record,
    report::{BY_RULE_DIR, FINDINGS_FILE, FINDINGS_HEADER, RULE_STATS_FILE, STAGING_PREFIX, SUMMARY_FILE},
    rules::{DetectionRule, RuleResult, RuleScope, Subject, BUILTIN_RULES},
    source::JsonlRecordSource,
    window::TimeWindow,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_jsonl(dir: &Path, records: &[Record]) -> PathBuf {
    let path = dir.join("records.jsonl");
    let body: Vec<String> = records.iter().map(|r| serde_json::to_string(r).unwrap()).collect();
    fs::write(&path, body.join("\n")).unwrap();
    path
}

/// Only the named built-in rules are enabled.
fn config_with(enabled: &[&str]) -> EngineConfig {
    let mut config = EngineConfig::default_test();
    for rule in BUILTIN_RULES {
        config.rules.insert(rule.to_string(), enabled.contains(&rule));
    }
    config
}

fn orchestrator(config: EngineConfig, jsonl: &Path, clock: Arc<FixedClock>) -> RunOrchestrator {
    let evaluator = RuleEvaluator::from_config(&config).unwrap();
    RunOrchestrator::new(config, Box::new(JsonlRecordSource::new(jsonl)), evaluator, clock)
}

fn burst(actor: &str, count: i64) -> Vec<Record> {
    let t0 = now() - Duration::days(2);
    (0..count)
        .map(|i| Record::new(format!("r{i}"), actor, t0 + Duration::minutes(i * 10)))
        .collect()
}

fn csv_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .split("\r\n")
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn entries(dir: &Path) -> Vec<String> {
    match fs::read_dir(dir) {
        Ok(rd) => rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned()).collect(),
        Err(_) => vec![],
    }
}

#[test]
fn zero_findings_still_produce_complete_reports() {
    init_logs();
    let tmp = tempfile::tempdir().unwrap();
    // Two records an hour apart: nowhere near a velocity burst.
    let records = vec![
        Record::new("a", "A", now() - Duration::hours(5)),
        Record::new("b", "A", now() - Duration::hours(4)),
    ];
    let jsonl = write_jsonl(tmp.path(), &records);
    let out = tmp.path().join("reports");
    let orch = orchestrator(config_with(&["velocity_check"]), &jsonl, Arc::new(FixedClock::new(now())));

    let summary = orch.start_run(7, &out).unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.record_count, 2);
    assert_eq!(summary.finding_count, 0);

    let dir = out.join("run_20240310_120000");
    assert_eq!(summary.report_dir.as_deref(), Some(dir.as_path()));
    assert_eq!(csv_lines(&dir.join(FINDINGS_FILE)), vec![FINDINGS_HEADER.join(",")]);

    let summary_csv = csv_lines(&dir.join(SUMMARY_FILE));
    assert_eq!(summary_csv.len(), 2);
    let row: Vec<&str> = summary_csv[1].split(',').collect();
    assert_eq!(row[0], "run_20240310_120000");
    assert_eq!(row[1], "completed");
    assert_eq!(row[2], "2024-03-03T12:00:00+00:00");
    assert_eq!(row[3], "2024-03-10T12:00:00+00:00");
    assert_eq!(row[6], "2");
    assert_eq!(row[7], "0");

    let stats = csv_lines(&dir.join(RULE_STATS_FILE));
    assert_eq!(stats[1], "velocity_check,1,0,0");
    assert_eq!(entries(&out), vec!["run_20240310_120000".to_string()]);
}

#[test]
fn velocity_burst_reports_the_correlated_finding_first() {
    init_logs();
    let tmp = tempfile::tempdir().unwrap();
    let jsonl = write_jsonl(tmp.path(), &burst("A", 3));
    let out = tmp.path().join("reports");
    let orch = orchestrator(config_with(&["velocity_check"]), &jsonl, Arc::new(FixedClock::new(now())));

    let summary = orch.start_run(7, &out).unwrap().into_result().unwrap();
    assert_eq!(summary.finding_count, 4);
    assert_eq!(summary.correlated_count, 1);

    let lines = csv_lines(&summary.report_dir.unwrap().join(FINDINGS_FILE));
    assert_eq!(lines.len(), 5);
    assert!(lines[1].starts_with("actor:A,A,2024-03-08T12:00:00+00:00,correlated_actor,critical,"));
    assert!(lines[2].starts_with("r0,A,2024-03-08T12:00:00+00:00,velocity_check,high,"));
    assert!(lines[3].starts_with("r1,"));
    assert!(lines[4].starts_with("r2,"));
}

#[test]
fn each_enabled_rule_gets_an_evidence_sheet() {
    let tmp = tempfile::tempdir().unwrap();
    let jsonl = write_jsonl(tmp.path(), &burst("A", 3));
    let out = tmp.path().join("reports");
    let orch = orchestrator(config_with(&["velocity_check"]), &jsonl, Arc::new(FixedClock::new(now())));

    let dir = orch.start_run(7, &out).unwrap().into_result().unwrap().report_dir.unwrap();
    let mut sheets = entries(&dir.join(BY_RULE_DIR));
    sheets.sort();
    assert_eq!(sheets, vec!["correlated_actor.csv", "velocity_check.csv"]);

    let velocity = csv_lines(&dir.join(BY_RULE_DIR).join("velocity_check.csv"));
    assert_eq!(
        velocity[0],
        "record_id,actor_id,timestamp,severity,score,explanation,\
         structure_id,structure_name,transaction_id,burst_claims,burst_start,burst_end"
    );
    assert_eq!(velocity.len(), 4);
    assert!(velocity[1].starts_with("r0,A,2024-03-08T12:00:00+00:00,high,"));
    // No structure or claim attributes on these records: empty cells.
    assert!(velocity[1].ends_with(",,,,3,2024-03-08T12:00:00+00:00,2024-03-08T12:20:00+00:00"));

    let correlated = csv_lines(&dir.join(BY_RULE_DIR).join("correlated_actor.csv"));
    assert_eq!(correlated.len(), 2);
    assert!(correlated[1].starts_with("actor:A,A,"));
    assert!(correlated[1].ends_with(",3,velocity_check"));
}

#[test]
fn window_ends_at_the_invocation_instant() {
    let tmp = tempfile::tempdir().unwrap();
    let jsonl = write_jsonl(tmp.path(), &[]);
    let orch = orchestrator(config_with(&[]), &jsonl, Arc::new(FixedClock::new(now())));

    for (i, days) in [1i64, 7, 30, 365].into_iter().enumerate() {
        let out = tmp.path().join(format!("out{i}"));
        let summary = orch.start_run(days, &out).unwrap();
        let window = summary.window.unwrap();
        assert_eq!(window.end(), now());
        assert_eq!(window.end() - window.start(), Duration::days(days));
    }
}

#[test]
fn bad_window_fails_before_any_io() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("reports");
    // The source file does not exist; the run must fail on the window first.
    let orch = orchestrator(
        config_with(&[]),
        &tmp.path().join("missing.jsonl"),
        Arc::new(FixedClock::new(now())),
    );

    let summary = orch.start_run(0, &out).unwrap();
    match &summary.status {
        RunStatus::Failed { component, kind, .. } => {
            assert_eq!(*component, Component::WindowResolver);
            assert_eq!(*kind, ErrorKind::Configuration);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(summary.window.is_none());
    assert!(!out.exists());
    assert_eq!(orch.current_run().map(|(_, s)| s), Some(RunState::Failed));
}

#[test]
fn run_arguments_take_precedence_over_configured_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let jsonl = write_jsonl(tmp.path(), &burst("A", 1));
    let out = tmp.path().join("reports");
    // Invalid as a configured run, irrelevant to an explicit one.
    let mut config = config_with(&[]);
    config.window_days = 0;
    config.out_dir = PathBuf::new();
    let orch = orchestrator(config, &jsonl, Arc::new(FixedClock::new(now())));

    let summary = orch.start_run(7, &out).unwrap();
    assert!(summary.is_completed(), "{:?}", summary.status);
    assert_eq!(summary.record_count, 1);
    assert!(!orch.start_configured_run().unwrap().is_completed());
}

#[test]
fn empty_output_directory_argument_is_a_configuration_error() {
    let tmp = tempfile::tempdir().unwrap();
    let jsonl = write_jsonl(tmp.path(), &burst("A", 1));
    let orch = orchestrator(config_with(&[]), &jsonl, Arc::new(FixedClock::new(now())));

    let summary = orch.start_run(7, Path::new("")).unwrap();
    assert!(matches!(
        summary.status,
        RunStatus::Failed { component: Component::WindowResolver, kind: ErrorKind::Configuration, .. }
    ));
    assert!(summary.window.is_none());
}

#[test]
fn unavailable_source_fails_the_run_without_a_run_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("reports");
    let orch = orchestrator(
        config_with(&["velocity_check"]),
        &tmp.path().join("missing.jsonl"),
        Arc::new(FixedClock::new(now())),
    );

    let summary = orch.start_run(7, &out).unwrap();
    assert!(!summary.is_completed());
    assert!(summary.report_dir.is_none());
    assert!(matches!(
        summary.status,
        RunStatus::Failed { component: Component::RecordSource, kind: ErrorKind::SourceUnavailable, .. }
    ));
    assert!(!out.join(&summary.run_id).exists());
    assert!(matches!(summary.into_result(), Err(FraudError::SourceUnavailable(_))));
}

#[test]
fn unsorted_source_fails_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let mut records = burst("A", 3);
    records.swap(0, 2);
    let jsonl = write_jsonl(tmp.path(), &records);
    let out = tmp.path().join("reports");
    let orch = orchestrator(config_with(&["velocity_check"]), &jsonl, Arc::new(FixedClock::new(now())));

    let summary = orch.start_run(7, &out).unwrap();
    assert!(matches!(
        summary.status,
        RunStatus::Failed { kind: ErrorKind::SourceQuery, .. }
    ));
    assert!(entries(&out).is_empty());
}

#[test]
fn existing_run_directory_is_never_overwritten() {
    let tmp = tempfile::tempdir().unwrap();
    let jsonl = write_jsonl(tmp.path(), &burst("A", 3));
    let out = tmp.path().join("reports");
    let taken = out.join("run_20240310_120000");
    fs::create_dir_all(&taken).unwrap();
    fs::write(taken.join("marker"), "keep me").unwrap();

    let orch = orchestrator(config_with(&["velocity_check"]), &jsonl, Arc::new(FixedClock::new(now())));
    let summary = orch.start_run(7, &out).unwrap();

    assert!(matches!(
        summary.status,
        RunStatus::Failed { component: Component::ReportWriter, kind: ErrorKind::ReportWrite, .. }
    ));
    assert_eq!(entries(&taken), vec!["marker".to_string()]);
    assert_eq!(fs::read_to_string(taken.join("marker")).unwrap(), "keep me");
    assert!(entries(&out).iter().all(|e| !e.starts_with(STAGING_PREFIX)));
}

#[test]
fn unwritable_output_root_fails_in_the_report_writer() {
    let tmp = tempfile::tempdir().unwrap();
    let jsonl = write_jsonl(tmp.path(), &burst("A", 3));
    // A regular file where the output directory should be.
    let out = tmp.path().join("not-a-dir");
    fs::write(&out, "").unwrap();

    let orch = orchestrator(config_with(&["velocity_check"]), &jsonl, Arc::new(FixedClock::new(now())));
    let summary = orch.start_run(7, &out).unwrap();
    assert!(matches!(
        summary.status,
        RunStatus::Failed { component: Component::ReportWriter, .. }
    ));
    assert_eq!(summary.record_count, 3);
    assert!(out.is_file());
}

#[test]
fn identical_input_gives_identical_reports() {
    let tmp = tempfile::tempdir().unwrap();
    let mut records = burst("A", 4);
    records.extend(burst("B", 2).into_iter().map(|mut r| {
        r.id = format!("b{}", r.id);
        r.timestamp += Duration::seconds(1);
        r
    }));
    records.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
    let jsonl = write_jsonl(tmp.path(), &records);

    let reports: Vec<(String, String)> = (0..2)
        .map(|i| {
            let out = tmp.path().join(format!("out{i}"));
            let orch = orchestrator(config_with(&["velocity_check"]), &jsonl, Arc::new(FixedClock::new(now())));
            let dir = orch.start_run(7, &out).unwrap().into_result().unwrap().report_dir.unwrap();
            (
                fs::read_to_string(dir.join(FINDINGS_FILE)).unwrap(),
                fs::read_to_string(dir.join(RULE_STATS_FILE)).unwrap(),
            )
        })
        .collect();
    assert_eq!(reports[0], reports[1]);
}

#[test]
fn a_new_run_may_start_once_the_previous_one_is_terminal() {
    let tmp = tempfile::tempdir().unwrap();
    let jsonl = write_jsonl(tmp.path(), &burst("A", 3));
    let out = tmp.path().join("reports");
    let clock = Arc::new(FixedClock::new(now()));
    let orch = orchestrator(config_with(&["velocity_check"]), &jsonl, clock.clone());

    assert!(orch.start_run(0, &out).unwrap().status != RunStatus::Completed);
    assert!(orch.start_run(7, &out).unwrap().is_completed());
    clock.advance(Duration::seconds(1));
    let second = orch.start_run(7, &out).unwrap();
    assert!(second.is_completed());
    assert_eq!(second.run_id, "run_20240310_120001");
    assert_eq!(entries(&out).len(), 2);
}

// ── Single flight ─────────────────────────────────────────────────────────────

/// Blocks inside evaluation until the test releases it.
struct Gate {
    entered: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl DetectionRule for Gate {
    fn name(&self) -> &'static str {
        "gate"
    }

    fn scope(&self) -> RuleScope {
        RuleScope::PerRecord
    }

    fn evaluate(&self, subject: Subject<'_>, _window: &TimeWindow) -> RuleResult {
        let Subject::Record(record) = subject else { return Ok(vec![]) };
        let _ = self.entered.lock().unwrap().send(());
        let _ = self.release.lock().unwrap().recv();
        Ok(vec![Finding::for_record(record, self.name(), fraudscan_core::types::Severity::Low, 0.2, "gated")])
    }
}

#[test]
fn second_trigger_while_evaluating_is_rejected() {
    init_logs();
    let tmp = tempfile::tempdir().unwrap();
    let jsonl = write_jsonl(tmp.path(), &burst("A", 1));
    let out = tmp.path().join("reports");

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let gate = Gate { entered: Mutex::new(entered_tx), release: Mutex::new(release_rx) };

    let orch = Arc::new(RunOrchestrator::new(
        config_with(&[]),
        Box::new(JsonlRecordSource::new(&jsonl)),
        RuleEvaluator::new(vec![Box::new(gate)]),
        Arc::new(FixedClock::new(now())),
    ));

    let background = {
        let orch = Arc::clone(&orch);
        let out = out.clone();
        thread::spawn(move || orch.start_run(7, &out))
    };
    entered_rx.recv().unwrap();

    match orch.start_run(7, &out) {
        Err(FraudError::RunInProgress { run_id, state }) => {
            assert_eq!(run_id, "run_20240310_120000");
            assert_eq!(state, RunState::Evaluating);
        }
        other => panic!("expected RunInProgress, got {other:?}"),
    }
    assert_eq!(
        orch.current_run(),
        Some(("run_20240310_120000".to_string(), RunState::Evaluating))
    );

    release_tx.send(()).unwrap();
    let summary = background.join().unwrap().unwrap();
    assert!(summary.is_completed());
    assert_eq!(summary.finding_count, 1);
    assert_eq!(orch.current_run().map(|(_, s)| s), Some(RunState::Completed));
}
