//! Report Writer: CSV artifacts committed as one run directory.
//!
//! Two-phase protocol:
//!   1. Write every artifact into `<out_dir>/.staging-<run_id>-<uuid>/`,
//!      flushing and fsyncing each file.
//!   2. Rename the staging directory to `<out_dir>/<run_id>`.
//!
//! A reader listing `out_dir` sees either no run directory or a complete
//! one. On any failure the staging directory is removed. An existing
//! directory under the final name is never replaced.
//!
//! Layout of a committed run:
//!   findings.csv          every finding, report order
//!   summary.csv           one row of run metadata
//!   rule_stats.csv        invocations, findings and errors per rule
//!   by_rule/<rule>.csv    one sheet per rule with its structured evidence

use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::{
    error::{FraudError, FraudResult},
    finding::timestamp_text,
    run_result::{RuleSheet, RunResult},
};

pub const FINDINGS_FILE: &str = "findings.csv";
pub const SUMMARY_FILE: &str = "summary.csv";
pub const RULE_STATS_FILE: &str = "rule_stats.csv";
pub const BY_RULE_DIR: &str = "by_rule";

/// Prefix of in-flight staging directories. Report listings skip these.
pub const STAGING_PREFIX: &str = ".staging-";

pub const FINDINGS_HEADER: [&str; 7] =
    ["record_id", "actor_id", "timestamp", "rule_name", "severity", "score", "explanation"];

pub const SUMMARY_HEADER: [&str; 10] = [
    "run_id",
    "status",
    "window_start",
    "window_end",
    "started_at",
    "finished_at",
    "record_count",
    "finding_count",
    "correlated_count",
    "rule_error_count",
];

pub const RULE_STATS_HEADER: [&str; 4] = ["rule_name", "invocations", "finding_count", "error_count"];

/// Leading columns of every per-rule sheet; the rule's evidence follows.
pub const SHEET_LEAD: [&str; 6] = ["record_id", "actor_id", "timestamp", "severity", "score", "explanation"];

pub struct ReportWriter {
    out_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self { out_dir: out_dir.into() }
    }

    pub fn final_path(&self, run_id: &str) -> PathBuf {
        self.out_dir.join(run_id)
    }

    /// Write and atomically commit the run directory. Returns its path.
    pub fn commit(&self, result: &RunResult) -> FraudResult<PathBuf> {
        self.commit_with(result, |_| Ok(()))
    }

    /// `commit`, with `before_publish` called on the fully written staging
    /// directory right before the rename.
    fn commit_with<F>(&self, result: &RunResult, before_publish: F) -> FraudResult<PathBuf>
    where
        F: FnOnce(&Path) -> FraudResult<()>,
    {
        let run_id = &result.metadata.run_id;
        if !is_plain_name(run_id) {
            return Err(FraudError::report_write(&self.out_dir, format!("invalid run id '{run_id}'")));
        }
        if let Some(bad) = result.rule_sheets.iter().find(|s| !is_plain_name(&s.rule_name)) {
            return Err(FraudError::report_write(
                &self.out_dir,
                format!("rule name '{}' cannot name a report file", bad.rule_name),
            ));
        }

        let final_path = self.final_path(run_id);
        ensure_vacant(&final_path)?;

        fs::create_dir_all(&self.out_dir).map_err(|e| FraudError::report_write(&self.out_dir, e))?;
        let staging = self
            .out_dir
            .join(format!("{STAGING_PREFIX}{run_id}-{}", uuid::Uuid::new_v4().simple()));
        fs::create_dir(&staging).map_err(|e| FraudError::report_write(&staging, e))?;

        let staged = stage(&staging, result)
            .and_then(|()| before_publish(&staging))
            .and_then(|()| publish(&staging, &final_path));
        match staged {
            Ok(()) => {
                sync_dir(&self.out_dir);
                log::info!(
                    "committed {} ({} findings)",
                    final_path.display(),
                    result.findings.len()
                );
                Ok(final_path)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    log::warn!("could not remove staging dir {}: {cleanup}", staging.display());
                } else {
                    log::warn!("discarded staging dir {} after: {e}", staging.display());
                }
                Err(e)
            }
        }
    }
}

fn stage(staging: &Path, result: &RunResult) -> FraudResult<()> {
    write_csv(&staging.join(FINDINGS_FILE), FINDINGS_HEADER.iter().copied(), findings_rows(result))?;
    write_csv(&staging.join(SUMMARY_FILE), SUMMARY_HEADER.iter().copied(), std::iter::once(summary_row(result)))?;
    write_csv(&staging.join(RULE_STATS_FILE), RULE_STATS_HEADER.iter().copied(), rule_stats_rows(result))?;

    let by_rule = staging.join(BY_RULE_DIR);
    fs::create_dir(&by_rule).map_err(|e| FraudError::report_write(&by_rule, e))?;
    for sheet in &result.rule_sheets {
        let header = SHEET_LEAD.iter().copied().chain(sheet.columns.iter().map(String::as_str));
        write_csv(&by_rule.join(format!("{}.csv", sheet.rule_name)), header, sheet_rows(result, sheet))?;
    }
    sync_dir(&by_rule);
    sync_dir(staging);
    Ok(())
}

fn publish(staging: &Path, final_path: &Path) -> FraudResult<()> {
    // rename(2) silently replaces an empty directory; check again.
    ensure_vacant(final_path)?;
    fs::rename(staging, final_path).map_err(|e| FraudError::report_write(final_path, e))
}

/// Usable as a single path component: no separators, not hidden.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.starts_with('.')
}

fn ensure_vacant(path: &Path) -> FraudResult<()> {
    if fs::symlink_metadata(path).is_ok() {
        return Err(FraudError::report_write(path, "run directory already exists"));
    }
    Ok(())
}

/// Directory fsync so created entries and the rename itself are durable.
/// Failure does not undo the commit but is reported.
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|handle| handle.sync_all()) {
        log::warn!("fsync of directory {} failed: {e}", dir.display());
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    timestamp_text(ts)
}

pub fn format_score(score: f64) -> String {
    format!("{score:.4}")
}

fn findings_rows(result: &RunResult) -> impl Iterator<Item = Vec<String>> + '_ {
    result.findings.iter().map(|f| {
        vec![
            f.record_id.clone(),
            f.actor_id.clone(),
            format_timestamp(f.timestamp),
            f.rule_name.clone(),
            f.severity.to_string(),
            format_score(f.score),
            f.explanation.clone(),
        ]
    })
}

fn summary_row(result: &RunResult) -> Vec<String> {
    let m = &result.metadata;
    vec![
        m.run_id.clone(),
        m.status.to_string(),
        format_timestamp(m.window.start()),
        format_timestamp(m.window.end()),
        format_timestamp(m.started_at),
        format_timestamp(m.finished_at),
        m.record_count.to_string(),
        m.finding_count.to_string(),
        m.correlated_count.to_string(),
        m.rule_error_count.to_string(),
    ]
}

fn rule_stats_rows(result: &RunResult) -> impl Iterator<Item = Vec<String>> + '_ {
    result.rule_stats.iter().map(|s| {
        vec![
            s.rule_name.clone(),
            s.invocations.to_string(),
            s.finding_count.to_string(),
            s.error_count.to_string(),
        ]
    })
}

/// The rule's findings in report order, evidence in sheet column order.
fn sheet_rows<'a>(result: &'a RunResult, sheet: &'a RuleSheet) -> impl Iterator<Item = Vec<String>> + 'a {
    result
        .findings
        .iter()
        .filter(move |f| f.rule_name == sheet.rule_name)
        .map(move |f| {
            let mut row = vec![
                f.record_id.clone(),
                f.actor_id.clone(),
                format_timestamp(f.timestamp),
                f.severity.to_string(),
                format_score(f.score),
                f.explanation.clone(),
            ];
            row.extend(
                sheet
                    .columns
                    .iter()
                    .map(|c| f.evidence.get(c).map(ToString::to_string).unwrap_or_default()),
            );
            row
        })
}

fn write_csv<'h, H, I>(path: &Path, header: H, rows: I) -> FraudResult<()>
where
    H: Iterator<Item = &'h str>,
    I: IntoIterator<Item = Vec<String>>,
{
    let io = |e: std::io::Error| FraudError::report_write(path, e);
    let file = File::create(path).map_err(io)?;
    let mut w = BufWriter::new(file);
    write_row(&mut w, header).map_err(io)?;
    for row in rows {
        write_row(&mut w, row.iter().map(String::as_str)).map_err(io)?;
    }
    w.flush().map_err(io)?;
    let file = w.into_inner().map_err(|e| io(e.into_error()))?;
    file.sync_all().map_err(io)
}

fn write_row<'a, W: Write>(w: &mut W, fields: impl Iterator<Item = &'a str>) -> std::io::Result<()> {
    let mut first = true;
    for field in fields {
        if !first {
            w.write_all(b",")?;
        }
        first = false;
        w.write_all(csv_field(field).as_bytes())?;
    }
    w.write_all(b"\r\n")
}

/// RFC 4180 quoting: only when needed, quotes doubled.
pub fn csv_field(field: &str) -> Cow<'_, str> {
    let needs_quotes = field.contains([',', '"', '\n', '\r'])
        || field.starts_with(' ')
        || field.ends_with(' ');
    if needs_quotes {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        finding::Finding,
        orchestrator::RunState,
        record::Record,
        run_result::RunMetadata,
        types::Severity,
        window::resolve_window,
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    fn result() -> RunResult {
        let record = Record::new("7:70", "3", now() - chrono::Duration::days(1));
        let finding = Finding::for_record(&record, "overbilling", Severity::Medium, 0.5, "billed, twice")
            .with_evidence("amount", 1500.0)
            .with_evidence("act_label", "Consultation");
        RunResult {
            metadata: RunMetadata {
                run_id:           "run_20240310_120000".into(),
                window:           resolve_window(7, now()).unwrap(),
                record_count:     1,
                finding_count:    1,
                correlated_count: 0,
                rule_error_count: 0,
                started_at:       now(),
                finished_at:      now(),
                status:           RunState::Completed,
            },
            findings: vec![finding],
            rule_stats: vec![],
            rule_failures: vec![],
            rule_sheets: vec![
                RuleSheet::new("overbilling", &["act_label", "amount", "official_tariff"]),
                RuleSheet::new("velocity_check", &["burst_claims"]),
            ],
        }
    }

    fn entries(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn csv_quotes_only_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn timestamps_carry_an_explicit_offset() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 8, 5, 9).unwrap();
        assert_eq!(format_timestamp(ts), "2024-03-01T08:05:09+00:00");
        assert_eq!(format_score(0.5), "0.5000");
    }

    #[test]
    fn rule_sheets_carry_evidence_columns() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ReportWriter::new(tmp.path()).commit(&result()).unwrap();

        let sheet = fs::read_to_string(dir.join(BY_RULE_DIR).join("overbilling.csv")).unwrap();
        assert_eq!(
            sheet,
            "record_id,actor_id,timestamp,severity,score,explanation,act_label,amount,official_tariff\r\n\
             7:70,3,2024-03-09T12:00:00+00:00,medium,0.5000,\"billed, twice\",Consultation,1500,\r\n"
        );
        // A rule without findings still gets its header-only sheet.
        let empty = fs::read_to_string(dir.join(BY_RULE_DIR).join("velocity_check.csv")).unwrap();
        assert_eq!(empty, "record_id,actor_id,timestamp,severity,score,explanation,burst_claims\r\n");
    }

    #[test]
    fn collision_after_staging_discards_the_staging_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(tmp.path());
        let final_path = writer.final_path("run_20240310_120000");

        // Another writer takes the name while this one is still staging.
        let err = writer
            .commit_with(&result(), |staging| {
                assert!(staging.join(FINDINGS_FILE).is_file());
                fs::create_dir(&final_path).map_err(|e| FraudError::report_write(&final_path, e))
            })
            .unwrap_err();

        assert!(matches!(err, FraudError::ReportWrite { .. }));
        assert_eq!(entries(tmp.path()), vec!["run_20240310_120000".to_string()]);
        assert!(entries(&final_path).is_empty());
    }

    #[test]
    fn failure_after_staging_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(tmp.path());

        let err = writer
            .commit_with(&result(), |staging| {
                assert!(staging.join(BY_RULE_DIR).join("overbilling.csv").is_file());
                Err(FraudError::report_write(staging, "disk full"))
            })
            .unwrap_err();

        assert!(err.to_string().contains("disk full"));
        assert!(entries(tmp.path()).is_empty());
    }

    #[test]
    fn rule_names_that_are_not_file_names_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let mut bad = result();
        bad.rule_sheets.push(RuleSheet::new("../escape", &[]));
        let err = ReportWriter::new(tmp.path()).commit(&bad).unwrap_err();
        assert!(matches!(err, FraudError::ReportWrite { .. }));
        assert!(entries(tmp.path()).is_empty());
    }
}
