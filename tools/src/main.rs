//! fraudscan-runner: headless trigger for fraud-detection runs.
//!
//! Usage:
//!   fraudscan-runner run [--config fraud.json] [--db admi.db | --jsonl records.jsonl]
//!                        [--days 90 | --from 2024-01-01 --to 2024-03-31]
//!                        [--out reports] [--json]
//!   fraudscan-runner seed-demo --db demo.db [--seed 42] [--days 30]
//!
//! Exit status: 0 completed, 1 failed, 2 another run in progress.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use fraudscan_core::{
    clock::SystemClock,
    config::{EngineConfig, SourceConfig, DEFAULT_PAGE_SIZE},
    demo::{seed_demo, DemoConfig},
    error::FraudError,
    orchestrator::{RunOrchestrator, RunStatus, RunSummary},
    store::ClaimStore,
    window::{parse_window_days, window_days_between},
};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

const EXIT_FAILED: u8 = 1;
const EXIT_IN_PROGRESS: u8 = 2;

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let outcome = match args.get(1).map(String::as_str) {
        Some("run") => run(&args),
        Some("seed-demo") => seed(&args).map(|()| ExitCode::SUCCESS),
        _ => {
            eprintln!("usage: fraudscan-runner <run|seed-demo> [options]");
            return ExitCode::from(EXIT_FAILED);
        }
    };
    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

fn run(args: &[String]) -> Result<ExitCode> {
    let config = build_config(args)?;
    let days = window_days(args, config.window_days)?;
    let out_dir = flag(args, "--out").map(PathBuf::from).unwrap_or_else(|| config.out_dir.clone());
    let json = args.iter().any(|a| a == "--json");
    log::info!("window {days} days, reports under {}", out_dir.display());

    let orchestrator = RunOrchestrator::from_config(config, Arc::new(SystemClock))?;
    let summary = match orchestrator.start_run(days, &out_dir) {
        Ok(summary) => summary,
        Err(err @ FraudError::RunInProgress { .. }) => {
            eprintln!("{err}");
            return Ok(ExitCode::from(EXIT_IN_PROGRESS));
        }
        Err(err) => return Err(err.into()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(match summary.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Failed { .. } => ExitCode::from(EXIT_FAILED),
    })
}

/// File config, then ADMI_* env vars, then command-line flags.
fn build_config(args: &[String]) -> Result<EngineConfig> {
    let config = match flag(args, "--config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let mut config = config.apply_env()?;

    match (flag(args, "--db"), flag(args, "--jsonl")) {
        (Some(_), Some(_)) => bail!("--db and --jsonl are mutually exclusive"),
        (Some(db), None) => {
            let page_size = match &config.source {
                SourceConfig::Sqlite { page_size, .. } => *page_size,
                SourceConfig::Jsonl { .. } => DEFAULT_PAGE_SIZE,
            };
            config.source = SourceConfig::Sqlite { path: PathBuf::from(db), page_size };
        }
        (None, Some(jsonl)) => config.source = SourceConfig::Jsonl { path: PathBuf::from(jsonl) },
        (None, None) => {}
    }
    Ok(config)
}

/// `--days` wins; otherwise `--from/--to` count inclusive calendar days.
/// The window always ends at the moment the run starts.
fn window_days(args: &[String], default: i64) -> Result<i64> {
    if let Some(raw) = flag(args, "--days") {
        return Ok(parse_window_days(raw)?);
    }
    match (flag(args, "--from"), flag(args, "--to")) {
        (Some(from), Some(to)) => {
            let from = parse_date(from)?;
            let to = parse_date(to)?;
            Ok(window_days_between(from, to)?)
        }
        (None, None) => Ok(default),
        _ => bail!("--from and --to must be given together"),
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("invalid date '{raw}', expected YYYY-MM-DD"))
}

fn seed(args: &[String]) -> Result<()> {
    let Some(db) = flag(args, "--db") else {
        bail!("seed-demo requires --db <path>");
    };
    let seed = parse_arg(args, "--seed", 42u64);
    let days = parse_arg(args, "--days", 30i64);

    let store = ClaimStore::open(db)?;
    store.migrate()?;
    if store.claim_count()? > 0 {
        bail!("{db} already holds claims; seed into an empty database");
    }
    let report = seed_demo(&store, &DemoConfig::new(seed, days, chrono::Utc::now()))?;

    println!("=== DEMO DATASET ===");
    println!("  db:        {db}");
    println!("  seed:      {seed}");
    println!("  claims:    {}", report.claims);
    println!("  lines:     {}", report.lines);
    println!("  planted:");
    for p in &report.planted {
        println!("    {:<26} structure {:<4} {}", p.rule, p.actor_id, p.detail);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("=== RUN SUMMARY ===");
    println!("  run_id:         {}", summary.run_id);
    match &summary.status {
        RunStatus::Completed => println!("  status:         completed"),
        RunStatus::Failed { component, kind, message } => {
            println!("  status:         failed");
            println!("  component:      {component}");
            println!("  error kind:     {kind}");
            println!("  message:        {message}");
        }
    }
    if let Some(window) = &summary.window {
        println!("  window:         {} .. {}", window.start(), window.end());
    }
    println!("  records:        {}", summary.record_count);
    println!("  findings:       {}", summary.finding_count);
    println!("  correlated:     {}", summary.correlated_count);
    println!("  rule errors:    {}", summary.rule_error_count);
    for failure in &summary.rule_failures {
        println!("    {} on {}: {}", failure.rule_name, failure.subject, failure.message);
    }
    if let Some(dir) = &summary.report_dir {
        println!("  report dir:     {}", dir.display());
    }
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == name).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
