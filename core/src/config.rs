//! Engine configuration.
//!
//! Loaded once at run start from `fraud.json` (every field optional),
//! then overlaid with the ADMI_* environment variables the claims
//! deployment used. `validate()` is called by the orchestrator before
//! any I/O happens.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{
    error::{FraudError, FraudResult},
    types::Severity,
    window::parse_window_days,
};

pub const DEFAULT_WINDOW_DAYS: i64 = 90;
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub window_days: i64,
    pub out_dir:     PathBuf,
    pub source:      SourceConfig,
    /// Explicit enable/disable per rule name. Rules not listed are enabled.
    pub rules:       BTreeMap<String, bool>,
    pub thresholds:  RuleThresholds,
    pub scoring:     ScoringConfig,
    pub correlation: CorrelationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_WINDOW_DAYS,
            out_dir:     PathBuf::from("reports"),
            source:      SourceConfig::default(),
            rules:       BTreeMap::new(),
            thresholds:  RuleThresholds::default(),
            scoring:     ScoringConfig::default(),
            correlation: CorrelationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Sqlite {
        path: PathBuf,
        #[serde(default = "default_page_size")]
        page_size: usize,
    },
    Jsonl {
        path: PathBuf,
    },
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Sqlite { path: PathBuf::from("admi.db"), page_size: DEFAULT_PAGE_SIZE }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleThresholds {
    /// Allowed overshoot over the official tariff (0.10 = 10 %).
    pub overbilling_tolerance_pct:   f64,
    /// Excess ratio from which overbilling is rated high.
    pub overbilling_high_excess:     f64,
    pub collusion_span_days:         i64,
    pub collusion_min_acts:          usize,
    pub collusion_min_positive_gaps: usize,
    pub usurpation_min_structures:   usize,
    pub velocity_span_minutes:       i64,
    /// Distinct claims (transaction ids), not claim lines.
    #[serde(alias = "velocity_min_records")]
    pub velocity_min_claims:         usize,
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self {
            overbilling_tolerance_pct:   0.0,
            overbilling_high_excess:     0.5,
            collusion_span_days:         7,
            collusion_min_acts:          4,
            collusion_min_positive_gaps: 2,
            usurpation_min_structures:   2,
            velocity_span_minutes:       60,
            velocity_min_claims:         10,
        }
    }
}

/// Lower bound of each severity's score band. A finding of severity S
/// scores within `[floor(S), floor(next S))`, critical up to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub low:      f64,
    pub medium:   f64,
    pub high:     f64,
    pub critical: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self { low: 0.10, medium: 0.40, high: 0.65, critical: 0.90 }
    }
}

impl ScoringConfig {
    pub fn floor(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Low      => self.low,
            Severity::Medium   => self.medium,
            Severity::High     => self.high,
            Severity::Critical => self.critical,
        }
    }

    fn ceiling(&self, severity: Severity) -> f64 {
        severity.next().map_or(1.0, |next| self.floor(next))
    }

    /// Score inside the severity band, `intensity` in [0, 1] selecting
    /// how far up the band the finding lands.
    pub fn score(&self, severity: Severity, intensity: f64) -> f64 {
        let floor = self.floor(severity);
        let span = self.ceiling(severity) - floor;
        let intensity = if intensity.is_finite() { intensity.clamp(0.0, 1.0) } else { 1.0 };
        // Stay strictly below the next band so severity and score agree.
        let value = floor + span * intensity * 0.999;
        (value * 10_000.0).round() / 10_000.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub enabled:      bool,
    pub min_findings: usize,
    pub min_severity: Severity,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self { enabled: true, min_findings: 3, min_severity: Severity::High }
    }
}

impl EngineConfig {
    /// Load from a JSON file. A missing file is a configuration error;
    /// callers wanting pure defaults use `EngineConfig::default()`.
    pub fn load(path: impl AsRef<Path>) -> FraudResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FraudError::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            FraudError::config(format!("invalid config {}: {e}", path.display()))
        })
    }

    /// Overlay ADMI_* variables from the process environment.
    pub fn apply_env(self) -> FraudResult<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay ADMI_* variables from an arbitrary lookup (tests).
    pub fn apply_env_from<F>(mut self, lookup: F) -> FraudResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("ADMI_WINDOW_DAYS") {
            self.window_days = parse_window_days(&raw)?;
        }
        if let Some(raw) = lookup("ADMI_OUT_DIR") {
            self.out_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("ADMI_DB_PATH") {
            let page_size = match &self.source {
                SourceConfig::Sqlite { page_size, .. } => *page_size,
                SourceConfig::Jsonl { .. } => DEFAULT_PAGE_SIZE,
            };
            self.source = SourceConfig::Sqlite { path: PathBuf::from(raw), page_size };
        }
        if let Some(raw) = lookup("ADMI_T2_TOL_PCT") {
            self.thresholds.overbilling_tolerance_pct = parse_env("ADMI_T2_TOL_PCT", &raw)?;
        }
        if let Some(raw) = lookup("ADMI_T3_MIN_ACTES_7J") {
            self.thresholds.collusion_min_acts = parse_env("ADMI_T3_MIN_ACTES_7J", &raw)?;
        }
        if let Some(raw) = lookup("ADMI_T3_MIN_ECARTS_7J") {
            self.thresholds.collusion_min_positive_gaps = parse_env("ADMI_T3_MIN_ECARTS_7J", &raw)?;
        }
        if let Some(raw) = lookup("ADMI_T4_MIN_STRUCTS_JOUR") {
            self.thresholds.usurpation_min_structures = parse_env("ADMI_T4_MIN_STRUCTS_JOUR", &raw)?;
        }
        Ok(self)
    }

    /// Reject settings that would make a run meaningless.
    pub fn validate(&self) -> FraudResult<()> {
        self.validate_run(self.window_days, &self.out_dir)
    }

    /// `validate`, for a run whose window and output directory are given
    /// by the caller rather than taken from this config.
    pub fn validate_run(&self, window_days: i64, out_dir: &Path) -> FraudResult<()> {
        if window_days <= 0 {
            return Err(FraudError::config(format!(
                "window_days must be positive, got {window_days}"
            )));
        }
        if out_dir.as_os_str().is_empty() {
            return Err(FraudError::config("out_dir must not be empty"));
        }
        match &self.source {
            SourceConfig::Sqlite { path, page_size } => {
                if path.as_os_str().is_empty() {
                    return Err(FraudError::config("sqlite source path must not be empty"));
                }
                if *page_size == 0 {
                    return Err(FraudError::config("sqlite page_size must be at least 1"));
                }
            }
            SourceConfig::Jsonl { path } => {
                if path.as_os_str().is_empty() {
                    return Err(FraudError::config("jsonl source path must not be empty"));
                }
            }
        }

        let t = &self.thresholds;
        if !t.overbilling_tolerance_pct.is_finite() || t.overbilling_tolerance_pct < 0.0 {
            return Err(FraudError::config("overbilling_tolerance_pct must be >= 0"));
        }
        if !t.overbilling_high_excess.is_finite() || t.overbilling_high_excess <= 0.0 {
            return Err(FraudError::config("overbilling_high_excess must be > 0"));
        }
        if t.collusion_span_days <= 0 || t.velocity_span_minutes <= 0 {
            return Err(FraudError::config("rule spans must be positive"));
        }
        if t.collusion_min_acts == 0
            || t.usurpation_min_structures == 0
            || t.velocity_min_claims == 0
        {
            return Err(FraudError::config("rule count thresholds must be at least 1"));
        }

        let s = &self.scoring;
        let floors = [s.low, s.medium, s.high, s.critical];
        if floors.iter().any(|f| !f.is_finite() || *f < 0.0 || *f >= 1.0)
            || floors.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(FraudError::config(
                "scoring floors must be strictly increasing within [0, 1)",
            ));
        }

        if self.correlation.enabled && self.correlation.min_findings == 0 {
            return Err(FraudError::config("correlation.min_findings must be at least 1"));
        }
        Ok(())
    }

    /// Whether `rule` is enabled. Unlisted rules default to enabled.
    pub fn rule_enabled(&self, rule: &str) -> bool {
        self.rules.get(rule).copied().unwrap_or(true)
    }

    /// Config with small thresholds for unit and integration tests.
    pub fn default_test() -> Self {
        Self {
            window_days: 7,
            out_dir: PathBuf::from("target/test-reports"),
            source: SourceConfig::Sqlite { path: PathBuf::from("test.db"), page_size: 2 },
            thresholds: RuleThresholds {
                velocity_min_claims: 3,
                ..RuleThresholds::default()
            },
            ..Self::default()
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> FraudResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| FraudError::config(format!("{key}='{raw}' is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_json_gives_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.window_days, DEFAULT_WINDOW_DAYS);
        assert_eq!(cfg.thresholds, RuleThresholds::default());
        assert!(cfg.rule_enabled("overbilling"));
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{
                "window_days": 30,
                "source": { "kind": "jsonl", "path": "records.jsonl" },
                "rules": { "velocity_check": false },
                "thresholds": { "collusion_min_acts": 6 },
                "correlation": { "min_severity": "medium" }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.window_days, 30);
        assert_eq!(cfg.source, SourceConfig::Jsonl { path: "records.jsonl".into() });
        assert!(!cfg.rule_enabled("velocity_check"));
        assert_eq!(cfg.thresholds.collusion_min_acts, 6);
        assert_eq!(cfg.thresholds.collusion_min_positive_gaps, 2);
        assert_eq!(cfg.correlation.min_severity, Severity::Medium);
        assert_eq!(cfg.correlation.min_findings, 3);
    }

    #[test]
    fn env_overrides_use_admi_names() {
        let env: HashMap<&str, &str> = [
            ("ADMI_WINDOW_DAYS", "14"),
            ("ADMI_T2_TOL_PCT", "0.10"),
            ("ADMI_T4_MIN_STRUCTS_JOUR", "3"),
            ("ADMI_DB_PATH", "/data/admi.db"),
        ]
        .into_iter()
        .collect();
        let cfg = EngineConfig::default()
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.window_days, 14);
        assert_eq!(cfg.thresholds.overbilling_tolerance_pct, 0.10);
        assert_eq!(cfg.thresholds.usurpation_min_structures, 3);
        assert_eq!(
            cfg.source,
            SourceConfig::Sqlite { path: "/data/admi.db".into(), page_size: DEFAULT_PAGE_SIZE }
        );
    }

    #[test]
    fn unparseable_env_window_is_a_configuration_error() {
        let err = EngineConfig::default()
            .apply_env_from(|k| (k == "ADMI_WINDOW_DAYS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, FraudError::Configuration(_)));
    }

    #[test]
    fn run_arguments_are_validated_instead_of_config_defaults() {
        let mut cfg = EngineConfig::default();
        cfg.window_days = 0;
        cfg.out_dir = PathBuf::new();
        assert!(cfg.validate().is_err());
        cfg.validate_run(7, Path::new("reports")).unwrap();
        assert!(cfg.validate_run(-1, Path::new("reports")).is_err());
        assert!(cfg.validate_run(7, Path::new("")).is_err());
    }

    #[test]
    fn legacy_velocity_threshold_name_is_accepted() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{ "thresholds": { "velocity_min_records": 4 } }"#).unwrap();
        assert_eq!(cfg.thresholds.velocity_min_claims, 4);
    }

    #[test]
    fn validate_rejects_unordered_score_bands() {
        let mut cfg = EngineConfig::default();
        cfg.scoring.high = 0.30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scores_stay_inside_their_band() {
        let s = ScoringConfig::default();
        for sev in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            let lo = s.score(sev, 0.0);
            let hi = s.score(sev, 1.0);
            assert_eq!(lo, s.floor(sev));
            assert!(hi > lo && hi <= 1.0);
            if let Some(next) = sev.next() {
                assert!(hi < s.floor(next));
            }
        }
        assert_eq!(s.score(Severity::High, f64::INFINITY), s.score(Severity::High, 1.0));
    }
}
