//! Collusion between a care structure and a beneficiary: many acts in a
//! short span, several of them billed above the official tariff.

use chrono::Duration;

use crate::{
    config::ScoringConfig,
    finding::{evidence, timestamp_text, Finding},
    record::{fields, Record},
    rules::{DetectionRule, RuleResult, RuleScope, Subject},
    types::Severity,
    window::TimeWindow,
};

pub const COLLUSION_PATTERN: &str = "collusion_pattern";

pub struct CollusionPatternRule {
    span:              Duration,
    span_days:         i64,
    min_acts:          usize,
    min_positive_gaps: usize,
    scoring:           ScoringConfig,
}

impl CollusionPatternRule {
    pub fn new(span_days: i64, min_acts: usize, min_positive_gaps: usize, scoring: ScoringConfig) -> Self {
        Self {
            span: Duration::days(span_days),
            span_days,
            min_acts,
            min_positive_gaps,
            scoring,
        }
    }
}

/// The pair under suspicion, copied from the latest act.
const PARTIES: &[&str] = &[
    fields::STRUCTURE_ID,
    fields::STRUCTURE_NAME,
    fields::STRUCTURE_TYPE_LABEL,
    fields::BENEFICIARY_ID,
    fields::BENEFICIARY_NAME,
    fields::BENEFICIARY_MATRICULE,
];

const EVIDENCE: &[&str] = &[
    fields::STRUCTURE_ID,
    fields::STRUCTURE_NAME,
    fields::STRUCTURE_TYPE_LABEL,
    fields::BENEFICIARY_ID,
    fields::BENEFICIARY_NAME,
    fields::BENEFICIARY_MATRICULE,
    evidence::PERIOD_START,
    evidence::PERIOD_END,
    evidence::ACT_COUNT,
    evidence::POSITIVE_GAP_COUNT,
];

/// Billed above tariff; a missing tariff counts as zero.
fn positive_gap(record: &Record) -> bool {
    match record.f64(fields::AMOUNT) {
        Some(amount) => amount - record.f64(fields::OFFICIAL_TARIFF).unwrap_or(0.0) > 0.0,
        None => false,
    }
}

fn label(record: &Record, name: &str, id: &str) -> String {
    match (record.key(name), record.key(id)) {
        (Some(n), Some(i)) => format!("{n} ({i})"),
        (None, Some(i)) => i,
        (Some(n), None) => n,
        (None, None) => "?".to_string(),
    }
}

/// Densest qualifying span found in a group.
struct Span {
    first: usize,
    last:  usize,
    gaps:  usize,
}

impl DetectionRule for CollusionPatternRule {
    fn name(&self) -> &'static str {
        COLLUSION_PATTERN
    }

    fn scope(&self) -> RuleScope {
        RuleScope::Grouped
    }

    fn evidence_fields(&self) -> &'static [&'static str] {
        EVIDENCE
    }

    fn group_key(&self, record: &Record) -> Option<String> {
        if record.get(fields::LINE_ID).is_null() {
            return None;
        }
        let structure = record.key(fields::STRUCTURE_ID)?;
        let beneficiary = record.key(fields::BENEFICIARY_ID)?;
        Some(format!("{structure}|{beneficiary}"))
    }

    fn evaluate(&self, subject: Subject<'_>, _window: &TimeWindow) -> RuleResult {
        let Subject::Group { records, .. } = subject else {
            return Err(format!("{} expects a record group", self.name()));
        };

        // Trailing span [t - span, t] ending at each record.
        let mut best: Option<Span> = None;
        let mut first = 0;
        let mut gaps_in_span = 0;
        for (last, record) in records.iter().enumerate() {
            if positive_gap(record) {
                gaps_in_span += 1;
            }
            while record.timestamp - records[first].timestamp > self.span {
                if positive_gap(&records[first]) {
                    gaps_in_span -= 1;
                }
                first += 1;
            }
            let acts = last - first + 1;
            if acts < self.min_acts || gaps_in_span < self.min_positive_gaps {
                continue;
            }
            let better = match &best {
                None => true,
                Some(b) => (gaps_in_span, acts) > (b.gaps, b.last - b.first + 1),
            };
            if better {
                best = Some(Span { first, last, gaps: gaps_in_span });
            }
        }

        let Some(span) = best else {
            return Ok(vec![]);
        };
        let members = &records[span.first..=span.last];
        let anchor = records[span.last];
        let acts = members.len();
        let intensity = span.gaps as f64 / acts as f64;

        let explanation = format!(
            "Structure {} and beneficiary {}: {} acts between {} and {}, {} billed above tariff \
             (thresholds: {} acts, {} above tariff within {} days)",
            label(anchor, fields::STRUCTURE_NAME, fields::STRUCTURE_ID),
            label(anchor, fields::BENEFICIARY_NAME, fields::BENEFICIARY_ID),
            acts,
            members[0].timestamp.format("%Y-%m-%d"),
            anchor.timestamp.format("%Y-%m-%d"),
            span.gaps,
            self.min_acts,
            self.min_positive_gaps,
            self.span_days,
        );
        let related = members[..acts - 1].iter().map(|r| r.id.clone()).collect();

        Ok(vec![Finding::for_record(
            anchor,
            self.name(),
            Severity::High,
            self.scoring.score(Severity::High, intensity),
            explanation,
        )
        .with_related(related)
        .with_fields_from(anchor, PARTIES)
        .with_evidence(evidence::PERIOD_START, timestamp_text(members[0].timestamp))
        .with_evidence(evidence::PERIOD_END, timestamp_text(anchor.timestamp))
        .with_evidence(evidence::ACT_COUNT, acts as i64)
        .with_evidence(evidence::POSITIVE_GAP_COUNT, span.gaps as i64)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{types::FieldValue, window::resolve_window};
    use chrono::{TimeZone, Utc};

    fn act(id: &str, day: u32, amount: f64, tariff: f64) -> Record {
        Record::new(id, "5", Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap())
            .with(fields::LINE_ID, 1i64)
            .with(fields::STRUCTURE_ID, 5i64)
            .with(fields::BENEFICIARY_ID, 9i64)
            .with(fields::AMOUNT, amount)
            .with(fields::OFFICIAL_TARIFF, tariff)
    }

    fn evaluate(records: &[Record]) -> Vec<Finding> {
        let rule = CollusionPatternRule::new(7, 4, 2, ScoringConfig::default());
        let window = resolve_window(60, Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap()).unwrap();
        let members: Vec<&Record> = records.iter().collect();
        rule.evaluate(Subject::Group { key: "5|9", records: &members }, &window).unwrap()
    }

    #[test]
    fn four_acts_in_a_week_with_two_overcharges_fire_once() {
        let records = vec![
            act("a", 1, 100.0, 100.0),
            act("b", 3, 150.0, 100.0),
            act("c", 5, 100.0, 100.0),
            act("d", 7, 180.0, 100.0),
        ];
        let found = evaluate(&records);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].record_id, "d");
        assert_eq!(found[0].related, vec!["a", "b", "c"]);
        assert_eq!(found[0].severity, Severity::High);

        let ev = &found[0].evidence;
        assert_eq!(ev[evidence::ACT_COUNT], FieldValue::Integer(4));
        assert_eq!(ev[evidence::POSITIVE_GAP_COUNT], FieldValue::Integer(2));
        assert_eq!(ev[evidence::PERIOD_START], FieldValue::Text("2024-03-01T09:00:00+00:00".into()));
        assert_eq!(ev[evidence::PERIOD_END], FieldValue::Text("2024-03-07T09:00:00+00:00".into()));
        assert_eq!(ev[fields::BENEFICIARY_ID], FieldValue::Integer(9));
        assert_eq!(ev.len(), EVIDENCE.len());
    }

    #[test]
    fn acts_spread_over_more_than_the_span_do_not_fire() {
        let records = vec![
            act("a", 1, 150.0, 100.0),
            act("b", 9, 150.0, 100.0),
            act("c", 17, 150.0, 100.0),
            act("d", 25, 150.0, 100.0),
        ];
        assert!(evaluate(&records).is_empty());
    }

    #[test]
    fn too_few_overcharges_do_not_fire() {
        let records = vec![
            act("a", 1, 100.0, 100.0),
            act("b", 2, 100.0, 100.0),
            act("c", 3, 100.0, 100.0),
            act("d", 4, 180.0, 100.0),
        ];
        assert!(evaluate(&records).is_empty());
    }

    #[test]
    fn headers_without_lines_are_not_grouped() {
        let rule = CollusionPatternRule::new(7, 4, 2, ScoringConfig::default());
        let mut header = act("h", 1, 0.0, 0.0);
        header.attributes.remove(fields::LINE_ID);
        assert_eq!(rule.group_key(&header), None);
        assert_eq!(rule.group_key(&act("x", 1, 1.0, 1.0)), Some("5|9".to_string()));
    }
}
