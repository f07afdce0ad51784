//! Synthetic claims dataset with planted fraud, for demos and tests.
//!
//! Ordinary claims are billed at or under tariff by each beneficiary's
//! home structure, so on their own they trip no rule. On top of that the
//! seeder plants one instance of every pattern the built-in rules look
//! for, all inside the last week before the anchor instant.

use anyhow::{ensure, Result};
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Utc};

use crate::{
    rng::{DemoRng, RngBank, StreamSlot},
    rules::{
        claim_lines::{MISSING_EXECUTION_DATE, OVERBILLING, TRANSACTION_WITHOUT_LINES},
        collusion::COLLUSION_PATTERN,
        identity::IDENTITY_USURPATION,
        velocity::VELOCITY_CHECK,
    },
    store::{ClaimHeader, ClaimLine, ClaimStore},
};

/// Earliest planted event sits this many days before the anchor.
pub const MIN_DEMO_DAYS: i64 = 7;

const ACTS: &[(&str, &str, f64)] = &[
    ("CS01", "Consultation generaliste", 5_000.0),
    ("CS02", "Consultation specialiste", 10_000.0),
    ("LB10", "Numeration formule sanguine", 4_500.0),
    ("LB22", "Glycemie", 2_000.0),
    ("RX05", "Radiographie thorax", 15_000.0),
    ("EC03", "Echographie abdominale", 25_000.0),
    ("PH01", "Pansement simple", 1_500.0),
    ("SO12", "Soins infirmiers", 3_000.0),
];

const LAST_NAMES: &[&str] = &[
    "Kouassi", "Traore", "Diallo", "Kone", "Yao", "Bamba", "Ouattara", "Coulibaly",
    "Nguessan", "Toure", "Kouame", "Sanogo", "Aka", "Diabate", "Brou", "Kra",
];

const FIRST_NAMES: &[&str] = &[
    "Aminata", "Koffi", "Mariam", "Yves", "Fatou", "Serge", "Awa", "Ibrahim",
    "Adjoua", "Moussa", "Esther", "Lacina", "Nadege", "Seydou", "Carine", "Drissa",
];

const STRUCTURE_KINDS: &[&str] = &["Clinique", "Centre de sante", "Polyclinique", "Cabinet medical"];
const STRUCTURE_PLACES: &[&str] = &["Cocody", "Plateau", "Yopougon", "Treichville", "Marcory", "Abobo"];

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub seed:          u64,
    /// Ordinary claims are spread over this many days before the anchor.
    pub days:          i64,
    pub structures:    i64,
    pub beneficiaries: i64,
    pub claims:        usize,
    pub anchor:        DateTime<Utc>,
}

impl DemoConfig {
    pub fn new(seed: u64, days: i64, anchor: DateTime<Utc>) -> Self {
        Self { seed, days, structures: 12, beneficiaries: 120, claims: 400, anchor }
    }
}

#[derive(Debug, Clone)]
pub struct PlantedPattern {
    pub rule:     &'static str,
    pub actor_id: String,
    pub detail:   String,
}

#[derive(Debug, Clone, Default)]
pub struct DemoReport {
    pub claims:  i64,
    pub lines:   i64,
    pub planted: Vec<PlantedPattern>,
}

struct Seeder<'a> {
    store:      &'a ClaimStore,
    next_claim: i64,
    next_line:  i64,
    planted:    Vec<PlantedPattern>,
}

impl<'a> Seeder<'a> {
    fn claim(
        &mut self,
        structure_id: i64,
        beneficiary_id: i64,
        care_date: NaiveDateTime,
    ) -> Result<i64> {
        self.next_claim += 1;
        self.store.insert_claim(&ClaimHeader {
            id: self.next_claim,
            structure_id,
            prestation_type_id: Some(1),
            care_date,
            beneficiary_id: Some(beneficiary_id),
        })?;
        Ok(self.next_claim)
    }

    fn line(&mut self, claim_id: i64, act: usize, amount: f64, executed: Option<NaiveDateTime>) -> Result<()> {
        self.next_line += 1;
        self.store.insert_claim_line(&ClaimLine {
            id: self.next_line,
            transaction_id: claim_id,
            act_id: Some(act as i64 + 1),
            quantity: Some(1),
            execution_date: executed.map(|d| d.date()),
            amount: Some(round_money(amount)),
        })?;
        Ok(())
    }

    fn plant(&mut self, rule: &'static str, actor: i64, detail: String) {
        log::debug!("planted {rule} at structure {actor}: {detail}");
        self.planted.push(PlantedPattern { rule, actor_id: actor.to_string(), detail });
    }
}

fn round_money(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

fn tariff(act: usize) -> f64 {
    ACTS.get(act).map(|a| a.2).unwrap_or(0.0)
}

/// Populate `store` (already migrated, empty) with a reproducible dataset.
pub fn seed_demo(store: &ClaimStore, config: &DemoConfig) -> Result<DemoReport> {
    ensure!(config.days >= MIN_DEMO_DAYS, "demo needs at least {MIN_DEMO_DAYS} days, got {}", config.days);
    ensure!(config.structures >= 3, "demo needs at least 3 structures");
    ensure!(config.beneficiaries >= 1, "demo needs at least one beneficiary");

    let bank = RngBank::new(config.seed);
    store.begin()?;
    let report = match seed_all(store, config, &bank) {
        Ok(report) => report,
        Err(e) => {
            if let Err(rollback) = store.rollback() {
                log::warn!("rollback after failed seed also failed: {rollback}");
            }
            return Err(e.context("seeding demo dataset"));
        }
    };
    store.commit()?;
    log::info!(
        "seeded {} claims / {} lines with {} planted patterns (seed {})",
        report.claims,
        report.lines,
        report.planted.len(),
        config.seed
    );
    Ok(report)
}

fn seed_all(store: &ClaimStore, config: &DemoConfig, bank: &RngBank) -> Result<DemoReport> {
    let mut reference = bank.stream(StreamSlot::Reference);
    let n = config.structures;

    for (idx, (code, label, price)) in ACTS.iter().enumerate() {
        let act_id = idx as i64 + 1;
        store.insert_act(act_id, code, label)?;
        // Amendment 1 is superseded; ordinary billing follows amendment 2.
        store.insert_tariff(act_id, 1, round_money(price * 0.8))?;
        store.insert_tariff(act_id, 2, *price)?;
    }
    for (idx, kind) in STRUCTURE_KINDS.iter().enumerate() {
        store.insert_structure_type(idx as i64 + 1, kind)?;
    }
    store.insert_prestation_type(1, "Ambulatoire", "AMB")?;
    // Three extra structures host the planted velocity, collusion and
    // identity patterns.
    for id in 1..=n + 3 {
        let (kind, name) = structure_profile(&mut reference, id);
        store.insert_structure(id, &name, Some(kind))?;
    }
    for id in 1..=config.beneficiaries + 3 {
        let last = reference.pick(LAST_NAMES).copied().unwrap_or("Doe");
        let first = reference.pick(FIRST_NAMES).copied().unwrap_or("Jane");
        store.insert_beneficiary(id, last, first)?;
    }

    let mut seeder = Seeder { store, next_claim: 0, next_line: 0, planted: Vec::new() };
    seed_ordinary(&mut seeder, config, &mut bank.stream(StreamSlot::Claims))?;
    seed_planted(&mut seeder, config, &mut bank.stream(StreamSlot::Planted))?;

    Ok(DemoReport {
        claims:  store.claim_count()?,
        lines:   store.claim_line_count()?,
        planted: seeder.planted,
    })
}

/// Structure type id (1-based into STRUCTURE_KINDS) and display name.
fn structure_profile(rng: &mut DemoRng, id: i64) -> (i64, String) {
    let kind = rng.pick(STRUCTURE_KINDS).copied().unwrap_or(STRUCTURE_KINDS[0]);
    let place = rng.pick(STRUCTURE_PLACES).copied().unwrap_or("Abidjan");
    let type_id = STRUCTURE_KINDS.iter().position(|k| *k == kind).unwrap_or(0) as i64 + 1;
    (type_id, format!("{kind} {place} {id}"))
}

fn seed_ordinary(s: &mut Seeder<'_>, config: &DemoConfig, rng: &mut DemoRng) -> Result<()> {
    let span_secs = (config.days * 86_400 - 3_600).max(1);
    let start = config.anchor - Duration::days(config.days);

    let mut dates: Vec<NaiveDateTime> = (0..config.claims)
        .map(|_| (start + Duration::seconds(rng.between(0, span_secs))).naive_utc())
        .collect();
    dates.sort();

    for care_date in dates {
        let beneficiary = rng.between(1, config.beneficiaries + 1);
        // Each beneficiary is always treated by the same home structure.
        let structure = (beneficiary - 1) % config.structures + 1;
        let claim = s.claim(structure, beneficiary, care_date)?;
        for _ in 0..rng.between(1, 4) {
            let act = rng.between(0, ACTS.len() as i64) as usize;
            let amount = tariff(act) * rng.discount(0.15);
            s.line(claim, act, amount, Some(care_date))?;
        }
    }
    Ok(())
}

fn seed_planted(s: &mut Seeder<'_>, config: &DemoConfig, rng: &mut DemoRng) -> Result<()> {
    let n = config.structures;
    // Planted events hang off midnight so a same-day pattern never
    // straddles two UTC dates, whatever time the anchor is.
    let midnight = config.anchor.date_naive().and_time(NaiveTime::MIN);
    let day = |back: i64, hour: i64| midnight - Duration::days(back) + Duration::hours(hour);
    let home_patient = |structure: i64| structure;

    // Claims with no lines.
    for structure in [1, 2] {
        s.claim(structure, home_patient(structure), day(3, 2))?;
        s.plant(TRANSACTION_WITHOUT_LINES, structure, "claim header without acts".into());
    }

    // Lines never executed.
    for structure in [2, 3, 3] {
        let claim = s.claim(structure, home_patient(structure), day(4, 3))?;
        s.line(claim, 0, tariff(0), None)?;
        s.plant(MISSING_EXECUTION_DATE, structure, "act billed without execution date".into());
    }

    // Billing above tariff: one moderate, one gross.
    for (factor, act) in [(1.3, 1usize), (2.5, 4)] {
        let claim = s.claim(1, home_patient(1), day(2, 4))?;
        s.line(claim, act, tariff(act) * factor, Some(day(2, 4)))?;
        s.plant(OVERBILLING, 1, format!("{} billed at {factor}x tariff", ACTS[act].0));
    }

    // Velocity: a dozen claims within an hour at one structure.
    let burst = n + 1;
    let burst_patient = config.beneficiaries + 1;
    for i in 0..12 {
        let at = day(2, 9) + Duration::minutes(i * 4 + rng.between(0, 3));
        let claim = s.claim(burst, burst_patient, at)?;
        let act = rng.between(0, ACTS.len() as i64) as usize;
        s.line(claim, act, tariff(act), Some(at))?;
    }
    s.plant(VELOCITY_CHECK, burst, "12 claims in under an hour".into());

    // Collusion: the same patient every day, always billed above tariff.
    let colluding = n + 2;
    let accomplice = config.beneficiaries + 2;
    for back in (2..=6).rev() {
        let claim = s.claim(colluding, accomplice, day(back, 10))?;
        s.line(claim, 1, tariff(1) * 1.25, Some(day(back, 10)))?;
    }
    s.plant(COLLUSION_PATTERN, colluding, "5 overbilled acts in 5 days for one beneficiary".into());

    // Identity usurpation: one card used at three structures on one day.
    let victim = config.beneficiaries + 3;
    let mut structures = vec![1, 2, n + 3];
    rng.shuffle(&mut structures);
    for (slot, structure) in structures.iter().enumerate() {
        let at = day(3, 8 + 3 * slot as i64);
        let claim = s.claim(*structure, victim, at)?;
        s.line(claim, 0, tariff(0), Some(at))?;
    }
    // The finding is anchored on the first visit of the day.
    let first = structures.first().copied().unwrap_or(1);
    s.plant(IDENTITY_USURPATION, first, format!("beneficiary {victim} seen at 3 structures"));
    Ok(())
}
