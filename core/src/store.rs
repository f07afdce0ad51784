//! SQLite persistence layer for the administrative claims dataset.
//!
//! RULE: Only store.rs talks to the database.
//! Sources and the demo seeder call store methods; they never execute
//! SQL directly.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, types::Value, Connection, OpenFlags, OptionalExtension};

use crate::{
    error::{FraudError, FraudResult},
    record::{fields, Record},
    types::FieldValue,
    window::TimeWindow,
};

/// Storage format of every timestamp column.
pub const SQL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct ClaimStore {
    conn: Connection,
}

/// Claim header row (`acte_trans`).
#[derive(Debug, Clone)]
pub struct ClaimHeader {
    pub id:                 i64,
    pub structure_id:       i64,
    pub prestation_type_id: Option<i64>,
    pub care_date:          NaiveDateTime,
    pub beneficiary_id:     Option<i64>,
}

/// Claim line row (`list_acte_acte_trans`).
#[derive(Debug, Clone)]
pub struct ClaimLine {
    pub id:             i64,
    pub transaction_id: i64,
    pub act_id:         Option<i64>,
    pub quantity:       Option<i64>,
    pub execution_date: Option<NaiveDate>,
    pub amount:         Option<f64>,
}

/// Optional parts of the claims schema, detected per database. Older
/// deployments lack some reference tables or columns; the matching
/// record attributes then read as null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimSchema {
    /// `acte_trans.id_beneficiaire`
    pub beneficiary:         bool,
    /// `adherent` names, matricule and phone
    pub beneficiary_details: bool,
    /// `structure_sante.id_type_str_sante` with `type_str_sante` labels
    pub structure_type:      bool,
    /// `type_prestation` labels
    pub prestation_type:     bool,
    /// `acte.libelle_acte`
    pub act_label:           bool,
}

impl ClaimSchema {
    /// Every optional part present, as created by `migrate`.
    pub fn full() -> Self {
        Self {
            beneficiary:         true,
            beneficiary_details: true,
            structure_type:      true,
            prestation_type:     true,
            act_label:           true,
        }
    }

    /// Names of the parts this database lacks, for logging.
    pub fn missing(&self) -> Vec<&'static str> {
        [
            (self.beneficiary, "acte_trans.id_beneficiaire"),
            (self.beneficiary_details, "adherent details"),
            (self.structure_type, "type_str_sante labels"),
            (self.prestation_type, "type_prestation labels"),
            (self.act_label, "acte.libelle_acte"),
        ]
        .into_iter()
        .filter(|(present, _)| !present)
        .map(|(_, name)| name)
        .collect()
    }
}

/// Keyset pagination cursor: the last `(timestamp, record id)` returned.
#[derive(Debug, Clone, PartialEq)]
pub struct PageCursor {
    pub timestamp: DateTime<Utc>,
    pub record_id: String,
}

impl ClaimStore {
    /// Open an existing database read-only. A missing file is reported
    /// as unavailable rather than silently created.
    pub fn open_read_only(path: &str) -> FraudResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| FraudError::SourceUnavailable(format!("{path}: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(FraudError::from_sqlite)?;
        Ok(Self { conn })
    }

    /// Open (or create) a database for writing. Used by the seeder and tests.
    pub fn open(path: &str) -> FraudResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| FraudError::SourceUnavailable(format!("{path}: {e}")))?;
        // Rollback journal, not WAL: read-only sources must be able to
        // open the file without creating -wal/-shm companions.
        conn.execute_batch("PRAGMA journal_mode=DELETE;").map_err(FraudError::from_sqlite)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(FraudError::from_sqlite)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> FraudResult<Self> {
        let conn = Connection::open_in_memory().map_err(FraudError::from_sqlite)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(FraudError::from_sqlite)?;
        Ok(Self { conn })
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> FraudResult<()> {
        self.conn
            .execute_batch(include_str!("../../migrations/001_admi_schema.sql"))
            .map_err(FraudError::from_sqlite)?;
        Ok(())
    }

    pub fn begin(&self) -> FraudResult<()> {
        self.conn.execute_batch("BEGIN;").map_err(FraudError::from_sqlite)
    }

    pub fn commit(&self) -> FraudResult<()> {
        self.conn.execute_batch("COMMIT;").map_err(FraudError::from_sqlite)
    }

    pub fn rollback(&self) -> FraudResult<()> {
        self.conn.execute_batch("ROLLBACK;").map_err(FraudError::from_sqlite)
    }

    // ── Reference data ─────────────────────────────────────────

    pub fn insert_structure_type(&self, id: i64, label: &str) -> FraudResult<()> {
        self.conn
            .execute(
                "INSERT INTO type_str_sante (id_type_str_sante, libelle_type_structure_sante)
                 VALUES (?1, ?2)",
                params![id, label],
            )
            .map_err(FraudError::from_sqlite)?;
        Ok(())
    }

    pub fn insert_prestation_type(&self, id: i64, label: &str, code: &str) -> FraudResult<()> {
        self.conn
            .execute(
                "INSERT INTO type_prestation (id_type_prest, libelle_type_prestation, code_prestation)
                 VALUES (?1, ?2, ?3)",
                params![id, label, code],
            )
            .map_err(FraudError::from_sqlite)?;
        Ok(())
    }

    pub fn insert_structure(&self, id: i64, name: &str, type_id: Option<i64>) -> FraudResult<()> {
        let code = format!("S{id:05}");
        self.conn
            .execute(
                "INSERT INTO structure (code_structure, nom_structure) VALUES (?1, ?2)",
                params![code, name],
            )
            .map_err(FraudError::from_sqlite)?;
        self.conn
            .execute(
                "INSERT INTO structure_sante (id_structure, str_id_structure, id_type_str_sante)
                 VALUES (?1, ?2, ?3)",
                params![id, code, type_id],
            )
            .map_err(FraudError::from_sqlite)?;
        Ok(())
    }

    pub fn insert_beneficiary(&self, id: i64, last_name: &str, first_names: &str) -> FraudResult<()> {
        self.conn
            .execute(
                "INSERT INTO adherent (id_adherent, num_bnf, matricule, nom, prenoms, telephone)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    format!("B{id:06}"),
                    format!("M{id:06}"),
                    last_name,
                    first_names,
                    format!("+225 07 {:02} {:02} {:02}", id / 10000 % 100, id / 100 % 100, id % 100),
                ],
            )
            .map_err(FraudError::from_sqlite)?;
        Ok(())
    }

    pub fn insert_act(&self, id: i64, code: &str, label: &str) -> FraudResult<()> {
        self.conn
            .execute(
                "INSERT INTO acte (id_acte, code_acte, libelle_acte) VALUES (?1, ?2, ?3)",
                params![id, code, label],
            )
            .map_err(FraudError::from_sqlite)?;
        Ok(())
    }

    /// Tariff for an act under one agreement amendment; the highest
    /// amendment id is the one in force.
    pub fn insert_tariff(&self, act_id: i64, amendment_id: i64, amount: f64) -> FraudResult<()> {
        self.conn
            .execute(
                "INSERT INTO actes_convention (id_avenant, id_acte, forfait_acte_convention)
                 VALUES (?1, ?2, ?3)",
                params![amendment_id, act_id, amount],
            )
            .map_err(FraudError::from_sqlite)?;
        Ok(())
    }

    // ── Claims ─────────────────────────────────────────────────

    pub fn insert_claim(&self, h: &ClaimHeader) -> FraudResult<()> {
        self.conn
            .execute(
                "INSERT INTO acte_trans (id_acte_trans, id_structure, id_type_prest, date_soin, id_beneficiaire)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    h.id,
                    h.structure_id,
                    h.prestation_type_id,
                    h.care_date.format(SQL_TIMESTAMP_FORMAT).to_string(),
                    h.beneficiary_id,
                ],
            )
            .map_err(FraudError::from_sqlite)?;
        Ok(())
    }

    pub fn insert_claim_line(&self, l: &ClaimLine) -> FraudResult<()> {
        self.conn
            .execute(
                "INSERT INTO list_acte_acte_trans (
                    id_list_acte_acte_trans, id_acte_trans, id_acte, quantite,
                    date_execution_acte, montant_acte
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    l.id,
                    l.transaction_id,
                    l.act_id,
                    l.quantity,
                    l.execution_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    l.amount,
                ],
            )
            .map_err(FraudError::from_sqlite)?;
        Ok(())
    }

    pub fn claim_count(&self) -> FraudResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM acte_trans", [], |row| row.get(0))
            .map_err(FraudError::from_sqlite)
    }

    pub fn claim_line_count(&self) -> FraudResult<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM list_acte_acte_trans", [], |row| row.get(0))
            .map_err(FraudError::from_sqlite)
    }

    fn table_columns(&self, table: &str) -> FraudResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT lower(name) FROM pragma_table_info(?1)")
            .map_err(FraudError::from_sqlite)?;
        let names = stmt
            .query_map([table], |row| row.get::<_, String>(0))
            .map_err(FraudError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(FraudError::from_sqlite)?;
        Ok(names)
    }

    /// Which optional schema parts this database has. Claim headers,
    /// claim lines, structures, acts and tariffs are required.
    pub fn detect_schema(&self) -> FraudResult<ClaimSchema> {
        let has = |cols: &[String], wanted: &[&str]| wanted.iter().all(|w| cols.iter().any(|c| c == w));

        let claims = self.table_columns("acte_trans")?;
        if claims.is_empty() {
            return Err(FraudError::SourceQuery("table acte_trans does not exist".into()));
        }
        let adherent = self.table_columns("adherent")?;
        let structure = self.table_columns("structure_sante")?;
        let structure_types = self.table_columns("type_str_sante")?;
        let prestation_types = self.table_columns("type_prestation")?;
        let acts = self.table_columns("acte")?;

        Ok(ClaimSchema {
            beneficiary:         has(&claims, &["id_beneficiaire"]),
            beneficiary_details: has(&adherent, &["id_adherent", "nom", "prenoms", "matricule", "telephone"]),
            structure_type:      has(&structure, &["id_type_str_sante"])
                && has(&structure_types, &["id_type_str_sante", "libelle_type_structure_sante"]),
            prestation_type:     has(&prestation_types, &["id_type_prest", "libelle_type_prestation"]),
            act_label:           has(&acts, &["libelle_acte"]),
        })
    }

    /// The lowest claim whose care date SQLite cannot read as a date,
    /// with the stored value. Such a claim belongs to no window.
    pub fn first_undated_claim(&self) -> FraudResult<Option<(i64, Option<String>)>> {
        self.conn
            .query_row(
                "SELECT id_acte_trans, CAST(date_soin AS TEXT) FROM acte_trans
                 WHERE datetime(date_soin) IS NULL
                 ORDER BY id_acte_trans LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(FraudError::from_sqlite)
    }

    /// One page of claim records inside `window`, strictly after `cursor`,
    /// ordered by (care timestamp, record id). Each claim line becomes one
    /// record; a claim without lines becomes a single header-only record.
    pub fn fetch_claims_page(
        &self,
        window: &TimeWindow,
        cursor: Option<&PageCursor>,
        schema: ClaimSchema,
        limit: usize,
    ) -> FraudResult<Vec<Record>> {
        let sql = claims_page_sql(schema);
        let mut stmt = self.conn.prepare_cached(&sql).map_err(FraudError::from_sqlite)?;

        let start = window.start().format(SQL_TIMESTAMP_FORMAT).to_string();
        let end = window.end().format(SQL_TIMESTAMP_FORMAT).to_string();
        // The cursor replaces the window start as the index lower bound.
        let (from, after_id) = match cursor {
            Some(c) => (c.timestamp.format(SQL_TIMESTAMP_FORMAT).to_string(), c.record_id.clone()),
            None => (start, String::new()),
        };

        let rows = stmt
            .query_map(
                params![from, end, after_id, limit as i64],
                |row| {
                    Ok(RawClaimRow {
                        record_id:             row.get(0)?,
                        care_date:             row.get(1)?,
                        transaction_id:        row.get(2)?,
                        line_id:               row.get(3)?,
                        structure_id:          row.get(4)?,
                        structure_code:        row.get(5)?,
                        structure_name:        row.get(6)?,
                        structure_type_label:  row.get(7)?,
                        beneficiary_id:        row.get(8)?,
                        beneficiary_name:      row.get(9)?,
                        beneficiary_matricule: row.get(10)?,
                        beneficiary_contact:   row.get(11)?,
                        prestation_type:       row.get(12)?,
                        prestation_type_label: row.get(13)?,
                        act_id:                row.get(14)?,
                        act_code:              row.get(15)?,
                        act_label:             row.get(16)?,
                        quantity:              row.get(17)?,
                        execution_date:        row.get(18)?,
                        amount:                row.get(19)?,
                        official_tariff:       row.get(20)?,
                    })
                },
            )
            .map_err(FraudError::from_sqlite)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(FraudError::from_sqlite)?;

        rows.into_iter().map(RawClaimRow::into_record).collect()
    }
}

struct RawClaimRow {
    record_id:             String,
    care_date:             String,
    transaction_id:        Value,
    line_id:               Value,
    structure_id:          Value,
    structure_code:        Value,
    structure_name:        Value,
    structure_type_label:  Value,
    beneficiary_id:        Value,
    beneficiary_name:      Value,
    beneficiary_matricule: Value,
    beneficiary_contact:   Value,
    prestation_type:       Value,
    prestation_type_label: Value,
    act_id:                Value,
    act_code:              Value,
    act_label:             Value,
    quantity:              Value,
    execution_date:        Value,
    amount:                Value,
    official_tariff:       Value,
}

impl RawClaimRow {
    fn into_record(self) -> FraudResult<Record> {
        let timestamp = NaiveDateTime::parse_from_str(&self.care_date, SQL_TIMESTAMP_FORMAT)
            .map_err(|e| {
                FraudError::SourceQuery(format!(
                    "record {}: bad care date '{}': {e}",
                    self.record_id, self.care_date
                ))
            })?
            .and_utc();
        let structure = FieldValue::from(self.structure_id);
        let actor_id = structure.key_string().ok_or_else(|| {
            FraudError::SourceQuery(format!("record {} has no structure", self.record_id))
        })?;

        Ok(Record::new(self.record_id, actor_id, timestamp)
            .with(fields::TRANSACTION_ID, FieldValue::from(self.transaction_id))
            .with(fields::LINE_ID, FieldValue::from(self.line_id))
            .with(fields::STRUCTURE_ID, structure)
            .with(fields::STRUCTURE_CODE, FieldValue::from(self.structure_code))
            .with(fields::STRUCTURE_NAME, FieldValue::from(self.structure_name))
            .with(fields::STRUCTURE_TYPE_LABEL, FieldValue::from(self.structure_type_label))
            .with(fields::BENEFICIARY_ID, FieldValue::from(self.beneficiary_id))
            .with(fields::BENEFICIARY_NAME, FieldValue::from(self.beneficiary_name))
            .with(fields::BENEFICIARY_MATRICULE, FieldValue::from(self.beneficiary_matricule))
            .with(fields::BENEFICIARY_CONTACT, FieldValue::from(self.beneficiary_contact))
            .with(fields::PRESTATION_TYPE_ID, FieldValue::from(self.prestation_type))
            .with(fields::PRESTATION_TYPE_LABEL, FieldValue::from(self.prestation_type_label))
            .with(fields::ACT_ID, FieldValue::from(self.act_id))
            .with(fields::ACT_CODE, FieldValue::from(self.act_code))
            .with(fields::ACT_LABEL, FieldValue::from(self.act_label))
            .with(fields::QUANTITY, FieldValue::from(self.quantity))
            .with(fields::EXECUTION_DATE, FieldValue::from(self.execution_date))
            .with(fields::AMOUNT, FieldValue::from(self.amount))
            .with(fields::OFFICIAL_TARIFF, FieldValue::from(self.official_tariff)))
    }
}

const RECORD_ID_EXPR: &str =
    "CAST(t.id_acte_trans AS TEXT) || COALESCE(':' || l.id_list_acte_acte_trans, '')";

/// Care dates are normalised through `datetime()` so date-only values
/// compare as midnight. Filtering and ordering on that exact expression
/// lets `idx_acte_trans_care` drive the scan from the cursor onward; only
/// records sharing one timestamp are sorted by id. The latest amendment's
/// tariff is joined per act.
///
/// ?1 lower bound (window start or cursor timestamp), ?2 window end,
/// ?3 cursor record id ('' for the first page), ?4 page size.
fn claims_page_sql(schema: ClaimSchema) -> String {
    let mut joins = Vec::new();

    let (benef_id, benef_name, benef_matricule, benef_contact) = match (schema.beneficiary, schema.beneficiary_details) {
        (true, true) => {
            joins.push("LEFT JOIN adherent ad ON ad.id_adherent = t.id_beneficiaire");
            (
                "t.id_beneficiaire",
                "NULLIF(TRIM(COALESCE(ad.nom, '') || ' ' || COALESCE(ad.prenoms, '')), '')",
                "ad.matricule",
                "ad.telephone",
            )
        }
        (true, false) => ("t.id_beneficiaire", "NULL", "NULL", "NULL"),
        (false, _) => ("NULL", "NULL", "NULL", "NULL"),
    };
    let structure_type = if schema.structure_type {
        joins.push("LEFT JOIN type_str_sante ts ON ts.id_type_str_sante = ss.id_type_str_sante");
        "ts.libelle_type_structure_sante"
    } else {
        "NULL"
    };
    let prestation_type = if schema.prestation_type {
        joins.push("LEFT JOIN type_prestation tp ON tp.id_type_prest = t.id_type_prest");
        "tp.libelle_type_prestation"
    } else {
        "NULL"
    };
    let act_label = if schema.act_label { "ac.libelle_acte" } else { "NULL" };
    let joins = joins.join("\n            ");

    format!(
        "SELECT
            {RECORD_ID_EXPR}            AS record_id,
            datetime(t.date_soin)       AS care_date,
            t.id_acte_trans,
            l.id_list_acte_acte_trans,
            t.id_structure,
            ss.str_id_structure,
            st.nom_structure,
            {structure_type},
            {benef_id},
            {benef_name},
            {benef_matricule},
            {benef_contact},
            t.id_type_prest,
            {prestation_type},
            l.id_acte,
            ac.code_acte,
            {act_label},
            l.quantite,
            l.date_execution_acte,
            l.montant_acte,
            (SELECT c.forfait_acte_convention FROM actes_convention c
              WHERE c.id_acte = l.id_acte
              ORDER BY c.id_avenant DESC LIMIT 1)
         FROM acte_trans t
            LEFT JOIN list_acte_acte_trans l ON l.id_acte_trans = t.id_acte_trans
            LEFT JOIN structure_sante ss ON ss.id_structure = t.id_structure
            LEFT JOIN structure st ON st.code_structure = ss.str_id_structure
            LEFT JOIN acte ac ON ac.id_acte = l.id_acte
            {joins}
         WHERE datetime(t.date_soin) >= ?1 AND datetime(t.date_soin) < ?2
           AND (datetime(t.date_soin) > ?1 OR {RECORD_ID_EXPR} > ?3)
         ORDER BY datetime(t.date_soin) ASC, record_id ASC
         LIMIT ?4"
    )
}
