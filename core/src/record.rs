//! Normalized records: one administrative event each.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{ActorId, FieldValue, RecordId};

/// Well-known attribute names produced by the claims source.
pub mod fields {
    pub const TRANSACTION_ID:        &str = "transaction_id";
    pub const LINE_ID:               &str = "line_id";
    pub const STRUCTURE_ID:          &str = "structure_id";
    pub const STRUCTURE_CODE:        &str = "structure_code";
    pub const STRUCTURE_NAME:        &str = "structure_name";
    pub const STRUCTURE_TYPE_LABEL:  &str = "structure_type_label";
    pub const BENEFICIARY_ID:        &str = "beneficiary_id";
    pub const BENEFICIARY_NAME:      &str = "beneficiary_name";
    pub const BENEFICIARY_MATRICULE: &str = "beneficiary_matricule";
    pub const BENEFICIARY_CONTACT:   &str = "beneficiary_contact";
    pub const PRESTATION_TYPE_ID:    &str = "prestation_type_id";
    pub const PRESTATION_TYPE_LABEL: &str = "prestation_type_label";
    pub const ACT_ID:                &str = "act_id";
    pub const ACT_CODE:              &str = "act_code";
    pub const ACT_LABEL:             &str = "act_label";
    pub const QUANTITY:              &str = "quantity";
    pub const EXECUTION_DATE:        &str = "execution_date";
    pub const AMOUNT:                &str = "amount";
    pub const OFFICIAL_TARIFF:       &str = "official_tariff";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id:         RecordId,
    pub actor_id:   ActorId,
    pub timestamp:  DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, FieldValue>,
}

static NULL: FieldValue = FieldValue::Null;

impl Record {
    pub fn new(id: impl Into<RecordId>, actor_id: impl Into<ActorId>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            actor_id: actor_id.into(),
            timestamp,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.attributes.insert(field.to_string(), value.into());
        self
    }

    /// Attribute value; absent attributes read as null.
    pub fn get(&self, field: &str) -> &FieldValue {
        self.attributes.get(field).unwrap_or(&NULL)
    }

    pub fn f64(&self, field: &str) -> Option<f64> {
        self.get(field).as_f64()
    }

    pub fn key(&self, field: &str) -> Option<String> {
        self.get(field).key_string()
    }

    /// Ordering key used by sources: timestamp, then id.
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.id.as_str())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self { FieldValue::Integer(v) }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self { FieldValue::Real(v) }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self { FieldValue::Text(v.to_string()) }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self { FieldValue::Text(v) }
}
