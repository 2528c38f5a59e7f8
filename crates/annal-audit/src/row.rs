//! Audit rows: immutable snapshots staged by the Revision Writer.

use annal_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Column name to value.
pub type ValueMap = BTreeMap<String, Value>;

/// Identifier shared by every audit row produced from one save event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Uuid(Uuid),
    Sequence(i64),
}

impl RecordId {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Uuid(u) => Value::Uuid(*u),
            Self::Sequence(n) => Value::Int(*n),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Sequence(n) => write!(f, "{}", n),
        }
    }
}

/// One row of one audit table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRow {
    /// Audit table name.
    pub table: String,

    /// Database schema (namespace) of the audit table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_schema: Option<String>,

    /// Shadow type the row instantiates.
    pub shadow_type: String,

    /// Shared record id of the save event.
    pub record_id: RecordId,

    /// Wall-clock seconds since the Unix epoch at write time.
    pub timestamp: f64,

    /// Whether the row records a deletion.
    pub is_delete: bool,

    /// Business column values, keyed by column name.
    pub values: ValueMap,

    /// Business column names in physical order.
    pub column_order: Vec<String>,
}

impl AuditRow {
    /// Value of a business column; `None` if the table has no such column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Business values in physical column order.
    pub fn ordered_values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_order
            .iter()
            .filter_map(|c| self.values.get(c).map(|v| (c.as_str(), v)))
    }
}
