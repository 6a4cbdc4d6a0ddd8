//! Location row shapes.
//!
//! A location owns one address row; the address columns are flattened into
//! the location the way the read query joins them.

use locsvc_db::{DbResult, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fields a caller supplies to create or update a location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewLocation {
    pub name: String,
    pub description: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

/// A stored location with its address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub address_id: Option<Uuid>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

impl Location {
    /// Decode a row with the repository's location column list
    pub(crate) fn from_row(row: &Row) -> DbResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            address_id: row.get("address_id")?,
            street: row.get("street")?,
            city: row.get("city")?,
            state: row.get("state")?,
            postal_code: row.get("postal_code")?,
            country: row.get("country")?,
            longitude: row.get("longitude")?,
            latitude: row.get("latitude")?,
        })
    }
}
