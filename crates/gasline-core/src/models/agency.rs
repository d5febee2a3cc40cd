use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Entity, EntityKind, EntityStatus};

/// A gas agency (distributor) customers can order from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Agency {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(rename = "profileImage", skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Wire fields this client does not model, kept so patches round-trip.
    #[serde(flatten)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub extra: Map<String, Value>,
}

impl Agency {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: EntityStatus::Active,
            phone: None,
            email: None,
            address: None,
            city: None,
            image: None,
            extra: Map::new(),
        }
    }

    /// Short location label for list rows.
    pub fn location(&self) -> Option<String> {
        match (&self.address, &self.city) {
            (Some(address), Some(city)) if !address.is_empty() && !city.is_empty() => {
                Some(format!("{}, {}", address, city))
            }
            (Some(address), _) if !address.is_empty() => Some(address.clone()),
            (_, Some(city)) if !city.is_empty() => Some(city.clone()),
            _ => None,
        }
    }
}

impl Entity for Agency {
    const KIND: EntityKind = EntityKind::Agency;

    fn key(&self) -> &str {
        &self.id
    }

    fn status(&self) -> EntityStatus {
        self.status
    }

    fn set_status(&mut self, status: EntityStatus) {
        self.status = status;
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}

/// `data` object of `GET /agencies/active`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgenciesData {
    #[serde(default)]
    pub agencies: Vec<Agency>,
}
