//! Data models for the cylinder catalog.
//!
//! - `Agency`, `Product`: catalog entities keyed by an opaque string id
//! - `ChangeEvent`: typed push events decoded at the wire boundary
//! - `EntityKind`, `EntityStatus`: shared vocabulary for both collections

pub mod agency;
pub mod event;
pub mod product;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

pub use agency::{AgenciesData, Agency};
pub use event::{
    AgencyStatusChanged, ChangeEvent, EventError, ProductAvailabilityChanged,
    ProductGlobalStatusChanged, AGENCY_STATUS_CHANGED, PRODUCT_AVAILABILITY_CHANGED,
    PRODUCT_GLOBAL_STATUS_CHANGED,
};
pub use product::{Product, ProductsData};

/// The two cached collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Agency,
    Product,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Agency => write!(f, "agency"),
            EntityKind::Product => write!(f, "product"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum EntityStatus {
    #[default]
    Active,
    Inactive,
}

impl EntityStatus {
    /// Parse the status spellings the server uses in push payloads.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "available" | "enabled" | "in_stock" => Some(EntityStatus::Active),
            "inactive" | "unavailable" | "disabled" | "out_of_stock" => Some(EntityStatus::Inactive),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, EntityStatus::Active)
    }
}

impl TryFrom<String> for EntityStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unknown status {:?}", value))
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityStatus::Active => write!(f, "active"),
            EntityStatus::Inactive => write!(f, "inactive"),
        }
    }
}

/// Wire keys that carry an entity's identity; patches never rewrite them.
const IDENTITY_KEYS: [&str; 2] = ["id", "_id"];

/// A cacheable catalog record.
pub trait Entity: Clone + Serialize + DeserializeOwned {
    const KIND: EntityKind;

    fn key(&self) -> &str;

    fn status(&self) -> EntityStatus;

    fn set_status(&mut self, status: EntityStatus);

    /// Name used for alphabetical placement.
    fn display_name(&self) -> &str;

    /// Shallow-merge a JSON patch over this entity.
    ///
    /// Top-level keys present in `patch` replace the current value; every
    /// other field is kept. Identity keys in the patch are ignored.
    fn merged_with(&self, patch: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        let mut base = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (field, value) in patch {
            if IDENTITY_KEYS.contains(&field.as_str()) {
                continue;
            }
            base.insert(field.clone(), value.clone());
        }
        serde_json::from_value(Value::Object(base))
    }

    /// Merge another full record over this one, treating its null fields as
    /// "not mentioned".
    fn merged_with_entity(&self, other: &Self) -> Result<Self, serde_json::Error> {
        let patch = match serde_json::to_value(other)? {
            Value::Object(map) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            _ => Map::new(),
        };
        self.merged_with(&patch)
    }
}
