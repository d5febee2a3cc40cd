//! Push-channel change events.
//!
//! Payloads arrive as loosely shaped JSON. They are decoded here, once, into
//! one typed variant per event name so malformed input is rejected before it
//! can reach the cache.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::{EntityKind, EntityStatus};

pub const AGENCY_STATUS_CHANGED: &str = "agency:status-changed";
pub const PRODUCT_AVAILABILITY_CHANGED: &str = "product:availability-changed";
pub const PRODUCT_GLOBAL_STATUS_CHANGED: &str = "product:global-status-changed";

/// Scope key used for agency events, which are not tied to a selected agency.
const CATALOG_SCOPE: &str = "*";

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Unknown push event: {0}")]
    UnknownEvent(String),

    #[error("Malformed {event} payload: {source}")]
    Malformed {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{event} payload is missing {field}")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },

    #[error("{event} payload has unrecognized status {value:?}")]
    UnknownStatus { event: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgencyStatusChanged {
    pub agency_id: String,
    pub new_status: EntityStatus,
    pub patch: Option<Map<String, Value>>,
    pub emitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductAvailabilityChanged {
    pub product_id: String,
    pub agency_id: String,
    pub new_status: EntityStatus,
    pub patch: Option<Map<String, Value>>,
    pub emitted_at: Option<DateTime<Utc>>,
}

/// A product switched on or off across several agencies at once.
/// An empty `affected_agencies` list means every agency.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductGlobalStatusChanged {
    pub product_id: String,
    pub affected_agencies: Vec<String>,
    pub new_status: EntityStatus,
    pub patch: Option<Map<String, Value>>,
    pub emitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    AgencyStatus(AgencyStatusChanged),
    ProductAvailability(ProductAvailabilityChanged),
    ProductGlobalStatus(ProductGlobalStatusChanged),
}

/// Union of every payload shape the server has been seen to send.
#[derive(Debug, Deserialize)]
struct RawChange {
    #[serde(rename = "entityId")]
    entity_id: Option<String>,
    #[serde(rename = "agencyId")]
    agency_id: Option<String>,
    #[serde(rename = "productId")]
    product_id: Option<String>,
    #[serde(rename = "scopeId")]
    scope_id: Option<String>,
    #[serde(rename = "affectedScopes", alias = "affectedAgencies")]
    affected_scopes: Option<Vec<String>>,
    #[serde(rename = "newStatus")]
    new_status: Option<String>,
    status: Option<String>,
    #[serde(rename = "isActive")]
    is_active: Option<bool>,
    patch: Option<Map<String, Value>>,
    #[serde(rename = "emittedAt")]
    emitted_at: Option<Value>,
}

impl RawChange {
    fn status(&self, event: &'static str) -> Result<EntityStatus, EventError> {
        if let Some(text) = self.new_status.as_deref().or(self.status.as_deref()) {
            return EntityStatus::parse(text).ok_or_else(|| EventError::UnknownStatus {
                event,
                value: text.to_string(),
            });
        }
        match self.is_active {
            Some(true) => Ok(EntityStatus::Active),
            Some(false) => Ok(EntityStatus::Inactive),
            None => Err(EventError::MissingField {
                event,
                field: "newStatus",
            }),
        }
    }

    fn emitted_at(&self) -> Option<DateTime<Utc>> {
        match self.emitted_at.as_ref()? {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
            _ => None,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn required(
    value: Option<String>,
    event: &'static str,
    field: &'static str,
) -> Result<String, EventError> {
    non_empty(value).ok_or(EventError::MissingField { event, field })
}

impl ChangeEvent {
    /// Decode a named push event.
    pub fn from_wire(name: &str, payload: &Value) -> Result<Self, EventError> {
        let event = match name {
            AGENCY_STATUS_CHANGED => AGENCY_STATUS_CHANGED,
            PRODUCT_AVAILABILITY_CHANGED => PRODUCT_AVAILABILITY_CHANGED,
            PRODUCT_GLOBAL_STATUS_CHANGED => PRODUCT_GLOBAL_STATUS_CHANGED,
            other => return Err(EventError::UnknownEvent(other.to_string())),
        };

        let raw: RawChange = serde_json::from_value(payload.clone())
            .map_err(|source| EventError::Malformed { event, source })?;
        let new_status = raw.status(event)?;
        let emitted_at = raw.emitted_at();

        match event {
            AGENCY_STATUS_CHANGED => {
                let agency_id = required(raw.entity_id.or(raw.agency_id), event, "entityId")?;
                Ok(ChangeEvent::AgencyStatus(AgencyStatusChanged {
                    agency_id,
                    new_status,
                    patch: raw.patch,
                    emitted_at,
                }))
            }
            PRODUCT_AVAILABILITY_CHANGED => {
                let product_id = required(raw.entity_id.or(raw.product_id), event, "entityId")?;
                let agency_id = required(raw.scope_id.or(raw.agency_id), event, "scopeId")?;
                Ok(ChangeEvent::ProductAvailability(ProductAvailabilityChanged {
                    product_id,
                    agency_id,
                    new_status,
                    patch: raw.patch,
                    emitted_at,
                }))
            }
            _ => {
                let product_id = required(raw.entity_id.or(raw.product_id), event, "entityId")?;
                let mut affected_agencies: Vec<String> = raw
                    .affected_scopes
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|s| !s.trim().is_empty())
                    .collect();
                if let Some(single) = non_empty(raw.scope_id.or(raw.agency_id)) {
                    if !affected_agencies.contains(&single) {
                        affected_agencies.push(single);
                    }
                }
                Ok(ChangeEvent::ProductGlobalStatus(ProductGlobalStatusChanged {
                    product_id,
                    affected_agencies,
                    new_status,
                    patch: raw.patch,
                    emitted_at,
                }))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChangeEvent::AgencyStatus(_) => AGENCY_STATUS_CHANGED,
            ChangeEvent::ProductAvailability(_) => PRODUCT_AVAILABILITY_CHANGED,
            ChangeEvent::ProductGlobalStatus(_) => PRODUCT_GLOBAL_STATUS_CHANGED,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            ChangeEvent::AgencyStatus(_) => EntityKind::Agency,
            ChangeEvent::ProductAvailability(_) | ChangeEvent::ProductGlobalStatus(_) => {
                EntityKind::Product
            }
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            ChangeEvent::AgencyStatus(e) => &e.agency_id,
            ChangeEvent::ProductAvailability(e) => &e.product_id,
            ChangeEvent::ProductGlobalStatus(e) => &e.product_id,
        }
    }

    pub fn new_status(&self) -> EntityStatus {
        match self {
            ChangeEvent::AgencyStatus(e) => e.new_status,
            ChangeEvent::ProductAvailability(e) => e.new_status,
            ChangeEvent::ProductGlobalStatus(e) => e.new_status,
        }
    }

    pub fn patch(&self) -> Option<&Map<String, Value>> {
        match self {
            ChangeEvent::AgencyStatus(e) => e.patch.as_ref(),
            ChangeEvent::ProductAvailability(e) => e.patch.as_ref(),
            ChangeEvent::ProductGlobalStatus(e) => e.patch.as_ref(),
        }
    }

    pub fn emitted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ChangeEvent::AgencyStatus(e) => e.emitted_at,
            ChangeEvent::ProductAvailability(e) => e.emitted_at,
            ChangeEvent::ProductGlobalStatus(e) => e.emitted_at,
        }
    }

    /// Stable scope component of the event's identity.
    pub fn scope_key(&self) -> String {
        match self {
            ChangeEvent::AgencyStatus(_) => CATALOG_SCOPE.to_string(),
            ChangeEvent::ProductAvailability(e) => e.agency_id.clone(),
            ChangeEvent::ProductGlobalStatus(e) => {
                if e.affected_agencies.is_empty() {
                    return CATALOG_SCOPE.to_string();
                }
                let mut scopes = e.affected_agencies.clone();
                scopes.sort();
                scopes.join(",")
            }
        }
    }

    /// Whether the event concerns the currently selected agency.
    ///
    /// Agency events always apply: the agency list is not scoped to a
    /// selection. Product events need a selection they name.
    pub fn applies_to_scope(&self, selected: Option<&str>) -> bool {
        match self {
            ChangeEvent::AgencyStatus(_) => true,
            ChangeEvent::ProductAvailability(e) => selected == Some(e.agency_id.as_str()),
            ChangeEvent::ProductGlobalStatus(e) => match selected {
                Some(scope) => {
                    e.affected_agencies.is_empty() || e.affected_agencies.iter().any(|a| a == scope)
                }
                None => false,
            },
        }
    }
}
