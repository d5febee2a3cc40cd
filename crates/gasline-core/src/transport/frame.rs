use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Client frame asking to receive one agency's events.
pub const JOIN_AGENCY: &str = "join-agency";

/// Client frame ending an agency subscription.
pub const LEAVE_AGENCY: &str = "leave-agency";

/// One JSON text frame on the push channel: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn join(agency_id: &str) -> Self {
        Self::new(JOIN_AGENCY, json!({ "agencyId": agency_id }))
    }

    pub fn leave(agency_id: &str) -> Self {
        Self::new(LEAVE_AGENCY, json!({ "agencyId": agency_id }))
    }

    /// Room named by a join/leave frame.
    pub fn room(&self) -> Option<&str> {
        self.data.get("agencyId").and_then(Value::as_str)
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
