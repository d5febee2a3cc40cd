//! In-memory catalog cache.
//!
//! This module provides the `EntityCache` holding one ordered
//! `EntityCollection` per entity type:
//! - Agencies (the global list of active agencies)
//! - Products (scoped to the selected agency)
//!
//! Nothing here is persisted; the cache is rebuilt from a snapshot fetch on
//! every cold start.

pub mod catalog;
pub mod collection;

use chrono::{DateTime, Utc};

pub use catalog::{EntityCache, ScopeSelection};
pub use collection::{EntityCollection, Upsert};

/// Human-readable age of a snapshot, e.g. "5m ago".
pub fn age_display(updated_at: Option<DateTime<Utc>>) -> String {
    let Some(updated_at) = updated_at else {
        return "never".to_string();
    };
    let minutes = (Utc::now() - updated_at).num_minutes();
    if minutes < 1 {
        // Includes negative ages from clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_age_display() {
        assert_eq!(age_display(None), "never");
        assert_eq!(age_display(Some(Utc::now())), "just now");
        assert_eq!(age_display(Some(Utc::now() + Duration::minutes(5))), "just now");
        assert_eq!(age_display(Some(Utc::now() - Duration::minutes(5))), "5m ago");
        assert_eq!(age_display(Some(Utc::now() - Duration::minutes(95))), "2h ago");
        assert_eq!(age_display(Some(Utc::now() - Duration::minutes(65))), "1h ago");
        assert_eq!(age_display(Some(Utc::now() - Duration::days(3))), "3d ago");
    }
}
