use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Entity, EntityKind, EntityStatus};

/// A cylinder or accessory sold by one agency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct Product {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "agencyId", skip_serializing_if = "Option::is_none")]
    pub agency_id: Option<String>,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(rename = "discountedPrice", skip_serializing_if = "Option::is_none")]
    pub discounted_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(flatten)]
    #[cfg_attr(feature = "ts", ts(skip))]
    pub extra: Map<String, Value>,
}

impl Product {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agency_id: None,
            status: EntityStatus::Active,
            category: None,
            description: None,
            price: None,
            discounted_price: None,
            stock: None,
            images: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Price the customer pays: the discounted price when one is set.
    pub fn effective_price(&self) -> Option<f64> {
        self.discounted_price.or(self.price)
    }

    /// Unknown stock counts as orderable; the server only reports a number
    /// for agencies that track inventory.
    pub fn in_stock(&self) -> bool {
        self.stock.map(|s| s > 0).unwrap_or(true)
    }
}

impl Entity for Product {
    const KIND: EntityKind = EntityKind::Product;

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

/// `data` object of `GET /products?agencyId=X`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductsData {
    #[serde(default)]
    pub products: Vec<Product>,
}
