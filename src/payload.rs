// Raw wire shapes for the search endpoints.
//
// The backend returns four different payload layouts for the same logical
// search (see normalize.rs for the classifier); these structs stay lenient:
// every field defaults, prices arrive as numbers or numeric strings, and
// attributes arrive as bare strings or {id, title} objects.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Coerces a price value that may arrive as a number or a numeric string.
/// Empty or garbage strings become `None`, never `NaN`.
pub fn coerce_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok().filter(|p| p.is_finite())
        }
        _ => None,
    }
}

pub(crate) fn flexible_price<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(coerce_price))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawAttribute {
    Object {
        #[serde(default)]
        id: Option<i64>,
        #[serde(default)]
        title: String,
    },
    Title(String),
}

impl RawAttribute {
    pub fn id(&self) -> Option<i64> {
        match self {
            RawAttribute::Object { id, .. } => *id,
            RawAttribute::Title(_) => None,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            RawAttribute::Object { title, .. } => title,
            RawAttribute::Title(title) => title,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawAmenity {
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawPackage {
    pub package_code: String,
    pub title: String,
    pub description: Option<String>,
    pub photos: Vec<String>,
    #[serde(deserialize_with = "flexible_price")]
    pub price: Option<f64>,
    pub calculation_rate_title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawTariff {
    pub rate_plan_code: String,
    pub title: String,
    #[serde(deserialize_with = "flexible_price")]
    pub price: Option<f64>,
    pub packages: Vec<RawPackage>,
    pub cancellation_free: bool,
    pub payment_types: Vec<String>,
    pub description: Option<String>,
}

/// A concrete room variant: one bed/layout configuration with its tariffs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawRoom {
    pub id: Option<i64>,
    pub room_type_code: String,
    pub title: String,
    pub description: Option<String>,
    pub max_occupancy: u32,
    pub square: f64,
    pub rooms: u32,
    pub amenities: Vec<RawAmenity>,
    pub bed: Option<RawAttribute>,
    pub view: Option<RawAttribute>,
    pub family: Option<RawAttribute>,
    #[serde(deserialize_with = "flexible_price")]
    pub min_price: Option<f64>,
    pub photos: Vec<String>,
    pub tariffs: Vec<RawTariff>,
}

/// A grouped entry: room-level fields plus a nested list of concrete
/// variants under either `beds` or `room_type_codes`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawGroupedRoom {
    #[serde(flatten)]
    pub room: RawRoom,
    pub beds: Option<Vec<RawRoom>>,
    pub room_type_codes: Option<Vec<RawRoom>>,
}

impl RawGroupedRoom {
    pub fn variants(&self) -> &[RawRoom] {
        self.beds
            .as_deref()
            .or(self.room_type_codes.as_deref())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawFilters {
    pub beds: Vec<RawAttribute>,
    pub views: Vec<RawAttribute>,
    pub balconies: Vec<RawAttribute>,
}

/// Object-shaped search response: `{rooms, filters, packages, available}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSearchObject<R> {
    pub available: Option<bool>,
    pub rooms: Vec<R>,
    pub filters: RawFilters,
    pub packages: Vec<RawPackage>,
}

/// Pinned-room search response: `{room, packages}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSingleRoom {
    pub room: RawRoom,
    pub packages: Vec<RawPackage>,
}

/// `POST /v1/search/upgrade` payload entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawUpgradeRoom {
    pub room_type_code: String,
    pub rate_plan_code: String,
    pub title: String,
    pub description: Option<String>,
    #[serde(deserialize_with = "flexible_price")]
    pub min_price: Option<f64>,
    pub photos: Vec<String>,
}

/// `GET /v1/search/calendar` payload entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PriceCalendarEntry {
    pub date_at: String,
    #[serde(deserialize_with = "flexible_price")]
    pub min_price: Option<f64>,
}
