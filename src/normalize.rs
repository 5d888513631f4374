// Search response normalization.
//
// The backend returns one of four payload layouts for a logical search:
//   (a) bare array of grouped entries (variants nested under beds /
//       room_type_codes),
//   (b) {rooms, filters} with grouped entries,
//   (c) {rooms, filters} with flat rooms (multi-room fan-out),
//   (d) {room, packages} for a pinned room_type_code.
// The classifier inspects the raw payload once and everything downstream
// switches on the resulting tag; all four paths produce the canonical
// `SearchResult`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::payload::{
    RawAmenity, RawAttribute, RawFilters, RawGroupedRoom, RawPackage, RawRoom, RawSearchObject,
    RawSingleRoom, RawTariff,
};

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("unrecognized search payload shape")]
    UnrecognizedShape,

    #[error("malformed search payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPayloadKind {
    /// Shape (a): a bare array of grouped entries.
    GroupedList,
    /// Shape (b): `{rooms, filters}`, rooms still grouped.
    GroupedObject,
    /// Shape (c): `{rooms, filters}`, rooms already flat.
    FlatObject,
    /// Shape (d): `{room, packages}` for a pinned room type.
    SingleRoom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: Option<i64>,
    pub title: String,
}

impl From<&RawAttribute> for Attribute {
    fn from(raw: &RawAttribute) -> Self {
        Self {
            id: raw.id(),
            title: raw.title().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amenity {
    pub title: String,
}

impl From<RawAmenity> for Amenity {
    fn from(raw: RawAmenity) -> Self {
        Self { title: raw.title }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub package_code: String,
    pub title: String,
    pub description: Option<String>,
    pub photos: Vec<String>,
    pub price: f64,
    pub calculation_rate_title: Option<String>,
}

impl From<RawPackage> for Package {
    fn from(raw: RawPackage) -> Self {
        Self {
            package_code: raw.package_code,
            title: raw.title,
            description: raw.description,
            photos: raw.photos,
            price: raw.price.unwrap_or(0.0),
            calculation_rate_title: raw.calculation_rate_title,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    pub rate_plan_code: String,
    pub title: String,
    pub price: f64,
    pub packages: Vec<Package>,
    pub cancellation_free: bool,
    pub payment_types: Vec<String>,
    pub description: Option<String>,
}

impl From<RawTariff> for Tariff {
    fn from(raw: RawTariff) -> Self {
        Self {
            rate_plan_code: raw.rate_plan_code,
            title: raw.title,
            price: raw.price.unwrap_or(0.0),
            packages: raw.packages.into_iter().map(Package::from).collect(),
            cancellation_free: raw.cancellation_free,
            payment_types: raw.payment_types,
            description: raw.description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: Option<i64>,
    pub room_type_code: String,
    pub title: String,
    pub description: Option<String>,
    pub max_occupancy: u32,
    pub square_meters: f64,
    pub room_count: u32,
    pub amenities: Vec<Amenity>,
    pub bed: Option<Attribute>,
    pub view: Option<Attribute>,
    pub family: Option<Attribute>,
    pub min_price: Option<f64>,
    pub photos: Vec<String>,
    pub tariffs: Vec<Tariff>,
    /// Alternate bed/layout options sharing the same family.
    pub variants: Vec<Room>,
    pub group_title: Option<String>,
}

impl Room {
    pub fn from_raw(raw: RawRoom) -> Self {
        Self {
            id: raw.id,
            room_type_code: raw.room_type_code,
            title: raw.title,
            description: raw.description,
            max_occupancy: raw.max_occupancy,
            square_meters: raw.square,
            room_count: raw.rooms,
            amenities: raw.amenities.into_iter().map(Amenity::from).collect(),
            bed: raw.bed.as_ref().map(Attribute::from),
            view: raw.view.as_ref().map(Attribute::from),
            family: raw.family.as_ref().map(Attribute::from),
            min_price: raw.min_price,
            photos: raw.photos,
            tariffs: raw.tariffs.into_iter().map(Tariff::from).collect(),
            variants: Vec::new(),
            group_title: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub beds: Vec<Attribute>,
    pub views: Vec<Attribute>,
    pub balconies: Vec<Attribute>,
}

impl From<RawFilters> for SearchFilters {
    fn from(raw: RawFilters) -> Self {
        let convert = |items: Vec<RawAttribute>| items.iter().map(Attribute::from).collect();
        Self {
            beds: convert(raw.beds),
            views: convert(raw.views),
            balconies: convert(raw.balconies),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub available: bool,
    pub rooms: Vec<Room>,
    pub packages: Vec<Package>,
    pub filters: SearchFilters,
    pub grouped_by_bed: bool,
}

/// Inspects the raw payload once and names its shape.
pub fn classify_search_payload(value: &Value) -> Result<SearchPayloadKind, NormalizeError> {
    match value {
        Value::Array(_) => Ok(SearchPayloadKind::GroupedList),
        Value::Object(map) => {
            if map.contains_key("room") {
                return Ok(SearchPayloadKind::SingleRoom);
            }
            let rooms = map
                .get("rooms")
                .and_then(Value::as_array)
                .ok_or(NormalizeError::UnrecognizedShape)?;
            let grouped = rooms
                .first()
                .map(|room| room.get("beds").is_some() || room.get("room_type_codes").is_some())
                .unwrap_or(false);
            if grouped {
                Ok(SearchPayloadKind::GroupedObject)
            } else {
                Ok(SearchPayloadKind::FlatObject)
            }
        }
        _ => Err(NormalizeError::UnrecognizedShape),
    }
}

/// Normalizes any of the four payload shapes into the canonical result.
/// `grouped_by_bed` is the flag derived from the request (one room asked
/// for), recorded on the result for the UI.
pub fn normalize_search_payload(
    value: Value,
    grouped_by_bed: bool,
) -> Result<SearchResult, NormalizeError> {
    let kind = classify_search_payload(&value)?;
    let malformed = |err: serde_json::Error| NormalizeError::Malformed(err.to_string());

    match kind {
        SearchPayloadKind::GroupedList => {
            let groups: Vec<RawGroupedRoom> = serde_json::from_value(value).map_err(malformed)?;
            let rooms = group_rooms(groups);
            Ok(SearchResult {
                available: !rooms.is_empty(),
                rooms,
                packages: Vec::new(),
                filters: SearchFilters::default(),
                grouped_by_bed,
            })
        }
        SearchPayloadKind::GroupedObject => {
            let object: RawSearchObject<RawGroupedRoom> =
                serde_json::from_value(value).map_err(malformed)?;
            let rooms = group_rooms(object.rooms);
            Ok(SearchResult {
                available: object.available.unwrap_or(!rooms.is_empty()),
                rooms,
                packages: object.packages.into_iter().map(Package::from).collect(),
                filters: object.filters.into(),
                grouped_by_bed,
            })
        }
        SearchPayloadKind::FlatObject => {
            let object: RawSearchObject<RawRoom> =
                serde_json::from_value(value).map_err(malformed)?;
            let rooms: Vec<Room> = object.rooms.into_iter().map(Room::from_raw).collect();
            Ok(SearchResult {
                available: object.available.unwrap_or(!rooms.is_empty()),
                rooms,
                packages: object.packages.into_iter().map(Package::from).collect(),
                filters: object.filters.into(),
                grouped_by_bed,
            })
        }
        SearchPayloadKind::SingleRoom => {
            let single: RawSingleRoom = serde_json::from_value(value).map_err(malformed)?;
            let room = Room::from_raw(single.room);
            Ok(SearchResult {
                available: true,
                rooms: vec![room],
                packages: single.packages.into_iter().map(Package::from).collect(),
                filters: SearchFilters::default(),
                grouped_by_bed,
            })
        }
    }
}

/// A room_type_code equal to the display title is a backend artifact for
/// "no real code"; such codes are treated as absent.
fn code_is_valid(code: &str, title: &str) -> bool {
    !code.is_empty() && code != title
}

/// Resolves the effective room type code: the room's own code unless it is
/// the sentinel, otherwise the first variant carrying a valid one.
pub fn resolve_room_type_code(room: &Room) -> Option<&str> {
    if code_is_valid(&room.room_type_code, &room.title) {
        return Some(&room.room_type_code);
    }
    room.variants
        .iter()
        .find(|v| code_is_valid(&v.room_type_code, &v.title))
        .map(|v| v.room_type_code.as_str())
}

fn variant_key(room: &Room) -> String {
    if code_is_valid(&room.room_type_code, &room.title) {
        return format!("code:{}", room.room_type_code);
    }
    if let Some(id) = room.id {
        return format!("id:{id}");
    }
    format!("title:{}", room.title)
}

fn merge_min_price(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

fn room_from_group(group: RawGroupedRoom, position: usize) -> (String, Room) {
    let RawGroupedRoom {
        room,
        beds,
        room_type_codes,
    } = group;
    let raw_variants = beds.or(room_type_codes).unwrap_or_default();

    let mut base = Room::from_raw(room);
    if !base.title.is_empty() {
        base.group_title = Some(base.title.clone());
    }

    let key = base
        .family
        .as_ref()
        .and_then(|f| f.id)
        .map(|id| format!("family:{id}"))
        .or_else(|| (!base.title.is_empty()).then(|| format!("title:{}", base.title)))
        .or_else(|| (!base.room_type_code.is_empty()).then(|| format!("code:{}", base.room_type_code)))
        .unwrap_or_else(|| format!("pos:{position}"));

    let mut seen: HashMap<String, ()> = HashMap::new();
    for raw in raw_variants {
        let variant = Room::from_raw(raw);
        if seen.insert(variant_key(&variant), ()).is_none() {
            base.min_price = merge_min_price(base.min_price, variant.min_price);
            for tariff in &variant.tariffs {
                if !base
                    .tariffs
                    .iter()
                    .any(|t| t.rate_plan_code == tariff.rate_plan_code)
                {
                    base.tariffs.push(tariff.clone());
                }
            }
            if base.photos.is_empty() && !variant.photos.is_empty() {
                base.photos = variant.photos.clone();
            }
            if base.amenities.is_empty() && !variant.amenities.is_empty() {
                base.amenities = variant.amenities.clone();
            }
            base.variants.push(variant);
        }
    }

    scrub_sentinel_code(&mut base);
    (key, base)
}

/// The sentinel never leaves the normalizer: it is replaced by the first
/// valid variant code, or cleared when nothing valid exists.
fn scrub_sentinel_code(room: &mut Room) {
    if !code_is_valid(&room.room_type_code, &room.title) {
        room.room_type_code = resolve_room_type_code(room)
            .map(str::to_string)
            .unwrap_or_default();
    }
}

fn merge_rooms(existing: &mut Room, other: Room) {
    let mut keys: HashMap<String, ()> = existing
        .variants
        .iter()
        .map(|v| (variant_key(v), ()))
        .collect();

    existing.min_price = merge_min_price(existing.min_price, other.min_price);
    for tariff in other.tariffs {
        if !existing
            .tariffs
            .iter()
            .any(|t| t.rate_plan_code == tariff.rate_plan_code)
        {
            existing.tariffs.push(tariff);
        }
    }
    if existing.photos.is_empty() && !other.photos.is_empty() {
        existing.photos = other.photos;
    }
    if existing.amenities.is_empty() && !other.amenities.is_empty() {
        existing.amenities = other.amenities;
    }
    for variant in other.variants {
        if keys.insert(variant_key(&variant), ()).is_none() {
            existing.variants.push(variant);
        }
    }
    scrub_sentinel_code(existing);
}

/// Merges grouped entries under a synthetic key: family id, falling back
/// to the group title, the room type code, and finally the position.
/// Input order of first appearance is preserved.
fn group_rooms(groups: Vec<RawGroupedRoom>) -> Vec<Room> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Room> = HashMap::new();

    for (position, group) in groups.into_iter().enumerate() {
        let (key, room) = room_from_group(group, position);
        match merged.entry(key.clone()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                merge_rooms(entry.get_mut(), room);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(room);
                order.push(key);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}
