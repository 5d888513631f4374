// Booking state store.
//
// The store owns the whole search -> select -> personalize -> confirm
// flow: criteria mutation, the pre-search validation gate, request
// construction with per-complexity timeout budgets, response
// normalization, selection and per-room-slot services, submission, and
// the persisted snapshot that survives a reload. Volatile flags
// (loading, in-flight, error) live outside the persisted state.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError};
use crate::normalize::{
    normalize_search_payload, resolve_room_type_code, NormalizeError, Package, Room, SearchResult,
    Tariff,
};
use crate::payload::RawUpgradeRoom;
use crate::profile::UserProfile;
use crate::session::User;
use crate::storage::{StateStorage, BOOKING_STORAGE_KEY};

pub const MIN_CHILD_AGE: u8 = 0;
pub const MAX_CHILD_AGE: u8 = 12;

/// Multi-room searches fan out across rooms on the backend and get the
/// longer budget.
pub const SINGLE_ROOM_SEARCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const MULTI_ROOM_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);
pub const BOOKING_TIMEOUT: Duration = Duration::from_secs(30);

const INACTIVITY_MINUTES: i64 = 30;

const SEARCH_PATH: &str = "/v1/search";
const UPGRADE_PATH: &str = "/v1/search/upgrade";
const PACKAGES_PATH: &str = "/v1/search/packages";
const BOOKING_PATH: &str = "/v1/booking";

#[derive(Error, Debug)]
pub enum BookingError {
    #[error("select check-in and check-out dates first")]
    DatesMissing,

    #[error("at least one adult is required")]
    NoAdults,

    #[error("check-in date is in the past")]
    StaleCheckIn,

    #[error("no room selected")]
    NoRoomSelected,

    #[error("no tariff selected")]
    NoTariffSelected,

    #[error("selected room has no valid room type code")]
    MissingRoomTypeCode,

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

/// Guest specification for one requested room. `children_ages` is kept
/// length-matched to `children` on every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomGuestSpec {
    pub adults: u32,
    pub children: u32,
    pub children_ages: Vec<u8>,
}

impl Default for RoomGuestSpec {
    fn default() -> Self {
        Self {
            adults: 2,
            children: 0,
            children_ages: Vec::new(),
        }
    }
}

/// Normalizes an ages list against a child count: clamp to the allowed
/// range, pad missing slots with the minimum age, drop extras. Zero
/// children always yields an empty list.
pub fn ensure_child_ages(children: u32, ages: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = ages
        .iter()
        .take(children as usize)
        .map(|age| (*age).min(MAX_CHILD_AGE))
        .collect();
    out.resize(children as usize, MIN_CHILD_AGE);
    out
}

/// Per-slot guest contact form, pre-fillable from the session user or a
/// saved profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuestForm {
    pub name: String,
    pub surname: String,
    pub middle_name: String,
    pub phone: String,
    pub email: String,
}

impl GuestForm {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.surname.is_empty()
            && self.middle_name.is_empty()
            && self.phone.is_empty()
            && self.email.is_empty()
    }
}

pub fn guest_form_from_user(user: &User) -> GuestForm {
    GuestForm {
        name: user.name.clone(),
        surname: user.surname.clone(),
        middle_name: user.middle_name.clone().unwrap_or_default(),
        phone: user.phone.clone(),
        email: user.email.clone(),
    }
}

/// Contact-preference flags attached to the first room's guest roster on
/// submission.
#[derive(Debug, Clone, Copy, Default)]
pub struct BookingContact {
    pub sms_confirmation: bool,
    pub email_subscribe: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSelection {
    pub room: Room,
    pub tariff: Tariff,
}

/// Server-issued confirmation. The backend attaches hotel info, an order
/// summary and the created room list; everything past the stable fields
/// is carried opaquely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookingConfirmation {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookingHistoryPage {
    #[serde(default)]
    pub bookings: Vec<BookingConfirmation>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// Everything that survives a reload. Volatile flags are deliberately
/// not part of this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BookingState {
    date: Option<(NaiveDate, NaiveDate)>,
    room_list: Vec<RoomGuestSpec>,
    promo_code: String,
    search_results: Option<SearchResult>,
    selected_room: Option<Room>,
    selected_tariff: Option<Tariff>,
    selected_services: HashMap<usize, Vec<Package>>,
    multi_room_selections: HashMap<usize, RoomSelection>,
    upgrade_room: Option<Room>,
    available_packages: Vec<Package>,
    booking: Option<BookingConfirmation>,
    guest_forms: Vec<GuestForm>,
    user_profiles: HashMap<String, UserProfile>,
    last_activity: Option<DateTime<Utc>>,
}

impl Default for BookingState {
    fn default() -> Self {
        Self {
            date: None,
            room_list: vec![RoomGuestSpec::default()],
            promo_code: String::new(),
            search_results: None,
            selected_room: None,
            selected_tariff: None,
            selected_services: HashMap::new(),
            multi_room_selections: HashMap::new(),
            upgrade_room: None,
            available_packages: Vec::new(),
            booking: None,
            guest_forms: Vec::new(),
            user_profiles: HashMap::new(),
            last_activity: None,
        }
    }
}

/// The constructed search request plus the flags derived from it.
#[derive(Debug, Clone)]
pub struct SearchPlan {
    pub body: Value,
    pub timeout: Duration,
    pub grouped_by_bed: bool,
    pub multi_booking_mode: bool,
}

pub struct BookingStore {
    api: Arc<ApiClient>,
    storage: Arc<dyn StateStorage>,
    state: Mutex<BookingState>,
    loading: AtomicBool,
    in_flight: AtomicBool,
    error: Mutex<Option<String>>,
}

impl BookingStore {
    pub fn new(api: Arc<ApiClient>, storage: Arc<dyn StateStorage>) -> Self {
        let state = storage
            .load(BOOKING_STORAGE_KEY)
            .and_then(|raw| match serde_json::from_str(&raw) {
                Ok(state) => Some(state),
                Err(err) => {
                    warn!(error = %err, "discarding unreadable booking snapshot");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            api,
            storage,
            state: Mutex::new(state),
            loading: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    fn persist(&self) {
        let snapshot = {
            let state = self.state.lock();
            serde_json::to_string(&*state)
        };
        match snapshot {
            Ok(raw) => self.storage.save(BOOKING_STORAGE_KEY, &raw),
            Err(err) => warn!(error = %err, "failed to serialize booking snapshot"),
        }
    }

    fn touch_locked(state: &mut BookingState) {
        state.last_activity = Some(Utc::now());
    }

    // --- criteria -------------------------------------------------------

    pub fn date(&self) -> Option<(NaiveDate, NaiveDate)> {
        self.state.lock().date
    }

    pub fn set_date(&self, range: Option<(NaiveDate, NaiveDate)>) {
        {
            let mut state = self.state.lock();
            state.date = range;
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    pub fn room_list(&self) -> Vec<RoomGuestSpec> {
        self.state.lock().room_list.clone()
    }

    /// Replaces one room's guest spec, re-normalizing the ages list.
    pub fn set_room_guests(&self, index: usize, mut spec: RoomGuestSpec) {
        spec.children_ages = ensure_child_ages(spec.children, &spec.children_ages);
        {
            let mut state = self.state.lock();
            if let Some(slot) = state.room_list.get_mut(index) {
                *slot = spec;
            }
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    pub fn add_room(&self) {
        {
            let mut state = self.state.lock();
            state.room_list.push(RoomGuestSpec::default());
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    /// Drops a room slot; selections, services and guest forms for the
    /// slots above it shift down so they stay aligned with `room_list`.
    pub fn remove_room(&self, index: usize) {
        {
            let mut state = self.state.lock();
            if index < state.room_list.len() && state.room_list.len() > 1 {
                state.room_list.remove(index);
                if index < state.guest_forms.len() {
                    state.guest_forms.remove(index);
                }
                state.multi_room_selections =
                    shift_slots_down(std::mem::take(&mut state.multi_room_selections), index);
                state.selected_services =
                    shift_slots_down(std::mem::take(&mut state.selected_services), index);
            }
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    pub fn set_promo_code(&self, code: impl Into<String>) {
        {
            let mut state = self.state.lock();
            state.promo_code = code.into();
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    pub fn multi_booking_mode(&self) -> bool {
        self.state.lock().room_list.len() > 1
    }

    // --- volatile flags -------------------------------------------------

    pub fn loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn set_loading(&self, value: bool) {
        self.loading.store(value, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn clear_in_flight(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    fn begin_operation(&self) {
        self.loading.store(true, Ordering::SeqCst);
        self.in_flight.store(true, Ordering::SeqCst);
        *self.error.lock() = None;
    }

    fn end_operation(&self) {
        self.loading.store(false, Ordering::SeqCst);
        self.in_flight.store(false, Ordering::SeqCst);
    }

    fn record_failure(&self, err: &BookingError) {
        *self.error.lock() = Some(err.to_string());
    }

    // --- search ---------------------------------------------------------

    /// Pre-search validation gate: fails fast with no network call when
    /// dates are unset, no adults are requested, or check-in is before
    /// `today` (same-day check-in is valid).
    pub fn validate_search_at(&self, today: NaiveDate) -> Result<(), BookingError> {
        let state = self.state.lock();
        let (check_in, _) = state.date.ok_or(BookingError::DatesMissing)?;
        let total_adults: u32 = state.room_list.iter().map(|room| room.adults).sum();
        if total_adults == 0 {
            return Err(BookingError::NoAdults);
        }
        if check_in < today {
            return Err(BookingError::StaleCheckIn);
        }
        Ok(())
    }

    /// Builds the search request: one `{adults, childs}` roster per
    /// requested room, the timeout budget scaling with room count.
    pub fn build_search_plan(&self) -> Result<SearchPlan, BookingError> {
        let state = self.state.lock();
        let (check_in, check_out) = state.date.ok_or(BookingError::DatesMissing)?;

        let guests: Vec<Value> = state
            .room_list
            .iter()
            .map(|room| {
                let childs = ensure_child_ages(room.children, &room.children_ages);
                json!({ "adults": room.adults, "childs": childs })
            })
            .collect();

        let multi_booking_mode = guests.len() > 1;
        let grouped_by_bed = guests.len() <= 1;
        let timeout = if multi_booking_mode {
            MULTI_ROOM_SEARCH_TIMEOUT
        } else {
            SINGLE_ROOM_SEARCH_TIMEOUT
        };

        let mut body = json!({
            "date_from": check_in.to_string(),
            "date_to": check_out.to_string(),
            "guests": guests,
        });
        if !state.promo_code.is_empty() {
            body["promo_code"] = Value::String(state.promo_code.clone());
        }

        Ok(SearchPlan {
            body,
            timeout,
            grouped_by_bed,
            multi_booking_mode,
        })
    }

    pub async fn search(&self) -> Result<SearchResult, BookingError> {
        self.search_inner(None).await
    }

    /// Search variant pinning a specific room type; the backend answers
    /// with the single-room payload shape.
    pub async fn search_by_room_type(
        &self,
        room_type_code: &str,
    ) -> Result<SearchResult, BookingError> {
        self.search_inner(Some(room_type_code)).await
    }

    async fn search_inner(
        &self,
        room_type_code: Option<&str>,
    ) -> Result<SearchResult, BookingError> {
        let today = Local::now().date_naive();
        if let Err(err) = self.validate_search_at(today) {
            self.end_operation();
            self.record_failure(&err);
            return Err(err);
        }

        self.begin_operation();
        let plan = match self.build_search_plan() {
            Ok(mut plan) => {
                if let Some(code) = room_type_code {
                    plan.body["room_type_code"] = Value::String(code.to_string());
                }
                plan
            }
            Err(err) => {
                self.end_operation();
                self.record_failure(&err);
                return Err(err);
            }
        };

        debug!(
            multi_booking = plan.multi_booking_mode,
            pinned = room_type_code.is_some(),
            "searching rooms"
        );
        let outcome = self.run_search(&plan).await;
        self.end_operation();

        match outcome {
            Ok(result) => {
                {
                    let mut state = self.state.lock();
                    state.search_results = Some(result.clone());
                    Self::touch_locked(&mut state);
                }
                self.persist();
                Ok(result)
            }
            Err(err) => {
                warn!(error = %err, "search failed");
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    async fn run_search(&self, plan: &SearchPlan) -> Result<SearchResult, BookingError> {
        let payload = self
            .api
            .post::<Value>(SEARCH_PATH, plan.body.clone(), plan.timeout)
            .await?
            .into_payload()?;
        Ok(normalize_search_payload(payload, plan.grouped_by_bed)?)
    }

    pub fn search_results(&self) -> Option<SearchResult> {
        self.state.lock().search_results.clone()
    }

    // --- selection ------------------------------------------------------

    /// Selects a room and defaults the tariff to its first one.
    pub fn set_selected_room(&self, room: Room) {
        {
            let mut state = self.state.lock();
            state.selected_tariff = room.tariffs.first().cloned();
            state.selected_room = Some(room);
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    pub fn set_selected_tariff(&self, tariff: Tariff) {
        {
            let mut state = self.state.lock();
            state.selected_tariff = Some(tariff);
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    pub fn selected_room(&self) -> Option<Room> {
        self.state.lock().selected_room.clone()
    }

    pub fn selected_tariff(&self) -> Option<Tariff> {
        self.state.lock().selected_tariff.clone()
    }

    /// Inserts or replaces the upgrade offer in the working room list
    /// (matched by room type code), selects it, and defaults the tariff
    /// to the room's first one.
    pub fn apply_upgrade_room(&self, room: Room) {
        {
            let mut state = self.state.lock();
            if let Some(results) = state.search_results.as_mut() {
                match results
                    .rooms
                    .iter_mut()
                    .find(|r| r.room_type_code == room.room_type_code)
                {
                    Some(slot) => *slot = room.clone(),
                    None => results.rooms.push(room.clone()),
                }
            }
            state.selected_tariff = room.tariffs.first().cloned();
            state.selected_room = Some(room);
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    pub fn select_multi_room(&self, slot: usize, room: Room, tariff: Tariff) {
        {
            let mut state = self.state.lock();
            state
                .multi_room_selections
                .insert(slot, RoomSelection { room, tariff });
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    pub fn multi_room_selection(&self, slot: usize) -> Option<RoomSelection> {
        self.state.lock().multi_room_selections.get(&slot).cloned()
    }

    // --- services -------------------------------------------------------

    /// Adds a package for one room slot; duplicates (by package code) are
    /// ignored.
    pub fn add_service(&self, room_index: usize, package: Package) {
        {
            let mut state = self.state.lock();
            let services = state.selected_services.entry(room_index).or_default();
            if !services
                .iter()
                .any(|p| p.package_code == package.package_code)
            {
                services.push(package);
            }
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    pub fn remove_service(&self, room_index: usize, package_code: &str) {
        {
            let mut state = self.state.lock();
            if let Some(services) = state.selected_services.get_mut(&room_index) {
                services.retain(|p| p.package_code != package_code);
            }
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    pub fn services(&self, room_index: usize) -> Vec<Package> {
        self.state
            .lock()
            .selected_services
            .get(&room_index)
            .cloned()
            .unwrap_or_default()
    }

    // --- upgrade & packages ---------------------------------------------

    /// Fetches the upgraded-room offer for the current selection. Failure
    /// or an empty payload clears any previously stored offer.
    pub async fn fetch_upgrade_room(&self) -> Result<Option<Room>, BookingError> {
        let body = {
            let state = self.state.lock();
            let (check_in, check_out) = state.date.ok_or(BookingError::DatesMissing)?;
            let room = state
                .selected_room
                .as_ref()
                .ok_or(BookingError::NoRoomSelected)?;
            let tariff = state
                .selected_tariff
                .as_ref()
                .ok_or(BookingError::NoTariffSelected)?;
            let code = resolve_room_type_code(room)
                .ok_or(BookingError::MissingRoomTypeCode)?
                .to_string();

            let spec = state.room_list.first().cloned().unwrap_or_default();
            let childs = if spec.children == 0 {
                Value::Null
            } else {
                json!(ensure_child_ages(spec.children, &spec.children_ages))
            };
            json!({
                "room_type_code": code,
                "rate_plan_code": tariff.rate_plan_code,
                "date_from": check_in.to_string(),
                "date_to": check_out.to_string(),
                "guests": [{ "adults": spec.adults.max(1), "childs": childs }],
            })
        };

        let outcome = self.run_upgrade_fetch(body).await;
        match outcome {
            Ok(upgrade) => {
                {
                    let mut state = self.state.lock();
                    state.upgrade_room = upgrade.clone();
                    Self::touch_locked(&mut state);
                }
                self.persist();
                Ok(upgrade)
            }
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    state.upgrade_room = None;
                }
                self.persist();
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    async fn run_upgrade_fetch(&self, body: Value) -> Result<Option<Room>, BookingError> {
        #[derive(Deserialize)]
        struct UpgradePayload {
            #[serde(default)]
            rooms: Vec<RawUpgradeRoom>,
        }

        let payload: UpgradePayload = self
            .api
            .post::<UpgradePayload>(UPGRADE_PATH, body, UPGRADE_TIMEOUT)
            .await?
            .into_payload()?;
        Ok(payload.rooms.into_iter().next().map(upgrade_to_room))
    }

    pub fn upgrade_room(&self) -> Option<Room> {
        self.state.lock().upgrade_room.clone()
    }

    /// Per-night surcharge for taking the upgrade over the selected
    /// tariff; never negative.
    pub fn upgrade_additional_per_night(&self) -> f64 {
        let state = self.state.lock();
        let Some(upgrade) = state.upgrade_room.as_ref() else {
            return 0.0;
        };
        let upgrade_price = upgrade
            .min_price
            .or_else(|| upgrade.tariffs.first().map(|t| t.price))
            .unwrap_or(0.0);
        let current = state
            .selected_tariff
            .as_ref()
            .map(|t| t.price)
            .unwrap_or(0.0);
        (upgrade_price - current).max(0.0)
    }

    /// Fetches add-on packages for the current room/tariff selection.
    /// Failure clears previously loaded packages.
    pub async fn search_packages(&self) -> Result<Vec<Package>, BookingError> {
        let body = {
            let state = self.state.lock();
            let (check_in, check_out) = state.date.ok_or(BookingError::DatesMissing)?;
            let room = state
                .selected_room
                .as_ref()
                .ok_or(BookingError::NoRoomSelected)?;
            let tariff = state
                .selected_tariff
                .as_ref()
                .ok_or(BookingError::NoTariffSelected)?;
            let code = resolve_room_type_code(room)
                .ok_or(BookingError::MissingRoomTypeCode)?
                .to_string();
            json!({
                "room_type_code": code,
                "rate_plan_code": tariff.rate_plan_code,
                "date_from": check_in.to_string(),
                "date_to": check_out.to_string(),
            })
        };

        let outcome = async {
            let raw: Vec<crate::payload::RawPackage> = self
                .api
                .post::<Vec<crate::payload::RawPackage>>(PACKAGES_PATH, body, DEFAULT_OP_TIMEOUT)
                .await?
                .into_payload()?;
            Ok::<_, BookingError>(raw.into_iter().map(Package::from).collect::<Vec<_>>())
        }
        .await;

        match outcome {
            Ok(packages) => {
                {
                    let mut state = self.state.lock();
                    state.available_packages = packages.clone();
                    Self::touch_locked(&mut state);
                }
                self.persist();
                Ok(packages)
            }
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    state.available_packages.clear();
                }
                self.persist();
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    pub fn available_packages(&self) -> Vec<Package> {
        self.state.lock().available_packages.clone()
    }

    // --- guest forms ----------------------------------------------------

    pub fn guest_form(&self, index: usize) -> GuestForm {
        self.state
            .lock()
            .guest_forms
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_guest_form(&self, index: usize, form: GuestForm) {
        {
            let mut state = self.state.lock();
            if state.guest_forms.len() <= index {
                state.guest_forms.resize(index + 1, GuestForm::default());
            }
            state.guest_forms[index] = form;
            Self::touch_locked(&mut state);
        }
        self.persist();
    }

    /// Pre-fills guest forms from the given data, touching only slots
    /// that are still empty so in-progress edits survive.
    pub fn fill_empty_guest_forms(&self, data: &GuestForm) {
        {
            let mut state = self.state.lock();
            let slots = state.room_list.len();
            if state.guest_forms.len() < slots {
                state.guest_forms.resize(slots, GuestForm::default());
            }
            for form in state.guest_forms.iter_mut() {
                if form.is_empty() {
                    *form = data.clone();
                }
            }
        }
        self.persist();
    }

    // --- submission -----------------------------------------------------

    /// Builds the strict booking payload and submits it. Only the first
    /// room's roster carries contact-preference flags; rooms with a
    /// sentinel (or missing) room type code block submission.
    pub async fn submit_booking(
        &self,
        contact: BookingContact,
    ) -> Result<BookingConfirmation, BookingError> {
        let body = match self.build_booking_payload(contact) {
            Ok(body) => body,
            Err(err) => {
                self.record_failure(&err);
                return Err(err);
            }
        };

        self.begin_operation();
        let outcome = async {
            self.api
                .post::<BookingConfirmation>(BOOKING_PATH, body, BOOKING_TIMEOUT)
                .await?
                .into_payload()
                .map_err(BookingError::from)
        }
        .await;
        self.end_operation();

        match outcome {
            Ok(confirmation) => {
                {
                    let mut state = self.state.lock();
                    state.booking = Some(confirmation.clone());
                    Self::touch_locked(&mut state);
                }
                self.persist();
                Ok(confirmation)
            }
            Err(err) => {
                warn!(error = %err, "booking submission failed");
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    fn build_booking_payload(&self, contact: BookingContact) -> Result<Value, BookingError> {
        let state = self.state.lock();
        let (check_in, check_out) = state.date.ok_or(BookingError::DatesMissing)?;
        let multi = state.room_list.len() > 1;

        let mut rooms: Vec<Value> = Vec::with_capacity(state.room_list.len());
        for (index, spec) in state.room_list.iter().enumerate() {
            let (room, tariff) = if multi {
                let selection = state
                    .multi_room_selections
                    .get(&index)
                    .ok_or(BookingError::NoRoomSelected)?;
                (&selection.room, &selection.tariff)
            } else {
                (
                    state
                        .selected_room
                        .as_ref()
                        .ok_or(BookingError::NoRoomSelected)?,
                    state
                        .selected_tariff
                        .as_ref()
                        .ok_or(BookingError::NoTariffSelected)?,
                )
            };

            let code = resolve_room_type_code(room).ok_or(BookingError::MissingRoomTypeCode)?;
            let form = state.guest_forms.get(index).cloned().unwrap_or_default();
            let first = index == 0;
            let packages: Vec<&str> = state
                .selected_services
                .get(&index)
                .map(|list| list.iter().map(|p| p.package_code.as_str()).collect())
                .unwrap_or_default();

            rooms.push(json!({
                "room_type_code": code,
                "rate_plan_code": tariff.rate_plan_code,
                "adults": spec.adults,
                "childs": ensure_child_ages(spec.children, &spec.children_ages),
                "packages": packages,
                "guests": [{
                    "name": form.name,
                    "surname": form.surname,
                    "middle_name": form.middle_name,
                    "phone": form.phone,
                    "email": form.email,
                    "sms_confirmation": first && contact.sms_confirmation,
                    "email_subscribe": first && contact.email_subscribe,
                }],
            }));
        }

        let mut body = json!({
            "date_from": check_in.to_string(),
            "date_to": check_out.to_string(),
            "rooms": rooms,
        });
        if !state.promo_code.is_empty() {
            body["promo_code"] = Value::String(state.promo_code.clone());
        }
        Ok(body)
    }

    pub fn booking(&self) -> Option<BookingConfirmation> {
        self.state.lock().booking.clone()
    }

    // --- retrieval ------------------------------------------------------

    pub async fn fetch_booking(&self, id: i64) -> Result<BookingConfirmation, BookingError> {
        let path = format!("/v1/users/bookings/{id}");
        let confirmation = self
            .api
            .get::<BookingConfirmation>(&path, &[], BOOKING_TIMEOUT)
            .await?
            .into_payload()?;
        {
            let mut state = self.state.lock();
            state.booking = Some(confirmation.clone());
        }
        self.persist();
        Ok(confirmation)
    }

    pub async fn fetch_booking_history(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<BookingHistoryPage, BookingError> {
        let query = [("page", page.to_string()), ("per_page", per_page.to_string())];
        Ok(self
            .api
            .get::<BookingHistoryPage>("/v1/users/bookings/history", &query, BOOKING_TIMEOUT)
            .await?
            .into_payload()?)
    }

    // --- profile cache --------------------------------------------------

    pub fn user_profile(&self, user_id: &str) -> Option<UserProfile> {
        self.state.lock().user_profiles.get(user_id).cloned()
    }

    pub fn save_user_profile(&self, user_id: impl Into<String>, profile: UserProfile) {
        {
            let mut state = self.state.lock();
            state.user_profiles.insert(user_id.into(), profile);
        }
        self.persist();
    }

    /// Writes the profile into the cache only when no saved entry exists;
    /// a previously saved profile wins over freshly fetched data.
    pub fn cache_profile_if_absent(&self, user_id: &str, profile: UserProfile) {
        {
            let mut state = self.state.lock();
            if !state.user_profiles.contains_key(user_id) {
                state.user_profiles.insert(user_id.to_string(), profile);
            }
        }
        self.persist();
    }

    // --- reset ----------------------------------------------------------

    /// Wipes the whole booking flow. The per-user profile cache has value
    /// beyond a single flow and survives.
    pub fn force_reset(&self) {
        {
            let mut state = self.state.lock();
            let profiles = std::mem::take(&mut state.user_profiles);
            *state = BookingState {
                user_profiles: profiles,
                ..BookingState::default()
            };
        }
        self.end_operation();
        *self.error.lock() = None;
        self.persist();
        debug!("booking state reset");
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_activity
    }

    /// Resets the flow when more than the inactivity window has elapsed
    /// since the last recorded mutation. Returns whether a reset ran.
    pub fn reset_if_stale(&self, now: DateTime<Utc>) -> bool {
        let stale = {
            let state = self.state.lock();
            state
                .last_activity
                .map(|at| now - at > ChronoDuration::minutes(INACTIVITY_MINUTES))
                .unwrap_or(false)
        };
        if stale {
            self.force_reset();
        }
        stale
    }
}

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Re-keys a slot-indexed map after a slot was removed: the removed
/// slot's entry is dropped, higher slots move down by one.
fn shift_slots_down<V>(map: HashMap<usize, V>, removed: usize) -> HashMap<usize, V> {
    map.into_iter()
        .filter(|(slot, _)| *slot != removed)
        .map(|(slot, value)| (if slot > removed { slot - 1 } else { slot }, value))
        .collect()
}

fn upgrade_to_room(raw: RawUpgradeRoom) -> Room {
    let price = raw.min_price.unwrap_or(0.0);
    Room {
        id: None,
        room_type_code: raw.room_type_code,
        title: raw.title.clone(),
        description: raw.description,
        max_occupancy: 0,
        square_meters: 0.0,
        room_count: 1,
        amenities: Vec::new(),
        bed: None,
        view: None,
        family: None,
        min_price: raw.min_price,
        photos: raw.photos,
        tariffs: vec![Tariff {
            rate_plan_code: raw.rate_plan_code,
            title: raw.title,
            price,
            packages: Vec::new(),
            cancellation_free: false,
            payment_types: Vec::new(),
            description: None,
        }],
        variants: Vec::new(),
        group_title: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock_transport::{envelope, MockTransport};
    use crate::session::MemorySession;
    use crate::storage::MemoryStorage;
    use test_case::test_case;

    fn store_with(transport: Arc<MockTransport>) -> BookingStore {
        let session = Arc::new(MemorySession::new());
        let api = Arc::new(ApiClient::new(transport, session));
        BookingStore::new(api, MemoryStorage::shared())
    }

    fn dates() -> (NaiveDate, NaiveDate) {
        (
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, 5).unwrap(),
        )
    }

    fn sample_tariff(code: &str, price: f64) -> Tariff {
        Tariff {
            rate_plan_code: code.to_string(),
            title: "Room only".to_string(),
            price,
            packages: Vec::new(),
            cancellation_free: true,
            payment_types: Vec::new(),
            description: None,
        }
    }

    fn sample_room(code: &str, title: &str) -> Room {
        Room {
            id: Some(1),
            room_type_code: code.to_string(),
            title: title.to_string(),
            description: None,
            max_occupancy: 2,
            square_meters: 24.0,
            room_count: 1,
            amenities: Vec::new(),
            bed: None,
            view: None,
            family: None,
            min_price: Some(3000.0),
            photos: Vec::new(),
            tariffs: vec![sample_tariff("RO", 3000.0)],
            variants: Vec::new(),
            group_title: None,
        }
    }

    #[test_case(0, &[] => Vec::<u8>::new(); "zero children")]
    #[test_case(0, &[4, 5] => Vec::<u8>::new(); "zero children drops stale ages")]
    #[test_case(2, &[5] => vec![5, 0]; "missing slots pad with minimum")]
    #[test_case(1, &[7, 9] => vec![7]; "extras truncated")]
    #[test_case(2, &[40, 3] => vec![12, 3]; "ages clamped to maximum")]
    fn child_ages_are_normalized(children: u32, ages: &[u8]) -> Vec<u8> {
        ensure_child_ages(children, ages)
    }

    #[test]
    fn child_ages_normalization_is_idempotent() {
        let once = ensure_child_ages(3, &[2, 14]);
        let twice = ensure_child_ages(3, &once);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 3);
    }

    #[test]
    fn validation_requires_dates_adults_and_fresh_check_in() {
        let store = store_with(MockTransport::new());
        let today = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();

        assert!(matches!(
            store.validate_search_at(today),
            Err(BookingError::DatesMissing)
        ));

        store.set_date(Some(dates()));
        assert!(matches!(
            store.validate_search_at(today),
            Err(BookingError::StaleCheckIn)
        ));

        let same_day = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert!(store.validate_search_at(same_day).is_ok());

        store.set_room_guests(
            0,
            RoomGuestSpec {
                adults: 0,
                children: 0,
                children_ages: vec![],
            },
        );
        assert!(matches!(
            store.validate_search_at(same_day),
            Err(BookingError::NoAdults)
        ));
    }

    #[tokio::test]
    async fn stale_date_fails_before_any_network_call() {
        let transport = MockTransport::new();
        let store = store_with(transport.clone());
        store.set_date(Some((
            NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2000, 1, 5).unwrap(),
        )));

        let err = store.search().await.unwrap_err();
        assert!(matches!(err, BookingError::StaleCheckIn));
        assert_eq!(transport.call_count(SEARCH_PATH), 0);
        assert!(!store.loading());
        assert!(store.error().is_some());
    }

    #[test]
    fn single_room_plan_uses_short_budget() {
        let store = store_with(MockTransport::new());
        store.set_date(Some(dates()));

        let plan = store.build_search_plan().unwrap();
        assert!(plan.grouped_by_bed);
        assert!(!plan.multi_booking_mode);
        assert_eq!(plan.timeout, SINGLE_ROOM_SEARCH_TIMEOUT);
        assert_eq!(plan.body["guests"], json!([{ "adults": 2, "childs": [] }]));
        assert_eq!(plan.body["date_from"], "2025-06-01");
        assert_eq!(plan.body["date_to"], "2025-06-05");
    }

    #[test]
    fn multi_room_plan_uses_long_budget() {
        let store = store_with(MockTransport::new());
        store.set_date(Some(dates()));
        store.set_room_guests(
            0,
            RoomGuestSpec {
                adults: 2,
                children: 1,
                children_ages: vec![5],
            },
        );
        store.add_room();
        store.set_room_guests(
            1,
            RoomGuestSpec {
                adults: 1,
                children: 0,
                children_ages: vec![],
            },
        );

        let plan = store.build_search_plan().unwrap();
        assert!(plan.multi_booking_mode);
        assert!(!plan.grouped_by_bed);
        assert_eq!(plan.timeout, MULTI_ROOM_SEARCH_TIMEOUT);
        assert_eq!(
            plan.body["guests"],
            json!([
                { "adults": 2, "childs": [5] },
                { "adults": 1, "childs": [] }
            ])
        );
    }

    #[tokio::test]
    async fn search_normalizes_and_stores_results() {
        let transport = MockTransport::new();
        transport.push(
            SEARCH_PATH,
            200,
            envelope(json!([{
                "title": "Suite",
                "family": { "id": 1, "title": "Suite" },
                "min_price": "4500",
                "beds": [{
                    "room_type_code": "SU-K",
                    "title": "Suite King",
                    "tariffs": [{ "rate_plan_code": "RO", "title": "Room only", "price": 4500 }],
                }],
            }])),
        );
        let store = store_with(transport.clone());
        store.set_date(Some((
            NaiveDate::from_ymd_opt(2099, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2099, 6, 5).unwrap(),
        )));

        let result = store.search().await.unwrap();
        assert!(result.available);
        assert_eq!(result.rooms.len(), 1);
        assert_eq!(result.rooms[0].min_price, Some(4500.0));
        assert!(!store.loading());
        assert!(store.error().is_none());
        assert_eq!(store.search_results(), Some(result));
    }

    #[tokio::test]
    async fn failed_search_records_error_and_clears_flags() {
        let transport = MockTransport::new();
        transport.push(SEARCH_PATH, 500, json!({ "message": "backend down" }));
        let store = store_with(transport);
        store.set_date(Some((
            NaiveDate::from_ymd_opt(2099, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2099, 6, 5).unwrap(),
        )));

        let err = store.search().await.unwrap_err();
        assert!(matches!(err, BookingError::Api(_)));
        assert_eq!(store.error().as_deref(), Some("backend down"));
        assert!(!store.loading());
        assert!(!store.in_flight());
    }

    #[test]
    fn persistence_round_trips_dates_without_drift() {
        let storage = MemoryStorage::shared();
        let session = Arc::new(MemorySession::new());
        let api = Arc::new(ApiClient::new(MockTransport::new(), session.clone()));
        let store = BookingStore::new(api, storage.clone());

        store.set_date(Some(dates()));
        store.set_room_guests(
            0,
            RoomGuestSpec {
                adults: 2,
                children: 2,
                children_ages: vec![3, 8],
            },
        );
        store.set_promo_code("SUMMER");

        let api2 = Arc::new(ApiClient::new(MockTransport::new(), session));
        let reloaded = BookingStore::new(api2, storage);
        assert_eq!(reloaded.date(), Some(dates()));
        assert_eq!(reloaded.room_list()[0].children_ages, vec![3, 8]);
        assert!(!reloaded.loading());
    }

    #[tokio::test]
    async fn sentinel_code_blocks_submission_before_network() {
        let transport = MockTransport::new();
        let store = store_with(transport.clone());
        store.set_date(Some(dates()));
        store.set_selected_room(sample_room("Attic", "Attic"));

        let err = store.submit_booking(BookingContact::default()).await.unwrap_err();
        assert!(matches!(err, BookingError::MissingRoomTypeCode));
        assert_eq!(transport.call_count(BOOKING_PATH), 0);
    }

    #[tokio::test]
    async fn submission_payload_is_strict_and_flags_first_room_only() {
        let transport = MockTransport::new();
        transport.push(
            BOOKING_PATH,
            200,
            envelope(json!({ "id": 42, "status": "created" })),
        );
        let store = store_with(transport.clone());
        store.set_date(Some(dates()));
        store.add_room();
        store.select_multi_room(0, sample_room("A1", "Alpha"), sample_tariff("RO", 3000.0));
        store.select_multi_room(1, sample_room("B1", "Beta"), sample_tariff("BB", 3500.0));
        store.set_guest_form(
            0,
            GuestForm {
                name: "Anna".into(),
                surname: "Kis".into(),
                ..GuestForm::default()
            },
        );
        store.add_service(
            1,
            Package {
                package_code: "SPA".into(),
                title: "Spa".into(),
                description: None,
                photos: vec![],
                price: 700.0,
                calculation_rate_title: None,
            },
        );

        let confirmation = store
            .submit_booking(BookingContact {
                sms_confirmation: true,
                email_subscribe: false,
            })
            .await
            .unwrap();
        assert_eq!(confirmation.id, Some(42));

        let body = transport.last_body(BOOKING_PATH).unwrap();
        let rooms = body["rooms"].as_array().unwrap();
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0]["guests"][0]["sms_confirmation"], json!(true));
        assert_eq!(rooms[1]["guests"][0]["sms_confirmation"], json!(false));
        assert_eq!(rooms[1]["packages"], json!(["SPA"]));
        assert!(body.get("loading").is_none());
        assert_eq!(store.booking(), Some(confirmation));
    }

    #[tokio::test]
    async fn upgrade_offer_failure_clears_previous_offer() {
        let transport = MockTransport::new();
        transport.push(
            UPGRADE_PATH,
            200,
            envelope(json!({ "rooms": [{
                "room_type_code": "DLX",
                "rate_plan_code": "RO",
                "title": "Deluxe",
                "min_price": 5200,
            }]})),
        );
        transport.push(UPGRADE_PATH, 500, json!({ "message": "no upgrades" }));
        let store = store_with(transport);
        store.set_date(Some(dates()));
        store.set_selected_room(sample_room("STD", "Standard"));

        let offer = store.fetch_upgrade_room().await.unwrap().unwrap();
        assert_eq!(offer.room_type_code, "DLX");
        assert_eq!(store.upgrade_room().map(|r| r.title), Some("Deluxe".into()));
        assert_eq!(store.upgrade_additional_per_night(), 2200.0);

        assert!(store.fetch_upgrade_room().await.is_err());
        assert!(store.upgrade_room().is_none());
    }

    #[test]
    fn apply_upgrade_replaces_room_and_defaults_tariff() {
        let store = store_with(MockTransport::new());
        store.set_date(Some(dates()));
        let mut upgrade = sample_room("STD", "Standard Plus");
        upgrade.tariffs = vec![sample_tariff("FLEX", 4200.0), sample_tariff("RO", 3900.0)];

        store.set_selected_room(sample_room("STD", "Standard"));
        store.apply_upgrade_room(upgrade);

        let selected = store.selected_room().unwrap();
        assert_eq!(selected.title, "Standard Plus");
        assert_eq!(
            store.selected_tariff().map(|t| t.rate_plan_code),
            Some("FLEX".to_string())
        );
    }

    #[test]
    fn services_are_scoped_per_room_slot() {
        let store = store_with(MockTransport::new());
        let spa = Package {
            package_code: "SPA".into(),
            title: "Spa".into(),
            description: None,
            photos: vec![],
            price: 700.0,
            calculation_rate_title: None,
        };

        store.add_service(0, spa.clone());
        store.add_service(0, spa.clone());
        store.add_service(1, spa.clone());
        assert_eq!(store.services(0).len(), 1);
        assert_eq!(store.services(1).len(), 1);

        store.remove_service(0, "SPA");
        assert!(store.services(0).is_empty());
        assert_eq!(store.services(1).len(), 1);
    }

    #[tokio::test]
    async fn removing_a_room_keeps_remaining_slots_aligned() {
        let transport = MockTransport::new();
        transport.push(BOOKING_PATH, 200, envelope(json!({ "id": 7 })));
        let store = store_with(transport.clone());
        store.set_date(Some(dates()));
        store.add_room();
        store.add_room();
        store.select_multi_room(0, sample_room("A1", "Alpha"), sample_tariff("RO", 3000.0));
        store.select_multi_room(1, sample_room("B1", "Beta"), sample_tariff("RO", 3100.0));
        store.select_multi_room(2, sample_room("C1", "Gamma"), sample_tariff("RO", 3200.0));
        store.set_guest_form(
            0,
            GuestForm {
                name: "First".into(),
                ..GuestForm::default()
            },
        );
        store.set_guest_form(
            1,
            GuestForm {
                name: "Second".into(),
                ..GuestForm::default()
            },
        );
        store.add_service(
            2,
            Package {
                package_code: "SPA".into(),
                title: "Spa".into(),
                description: None,
                photos: vec![],
                price: 700.0,
                calculation_rate_title: None,
            },
        );

        store.remove_room(0);

        assert_eq!(
            store.multi_room_selection(0).map(|s| s.room.room_type_code),
            Some("B1".to_string())
        );
        assert_eq!(
            store.multi_room_selection(1).map(|s| s.room.room_type_code),
            Some("C1".to_string())
        );
        assert_eq!(store.guest_form(0).name, "Second");
        assert!(store.services(0).is_empty());
        assert_eq!(store.services(1).len(), 1);

        store.submit_booking(BookingContact::default()).await.unwrap();
        let body = transport.last_body(BOOKING_PATH).unwrap();
        let rooms = body["rooms"].as_array().unwrap();
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0]["room_type_code"], "B1");
        assert_eq!(rooms[1]["room_type_code"], "C1");
        assert_eq!(rooms[1]["packages"], json!(["SPA"]));
    }

    #[test]
    fn force_reset_preserves_profile_cache() {
        let store = store_with(MockTransport::new());
        store.set_date(Some(dates()));
        store.set_promo_code("SUMMER");
        store.save_user_profile(
            "u-1",
            UserProfile {
                name: "Anna".into(),
                ..UserProfile::default()
            },
        );

        store.force_reset();
        assert!(store.date().is_none());
        assert!(store.search_results().is_none());
        assert_eq!(store.user_profile("u-1").map(|p| p.name), Some("Anna".into()));
    }

    #[test]
    fn saved_profile_wins_over_fetched_data() {
        let store = store_with(MockTransport::new());
        store.save_user_profile(
            "u-1",
            UserProfile {
                name: "Saved".into(),
                ..UserProfile::default()
            },
        );
        store.cache_profile_if_absent(
            "u-1",
            UserProfile {
                name: "Fetched".into(),
                ..UserProfile::default()
            },
        );
        store.cache_profile_if_absent(
            "u-2",
            UserProfile {
                name: "Fresh".into(),
                ..UserProfile::default()
            },
        );

        assert_eq!(store.user_profile("u-1").map(|p| p.name), Some("Saved".into()));
        assert_eq!(store.user_profile("u-2").map(|p| p.name), Some("Fresh".into()));
    }

    #[test]
    fn inactivity_reset_only_after_window() {
        let store = store_with(MockTransport::new());
        store.set_date(Some(dates()));
        let touched = store.last_activity().unwrap();

        assert!(!store.reset_if_stale(touched + ChronoDuration::minutes(10)));
        assert!(store.date().is_some());

        assert!(store.reset_if_stale(touched + ChronoDuration::minutes(31)));
        assert!(store.date().is_none());
    }

    #[test]
    fn guest_prefill_skips_non_empty_forms() {
        let store = store_with(MockTransport::new());
        store.add_room();
        store.set_guest_form(
            0,
            GuestForm {
                name: "Edited".into(),
                ..GuestForm::default()
            },
        );

        store.fill_empty_guest_forms(&GuestForm {
            name: "Anna".into(),
            surname: "Kis".into(),
            ..GuestForm::default()
        });

        assert_eq!(store.guest_form(0).name, "Edited");
        assert_eq!(store.guest_form(1).name, "Anna");
    }
}
