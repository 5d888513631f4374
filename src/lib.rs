// Main library file for the hotel booking state core

// Export modules in dependency order, leaves first
pub mod storage;
pub mod session;
pub mod api;
pub mod payload;
pub mod normalize;
pub mod calendar;
pub mod booking;
pub mod profile;
pub mod validation;

// Re-export key types for convenience
pub use api::{ApiClient, ApiError, ApiResponse, ReqwestTransport, Transport};
pub use booking::{
    BookingConfirmation, BookingContact, BookingError, BookingHistoryPage, BookingStore,
    GuestForm, RoomGuestSpec, SearchPlan,
};
pub use calendar::{CalendarError, CalendarPriceCache};
pub use normalize::{
    Attribute, NormalizeError, Package, Room, SearchFilters, SearchPayloadKind, SearchResult,
    Tariff,
};
pub use profile::{ProfileError, ProfileManager, UserProfile};
pub use session::{MemorySession, SessionStore, User};
pub use storage::{MemoryStorage, StateStorage};
pub use validation::{validate_field, validate_register_form, FieldRules, FormContext};
