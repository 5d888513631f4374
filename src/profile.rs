// Profile state.
//
// Server-returned profile data is written to the session user and the
// id-keyed cache before any form state is re-derived, so a watcher
// re-reading the session cannot clobber in-flight edits with stale data.
// A saved cache entry wins over freshly fetched server data.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError, DEFAULT_TIMEOUT};
use crate::booking::{guest_form_from_user, BookingStore, GuestForm};
use crate::session::{SessionStore, User};

const PROFILE_PATH: &str = "/v1/users/profile";

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("not signed in")]
    NotAuthenticated,

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Last-known profile fields, cached per user id independently of the
/// auth session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    pub surname: String,
    pub middle_name: String,
    pub phone: String,
    pub email: String,
    pub country: String,
}

impl UserProfile {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
            && self.surname.is_empty()
            && self.middle_name.is_empty()
            && self.phone.is_empty()
            && self.email.is_empty()
            && self.country.is_empty()
    }

    pub fn from_user(user: &User) -> Self {
        Self {
            name: user.name.clone(),
            surname: user.surname.clone(),
            middle_name: user.middle_name.clone().unwrap_or_default(),
            phone: user.phone.clone(),
            email: user.email.clone(),
            country: user.country.clone(),
        }
    }
}

pub struct ProfileManager {
    api: Arc<ApiClient>,
    session: Arc<dyn SessionStore>,
    booking: Arc<BookingStore>,
    form: Mutex<UserProfile>,
    original: Mutex<UserProfile>,
    loading: AtomicBool,
    saving: AtomicBool,
}

impl ProfileManager {
    pub fn new(
        api: Arc<ApiClient>,
        session: Arc<dyn SessionStore>,
        booking: Arc<BookingStore>,
    ) -> Self {
        Self {
            api,
            session,
            booking,
            form: Mutex::new(UserProfile::default()),
            original: Mutex::new(UserProfile::default()),
            loading: AtomicBool::new(false),
            saving: AtomicBool::new(false),
        }
    }

    pub fn form(&self) -> UserProfile {
        self.form.lock().clone()
    }

    pub fn set_form(&self, profile: UserProfile) {
        *self.form.lock() = profile;
    }

    pub fn is_dirty(&self) -> bool {
        *self.form.lock() != *self.original.lock()
    }

    pub fn loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn saving(&self) -> bool {
        self.saving.load(Ordering::SeqCst)
    }

    /// Fetches the profile. The session user and the cache are updated
    /// first; the form is only re-derived when it was still empty, so
    /// unsaved edits survive a background refresh.
    pub async fn fetch_profile(&self) -> Result<User, ProfileError> {
        self.loading.store(true, Ordering::SeqCst);
        let outcome = async {
            self.api
                .get::<User>(PROFILE_PATH, &[], DEFAULT_TIMEOUT)
                .await?
                .into_payload()
                .map_err(ProfileError::from)
        }
        .await;
        self.loading.store(false, Ordering::SeqCst);

        let user = match outcome {
            Ok(user) => user,
            Err(err) => {
                warn!(error = %err, "profile fetch failed");
                return Err(err);
            }
        };

        self.session.set_user(user.clone());
        let fetched = UserProfile::from_user(&user);
        self.booking.cache_profile_if_absent(&user.id, fetched.clone());
        let effective = self.booking.user_profile(&user.id).unwrap_or(fetched);

        {
            let mut form = self.form.lock();
            if form.is_empty() {
                *form = effective.clone();
                *self.original.lock() = effective;
            }
        }
        debug!(user = %user.id, "profile loaded");
        Ok(user)
    }

    /// Persists the current form. On success the merged profile is the
    /// new baseline: session user, cache and `original` all updated.
    pub async fn save_profile(&self) -> Result<(), ProfileError> {
        let user = self.session.user().ok_or(ProfileError::NotAuthenticated)?;
        let form = self.form.lock().clone();

        let body = json!({
            "name": form.name,
            "surname": form.surname,
            "middle_name": form.middle_name,
            "phone": form.phone,
            "email": form.email,
            "country": form.country,
        });

        self.saving.store(true, Ordering::SeqCst);
        let outcome = async {
            self.api
                .put::<User>(PROFILE_PATH, body, DEFAULT_TIMEOUT)
                .await?
                .into_payload()
                .map_err(ProfileError::from)
        }
        .await;
        self.saving.store(false, Ordering::SeqCst);

        let saved = match outcome {
            Ok(saved) => saved,
            Err(err) => {
                warn!(error = %err, "profile save failed");
                return Err(err);
            }
        };

        self.session.set_user(saved.clone());
        self.booking
            .save_user_profile(&saved.id, UserProfile::from_user(&saved));
        *self.original.lock() = form;
        Ok(())
    }

    /// Pre-fills still-empty guest forms from the saved profile (when one
    /// exists) or the session user.
    pub fn prefill_guest_forms(&self) -> Result<(), ProfileError> {
        let user = self.session.user().ok_or(ProfileError::NotAuthenticated)?;
        let data = match self.booking.user_profile(&user.id) {
            Some(profile) => GuestForm {
                name: profile.name,
                surname: profile.surname,
                middle_name: profile.middle_name,
                phone: profile.phone,
                email: profile.email,
            },
            None => guest_form_from_user(&user),
        };
        self.booking.fill_empty_guest_forms(&data);
        Ok(())
    }
}
