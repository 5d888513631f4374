// Month-keyed cache for the price calendar.
//
// Prices are fetched one calendar month at a time and merged additively
// into a shared date -> price map. Concurrent requests for the same month
// coalesce onto a single network call, and a month is only marked loaded
// after its fetch succeeds, so failures stay retryable.

use chrono::{Datelike, NaiveDate};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{ApiClient, DEFAULT_TIMEOUT};
use crate::payload::PriceCalendarEntry;

const CALENDAR_PATH: &str = "/v1/search/calendar";

pub const MIN_CALENDAR_YEAR: i32 = 2024;
pub const MAX_CALENDAR_YEAR: i32 = 2100;

type MonthKey = (i32, u32);
type FetchFuture = Shared<BoxFuture<'static, Result<(), String>>>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalendarError {
    #[error("calendar month out of range: {0}")]
    MonthOutOfRange(u32),

    #[error("calendar year out of range: {0}")]
    YearOutOfRange(i32),

    #[error("calendar fetch failed: {0}")]
    Fetch(String),
}

struct CacheInner {
    api: Arc<ApiClient>,
    prices: DashMap<NaiveDate, f64>,
    loaded_months: Mutex<HashSet<MonthKey>>,
    pending: Mutex<HashMap<MonthKey, FetchFuture>>,
    active: AtomicUsize,
    last_error: Mutex<Option<String>>,
}

#[derive(Clone)]
pub struct CalendarPriceCache {
    inner: Arc<CacheInner>,
}

impl CalendarPriceCache {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                api,
                prices: DashMap::new(),
                loaded_months: Mutex::new(HashSet::new()),
                pending: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                last_error: Mutex::new(None),
            }),
        }
    }

    /// Ensures the given month's prices are cached, fetching at most once.
    /// Callers awaiting the same month share one network request.
    pub async fn fetch_prices(&self, year: i32, month: u32) -> Result<(), CalendarError> {
        if !(1..=12).contains(&month) {
            return Err(CalendarError::MonthOutOfRange(month));
        }
        if !(MIN_CALENDAR_YEAR..=MAX_CALENDAR_YEAR).contains(&year) {
            return Err(CalendarError::YearOutOfRange(year));
        }

        let key = (year, month);
        if self.month_is_cached(key) {
            return Ok(());
        }

        let fut = {
            let mut pending = self.inner.pending.lock();
            if let Some(existing) = pending.get(&key) {
                existing.clone()
            } else {
                let fut = self.spawn_fetch(key);
                pending.insert(key, fut.clone());
                fut
            }
        };

        fut.await.map_err(CalendarError::Fetch)
    }

    /// Loaded-marker check with self-healing: a marker with no cached date
    /// in the month (lost to an eviction or reset) is dropped so the month
    /// refetches.
    fn month_is_cached(&self, key: MonthKey) -> bool {
        let mut loaded = self.inner.loaded_months.lock();
        if !loaded.contains(&key) {
            return false;
        }
        let has_data = self
            .inner
            .prices
            .iter()
            .any(|entry| entry.key().year() == key.0 && entry.key().month() == key.1);
        if !has_data {
            warn!(year = key.0, month = key.1, "calendar marker without data, refetching");
            loaded.remove(&key);
            return false;
        }
        true
    }

    fn spawn_fetch(&self, key: MonthKey) -> FetchFuture {
        let inner = Arc::clone(&self.inner);
        inner.active.fetch_add(1, Ordering::SeqCst);

        // Spawned so a caller dropping its await cannot stall other
        // waiters; the task itself releases the pending slot and counter.
        let handle = tokio::spawn(async move {
            let result = Self::do_fetch(&inner, key).await;
            match &result {
                Ok(count) => {
                    inner.loaded_months.lock().insert(key);
                    *inner.last_error.lock() = None;
                    debug!(year = key.0, month = key.1, prices = *count, "calendar month loaded");
                }
                Err(err) => {
                    *inner.last_error.lock() = Some(err.clone());
                    warn!(year = key.0, month = key.1, error = %err, "calendar fetch failed");
                }
            }
            inner.pending.lock().remove(&key);
            inner.active.fetch_sub(1, Ordering::SeqCst);
            result.map(|_| ())
        });

        handle
            .map(|joined| match joined {
                Ok(result) => result,
                Err(err) => Err(format!("calendar task failed: {err}")),
            })
            .boxed()
            .shared()
    }

    async fn do_fetch(inner: &Arc<CacheInner>, key: MonthKey) -> Result<usize, String> {
        let query = [("month", key.1.to_string()), ("year", key.0.to_string())];
        let entries: Vec<PriceCalendarEntry> = inner
            .api
            .get(CALENDAR_PATH, &query, DEFAULT_TIMEOUT)
            .await
            .and_then(|resp| resp.into_payload())
            .map_err(|err| err.to_string())?;

        let mut stored = 0;
        for entry in entries {
            let Ok(date) = NaiveDate::parse_from_str(&entry.date_at, "%Y-%m-%d") else {
                continue;
            };
            if let Some(price) = entry.min_price {
                inner.prices.insert(date, price);
                stored += 1;
            }
        }
        Ok(stored)
    }

    pub fn get_price_for_date(&self, date: NaiveDate) -> Option<f64> {
        self.inner.prices.get(&date).map(|entry| *entry.value())
    }

    /// Drops the month's loaded marker and refetches it.
    pub async fn refresh(&self, year: i32, month: u32) -> Result<(), CalendarError> {
        self.inner.loaded_months.lock().remove(&(year, month));
        self.fetch_prices(year, month).await
    }

    /// Wipes prices, loaded markers and the in-flight coalescing map, so
    /// callers arriving after a full reset never attach to a pre-reset
    /// fetch.
    pub fn clear(&self) {
        self.inner.prices.clear();
        self.inner.loaded_months.lock().clear();
        self.inner.pending.lock().clear();
        *self.inner.last_error.lock() = None;
    }

    /// True while at least one month fetch is in flight.
    pub fn loading(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst) > 0
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock_transport::{envelope, MockTransport};
    use crate::session::MemorySession;
    use serde_json::json;
    use std::time::Duration;

    fn cache_with(transport: Arc<MockTransport>) -> CalendarPriceCache {
        let session = Arc::new(MemorySession::new());
        CalendarPriceCache::new(Arc::new(ApiClient::new(transport, session)))
    }

    fn month_payload() -> serde_json::Value {
        envelope(json!([
            { "date_at": "2026-09-01", "min_price": 4200 },
            { "date_at": "2026-09-02", "min_price": "3900" },
            { "date_at": "2026-09-03", "min_price": null },
        ]))
    }

    #[tokio::test]
    async fn caches_month_and_skips_second_fetch() {
        let transport = MockTransport::new();
        transport.push(CALENDAR_PATH, 200, month_payload());
        let cache = cache_with(Arc::clone(&transport));

        cache.fetch_prices(2026, 9).await.unwrap();
        cache.fetch_prices(2026, 9).await.unwrap();

        assert_eq!(transport.call_count(CALENDAR_PATH), 1);
        let date = NaiveDate::from_ymd_opt(2026, 9, 2).unwrap();
        assert_eq!(cache.get_price_for_date(date), Some(3900.0));
        let gap = NaiveDate::from_ymd_opt(2026, 9, 3).unwrap();
        assert_eq!(cache.get_price_for_date(gap), None);
    }

    #[tokio::test]
    async fn concurrent_fetches_share_one_request() {
        let transport = MockTransport::new();
        transport.push(CALENDAR_PATH, 200, month_payload());
        transport.set_delay(CALENDAR_PATH, Duration::from_millis(50));
        let cache = cache_with(Arc::clone(&transport));

        let (a, b, c) = tokio::join!(
            cache.fetch_prices(2026, 9),
            cache.fetch_prices(2026, 9),
            cache.fetch_prices(2026, 9),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(transport.call_count(CALENDAR_PATH), 1);
    }

    #[tokio::test]
    async fn rejects_out_of_range_without_network() {
        let transport = MockTransport::new();
        let cache = cache_with(Arc::clone(&transport));

        assert_eq!(
            cache.fetch_prices(2026, 0).await,
            Err(CalendarError::MonthOutOfRange(0))
        );
        assert_eq!(
            cache.fetch_prices(2026, 13).await,
            Err(CalendarError::MonthOutOfRange(13))
        );
        assert_eq!(
            cache.fetch_prices(2023, 6).await,
            Err(CalendarError::YearOutOfRange(2023))
        );
        assert_eq!(
            cache.fetch_prices(2101, 6).await,
            Err(CalendarError::YearOutOfRange(2101))
        );
        assert_eq!(transport.call_count(CALENDAR_PATH), 0);
    }

    #[tokio::test]
    async fn failed_fetch_stays_retryable() {
        let transport = MockTransport::new();
        transport.push(CALENDAR_PATH, 500, json!({ "message": "upstream down" }));
        transport.push(CALENDAR_PATH, 200, month_payload());
        let cache = cache_with(Arc::clone(&transport));

        assert!(cache.fetch_prices(2026, 9).await.is_err());
        assert!(cache.last_error().is_some());

        cache.fetch_prices(2026, 9).await.unwrap();
        assert_eq!(transport.call_count(CALENDAR_PATH), 2);
        assert!(cache.last_error().is_none());
    }

    #[tokio::test]
    async fn marker_without_data_self_heals() {
        let transport = MockTransport::new();
        transport.push(CALENDAR_PATH, 200, month_payload());
        transport.push(CALENDAR_PATH, 200, month_payload());
        let cache = cache_with(Arc::clone(&transport));

        cache.fetch_prices(2026, 9).await.unwrap();
        // Simulate a reset that dropped the dates but kept the marker.
        cache.inner.prices.clear();

        cache.fetch_prices(2026, 9).await.unwrap();
        assert_eq!(transport.call_count(CALENDAR_PATH), 2);
        let date = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        assert_eq!(cache.get_price_for_date(date), Some(4200.0));
    }

    #[tokio::test]
    async fn refresh_refetches_a_loaded_month() {
        let transport = MockTransport::new();
        transport.push(CALENDAR_PATH, 200, month_payload());
        transport.push(
            CALENDAR_PATH,
            200,
            envelope(json!([{ "date_at": "2026-09-01", "min_price": 5000 }])),
        );
        let cache = cache_with(Arc::clone(&transport));

        cache.fetch_prices(2026, 9).await.unwrap();
        cache.refresh(2026, 9).await.unwrap();

        assert_eq!(transport.call_count(CALENDAR_PATH), 2);
        let date = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        assert_eq!(cache.get_price_for_date(date), Some(5000.0));
    }

    #[tokio::test]
    async fn clear_drops_in_flight_coalescing_entries() {
        let transport = MockTransport::new();
        transport.push(CALENDAR_PATH, 200, month_payload());
        transport.push(CALENDAR_PATH, 200, month_payload());
        transport.set_delay(CALENDAR_PATH, Duration::from_millis(50));
        let cache = cache_with(Arc::clone(&transport));

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch_prices(2026, 9).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        cache.clear();
        assert!(cache.inner.pending.lock().is_empty());

        // A caller arriving after the reset issues its own fetch instead
        // of attaching to the pre-reset one.
        let second = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch_prices(2026, 9).await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(transport.call_count(CALENDAR_PATH), 2);
    }

    #[tokio::test]
    async fn loading_tracks_in_flight_fetches() {
        let transport = MockTransport::new();
        transport.push(CALENDAR_PATH, 200, month_payload());
        transport.set_delay(CALENDAR_PATH, Duration::from_millis(50));
        let cache = cache_with(Arc::clone(&transport));

        assert!(!cache.loading());
        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.fetch_prices(2026, 9).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.loading());
        pending.await.unwrap().unwrap();
        assert!(!cache.loading());
    }
}
