// HTTP client wrapper: bearer-token injection plus single-flight token
// refresh with a single replay of the failed request.

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::session::SessionStore;

pub const REFRESH_PATH: &str = "/v1/auth/refresh";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend response envelope shared by every endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default = "Option::default")]
    pub payload: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub errors: Option<HashMap<String, Vec<String>>>,
}

impl<T> ApiResponse<T> {
    /// Unwraps the payload of a successful envelope; a `success: false`
    /// envelope becomes [`ApiError::Rejected`] carrying the server message
    /// and field errors verbatim.
    pub fn into_payload(self) -> Result<T, ApiError> {
        if self.success {
            self.payload.ok_or_else(|| {
                ApiError::Decode("successful response carried no payload".to_string())
            })
        } else {
            Err(ApiError::Rejected {
                message: self
                    .message
                    .unwrap_or_else(|| "request rejected by the server".to_string()),
                errors: self.errors.unwrap_or_default(),
            })
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("session expired")]
    SessionExpired,

    #[error("{message}")]
    Response {
        status: u16,
        message: String,
        data: Option<Value>,
    },

    #[error("{message}")]
    Rejected {
        message: String,
        errors: HashMap<String, Vec<String>>,
    },

    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl ApiError {
    fn from_response(resp: HttpResponse) -> Self {
        let message = resp
            .body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("request failed with status {}", resp.status));
        ApiError::Response {
            status: resp.status,
            message,
            data: (!resp.body.is_null()).then_some(resp.body),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub bearer: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

/// Transport seam under the client; tests substitute a scripted mock, the
/// real implementation is [`ReqwestTransport`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        // Normalize: no trailing slash, no trailing /v1 (paths carry it).
        let mut base_url: String = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        if let Some(stripped) = base_url.strip_suffix("/v1") {
            base_url = stripped.to_string();
        }
        // Redirects must surface as statuses: the 401/302 refresh trigger
        // never fires if the client follows them transparently.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client with static configuration");
        Self { client, base_url }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let url = format!("{}{}", self.base_url, request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
        };

        let mut builder = self
            .client
            .request(method, &url)
            .timeout(request.timeout)
            .header("Accept", "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(bearer) = &request.bearer {
            builder = builder.bearer_auth(bearer);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let timeout_ms = request.timeout.as_millis() as u64;
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                ApiError::Timeout(timeout_ms)
            } else {
                ApiError::Network(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(HttpResponse { status, body })
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String, String>>>;

/// Thin request layer over a [`Transport`]. Injects the session bearer
/// token, and on a 401/302 from anything but the refresh endpoint runs a
/// process-wide single-flight refresh and replays the request exactly once.
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    session: Arc<dyn SessionStore>,
    refresh_slot: Arc<Mutex<Option<RefreshFuture>>>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<dyn SessionStore>) -> Self {
        Self {
            transport,
            session,
            refresh_slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_base_url(base_url: impl Into<String>, session: Arc<dyn SessionStore>) -> Self {
        Self::new(Arc::new(ReqwestTransport::new(base_url)), session)
    }

    pub fn session(&self) -> &Arc<dyn SessionStore> {
        &self.session
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<ApiResponse<T>, ApiError> {
        self.request(Method::Get, path, query, None, timeout).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<ApiResponse<T>, ApiError> {
        self.request(Method::Post, path, &[], Some(body), timeout)
            .await
    }

    pub async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
        timeout: Duration,
    ) -> Result<ApiResponse<T>, ApiError> {
        self.request(Method::Put, path, &[], Some(body), timeout)
            .await
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        timeout: Duration,
    ) -> Result<ApiResponse<T>, ApiError> {
        let value = self
            .request_value(method, path, query, body, timeout)
            .await?;
        serde_json::from_value(value).map_err(|err| ApiError::Decode(err.to_string()))
    }

    async fn request_value(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ApiError> {
        let query: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let mut attempt = 0u8;

        loop {
            let request = HttpRequest {
                method,
                path: path.to_string(),
                query: query.clone(),
                body: body.clone(),
                bearer: self.session.token(),
                timeout,
            };
            let response = self.transport.send(request).await?;

            let auth_rejected = response.status == 401 || response.status == 302;
            if auth_rejected && !path.contains(REFRESH_PATH) {
                if attempt == 0 {
                    tracing::debug!(status = response.status, path, "auth rejected, refreshing token");
                    self.refresh_token().await?;
                    attempt = 1;
                    continue;
                }
                // Replay with a fresh token was rejected too: give up and
                // drop the local session.
                tracing::warn!(path, "request rejected after token refresh, clearing session");
                self.session.clear();
                return Err(ApiError::SessionExpired);
            }

            if !(200..300).contains(&response.status) {
                return Err(ApiError::from_response(response));
            }
            return Ok(response.body);
        }
    }

    /// Single-flight refresh: concurrent callers share one in-flight
    /// exchange. The refresh runs on a spawned task so a caller dropping
    /// its await cannot stall the other waiters, and the slot is cleared
    /// by the task itself once the exchange settles.
    async fn refresh_token(&self) -> Result<String, ApiError> {
        let fut = {
            let mut slot = self.refresh_slot.lock();
            if let Some(existing) = slot.clone() {
                existing
            } else {
                let transport = self.transport.clone();
                let session = self.session.clone();
                let slot_handle = self.refresh_slot.clone();
                let task = tokio::spawn(async move {
                    let result = do_refresh(transport, session.clone()).await;
                    if result.is_err() {
                        session.clear();
                    }
                    slot_handle.lock().take();
                    result
                });
                let fut: RefreshFuture = task
                    .map(|joined| match joined {
                        Ok(result) => result,
                        Err(err) => Err(format!("refresh task failed: {err}")),
                    })
                    .boxed()
                    .shared();
                *slot = Some(fut.clone());
                fut
            }
        };

        fut.await.map_err(|err| {
            tracing::warn!(%err, "token refresh failed");
            ApiError::SessionExpired
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenPayload {
    token: String,
}

async fn do_refresh(
    transport: Arc<dyn Transport>,
    session: Arc<dyn SessionStore>,
) -> Result<String, String> {
    // No body and no bearer: the exchange rides on the session credential.
    let request = HttpRequest {
        method: Method::Post,
        path: REFRESH_PATH.to_string(),
        query: Vec::new(),
        body: None,
        bearer: None,
        timeout: DEFAULT_TIMEOUT,
    };
    let response = transport.send(request).await.map_err(|e| e.to_string())?;
    if !(200..300).contains(&response.status) {
        return Err(format!("refresh rejected with status {}", response.status));
    }

    let envelope: ApiResponse<TokenPayload> =
        serde_json::from_value(response.body).map_err(|e| e.to_string())?;
    match envelope.payload {
        Some(payload) if envelope.success => {
            session.set_token(payload.token.clone());
            tracing::debug!("token refreshed");
            Ok(payload.token)
        }
        _ => Err("refresh response carried no token".to_string()),
    }
}

#[cfg(test)]
pub(crate) mod mock_transport {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport: per-path FIFO of replies plus an optional
    /// artificial delay to force request overlap in concurrency tests.
    pub struct MockTransport {
        replies: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
        delays: Mutex<HashMap<String, Duration>>,
        calls: Mutex<Vec<HttpRequest>>,
    }

    impl MockTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(HashMap::new()),
                delays: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            })
        }

        pub fn push(&self, path: &str, status: u16, body: Value) {
            self.replies
                .lock()
                .entry(path.to_string())
                .or_default()
                .push_back(HttpResponse { status, body });
        }

        pub fn set_delay(&self, path: &str, delay: Duration) {
            self.delays.lock().insert(path.to_string(), delay);
        }

        pub fn call_count(&self, path: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.path == path).count()
        }

        pub fn bearers(&self, path: &str) -> Vec<Option<String>> {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.path == path)
                .map(|c| c.bearer.clone())
                .collect()
        }

        pub fn last_body(&self, path: &str) -> Option<Value> {
            self.calls
                .lock()
                .iter()
                .rev()
                .find(|c| c.path == path)
                .and_then(|c| c.body.clone())
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
            let delay = self.delays.lock().get(&request.path).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let path = request.path.clone();
            self.calls.lock().push(request);
            self.replies
                .lock()
                .get_mut(&path)
                .and_then(VecDeque::pop_front)
                .ok_or_else(|| ApiError::Network(format!("no scripted reply for {path}")))
        }
    }

    pub fn envelope(payload: Value) -> Value {
        serde_json::json!({ "success": true, "payload": payload })
    }
}
