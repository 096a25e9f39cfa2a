use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method, StatusCode,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, error};
use uuid::Uuid;

use shared_config::AppConfig;

/// How long a slot lock is held before it is considered abandoned.
const LOCK_TTL_SECONDS: i64 = 30;

/// PostgREST-backed transactional store.
///
/// Status updates go through [`StoreClient::update_where`], which carries the
/// expected prior state as a row filter: an empty result set means the
/// precondition no longer held and nothing was written.
pub struct StoreClient {
    client: Client,
    base_url: String,
    anon_key: String,
}

impl StoreClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.store_url.clone(),
            anon_key: config.store_anon_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Ok(key) = HeaderValue::from_str(&self.anon_key) {
            headers.insert("apikey", key);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token {
            if let Ok(bearer) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, bearer);
            }
        }

        headers
    }

    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.request_with_headers(method, path, auth_token, body, None)
            .await
    }

    pub async fn request_with_headers<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making request to {}", url);

        let mut headers = self.get_headers(auth_token);
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("Store error ({}): {}", status, error_text);

            return Err(match status.as_u16() {
                401 | 403 => anyhow!("Authentication error: {}", error_text),
                404 => anyhow!("Resource not found: {}", error_text),
                409 => anyhow!("Conflict: {}", error_text),
                _ => anyhow!("Store error ({}): {}", status, error_text),
            });
        }

        let data = response.json::<T>().await?;
        Ok(data)
    }

    /// Conditional update: PATCH rows matching `filter`, returning the rows
    /// actually written. The filter doubles as the compare-and-set
    /// precondition (e.g. `id=eq.<id>&status=eq.scheduled`); an empty vec
    /// means no row matched and the update did not apply.
    pub async fn update_where<T>(
        &self,
        table: &str,
        filter: &str,
        patch: Value,
        auth_token: Option<&str>,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let path = format!("/rest/v1/{}?{}", table, filter);

        let mut headers = HeaderMap::new();
        headers.insert(
            "Prefer",
            HeaderValue::from_static("return=representation"),
        );

        self.request_with_headers(Method::PATCH, &path, auth_token, Some(patch), Some(headers))
            .await
    }

    /// Insert returning the created rows.
    pub async fn insert<T>(
        &self,
        table: &str,
        row: Value,
        auth_token: Option<&str>,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let path = format!("/rest/v1/{}", table);

        let mut headers = HeaderMap::new();
        headers.insert(
            "Prefer",
            HeaderValue::from_static("return=representation"),
        );

        self.request_with_headers(Method::POST, &path, auth_token, Some(row), Some(headers))
            .await
    }

    /// Try to take the slot lock named `lock_key` for `doctor_id`.
    ///
    /// The `slot_locks` table has a unique constraint on `lock_key`, so only
    /// one writer wins; a 409 from the store means another booking holds the
    /// lock. Stale locks (crashed holders) are swept before the attempt.
    pub async fn acquire_slot_lock(
        &self,
        lock_key: &str,
        doctor_id: Uuid,
        auth_token: Option<&str>,
    ) -> Result<bool> {
        self.sweep_expired_locks(auth_token).await?;

        let now = Utc::now();
        let lock_row = json!({
            "lock_key": lock_key,
            "doctor_id": doctor_id,
            "acquired_at": now.to_rfc3339(),
            "expires_at": (now + Duration::seconds(LOCK_TTL_SECONDS)).to_rfc3339(),
            "holder": format!("booking_{}", Uuid::new_v4()),
        });

        let url = format!("{}/rest/v1/slot_locks", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.get_headers(auth_token))
            .json(&lock_row)
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => Ok(true),
            status => {
                let error_text = response.text().await?;
                Err(anyhow!("Lock acquisition failed ({}): {}", status, error_text))
            }
        }
    }

    /// DELETE matching rows. PostgREST answers 204 with an empty body, so
    /// this does not try to parse a payload.
    pub async fn delete(&self, path: &str, auth_token: Option<&str>) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Deleting via {}", url);

        let response = self
            .client
            .delete(&url)
            .headers(self.get_headers(auth_token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("Store error ({}): {}", status, error_text);
            return Err(anyhow!("Store error ({}): {}", status, error_text));
        }

        Ok(())
    }

    pub async fn release_slot_lock(
        &self,
        lock_key: &str,
        auth_token: Option<&str>,
    ) -> Result<()> {
        let path = format!("/rest/v1/slot_locks?lock_key=eq.{}", lock_key);
        self.delete(&path, auth_token).await
    }

    async fn sweep_expired_locks(&self, auth_token: Option<&str>) -> Result<()> {
        let cutoff: DateTime<Utc> = Utc::now();
        let path = format!(
            "/rest/v1/slot_locks?expires_at=lt.{}",
            urlencoding::encode(&cutoff.to_rfc3339())
        );
        self.delete(&path, auth_token).await
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}
