// src/clients/memory.rs
// HTTP adapter for the memory service.

use super::MemoryBackend;
use crate::config::ServiceProfiles;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

/// Connect timeout; overall request deadlines are owned by the ingest
/// driver's per-item timeout.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Provider status code the service returns when its upstream is
/// rate-limiting.
const PROVIDER_RATE_LIMIT_CODE: i64 = 1302;

/// reqwest-backed client for a memU-compatible memory service.
pub struct HttpMemoryClient {
    profiles: ServiceProfiles,
    http: reqwest::Client,
}

impl HttpMemoryClient {
    pub fn new(profiles: ServiceProfiles) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { profiles, http }
    }

    fn endpoint(&self, name: &str) -> String {
        format!(
            "{}/api/v1/{}",
            self.profiles.server_base_url.trim_end_matches('/'),
            name
        )
    }

    fn llm_profiles(&self) -> Value {
        json!({
            "default": {
                "provider": self.profiles.chat.provider,
                "base_url": self.profiles.chat.base_url,
                "api_key": self.profiles.chat.api_key,
                "chat_model": self.profiles.chat.model,
            },
            "embedding": {
                "provider": self.profiles.embed.provider,
                "base_url": self.profiles.embed.base_url,
                "api_key": self.profiles.embed.api_key,
                "embed_model": self.profiles.embed.model,
            }
        })
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value> {
        let mut request = self.http.post(endpoint).json(&body);
        if let Some(key) = self.profiles.chat.api_key.as_deref() {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::RateLimited(format!("HTTP 429: {text}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::Provider(format!("HTTP {status}: {text}")));
        }

        let payload: Value = response.json().await.unwrap_or(Value::Null);
        if payload.get("code").and_then(Value::as_i64) == Some(PROVIDER_RATE_LIMIT_CODE) {
            return Err(SyncError::RateLimited(format!(
                "provider code {PROVIDER_RATE_LIMIT_CODE}"
            )));
        }
        Ok(payload)
    }
}

#[async_trait]
impl MemoryBackend for HttpMemoryClient {
    async fn memorize(&self, resource_url: &str, modality: &str, user_id: &str) -> Result<()> {
        let body = json!({
            "resource_url": resource_url,
            "modality": modality,
            "user": {"user_id": user_id},
            "llm_profiles": self.llm_profiles(),
        });
        self.post(&self.endpoint("memorize"), body).await?;
        Ok(())
    }

    async fn retrieve(&self, queries: &[String], filter: Option<Value>) -> Result<Value> {
        let body = json!({
            "queries": queries,
            "filter": filter.unwrap_or(Value::Null),
        });
        self.post(&self.endpoint("retrieve"), body).await
    }
}
