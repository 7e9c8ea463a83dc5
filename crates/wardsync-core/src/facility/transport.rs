//! Facility to central transport

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::SyncableRecord;
use crate::protocol::{
    AbandonRequest, CompletePushResponse, InitiatePullResponse, PullPage, PushRequest,
    PushResponse, SessionReport, StartSyncRequest, StartSyncResponse,
};
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// The calls a facility makes against the central server during one sync
#[allow(async_fn_in_trait)]
pub trait SyncTransport {
    async fn start(&self, request: &StartSyncRequest) -> Result<StartSyncResponse>;

    async fn initiate_pull(&self, session_id: &str) -> Result<InitiatePullResponse>;

    async fn pull(&self, session_id: &str, offset: u64, limit: u32) -> Result<PullPage>;

    async fn push(&self, session_id: &str, records: Vec<SyncableRecord>) -> Result<PushResponse>;

    async fn complete_push(&self, session_id: &str) -> Result<CompletePushResponse>;

    async fn status(&self, session_id: &str) -> Result<SessionReport>;

    /// Tell central to fail the session
    async fn abandon(&self, session_id: &str, reason: &str) -> Result<()>;
}

/// JSON over HTTP against `wardsync-api`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            client: reqwest::Client::builder().build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;
        read_json(response).await
    }
}

impl SyncTransport for HttpTransport {
    async fn start(&self, request: &StartSyncRequest) -> Result<StartSyncResponse> {
        self.post_json("/sync/start", request).await
    }

    async fn initiate_pull(&self, session_id: &str) -> Result<InitiatePullResponse> {
        self.post_json(&format!("/sync/{session_id}/pull/initiate"), &())
            .await
    }

    async fn pull(&self, session_id: &str, offset: u64, limit: u32) -> Result<PullPage> {
        let response = self
            .client
            .get(self.url(&format!("/sync/{session_id}/pull")))
            .query(&[("offset", offset), ("limit", u64::from(limit))])
            .header("Accept", "application/json")
            .send()
            .await?;
        read_json(response).await
    }

    async fn push(&self, session_id: &str, records: Vec<SyncableRecord>) -> Result<PushResponse> {
        self.post_json(&format!("/sync/{session_id}/push"), &PushRequest { records })
            .await
    }

    async fn complete_push(&self, session_id: &str) -> Result<CompletePushResponse> {
        self.post_json(&format!("/sync/{session_id}/push/complete"), &())
            .await
    }

    async fn status(&self, session_id: &str) -> Result<SessionReport> {
        let response = self
            .client
            .get(self.url(&format!("/sync/{session_id}/status")))
            .header("Accept", "application/json")
            .send()
            .await?;
        read_json(response).await
    }

    async fn abandon(&self, session_id: &str, reason: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/sync/{session_id}")))
            .json(&AbandonRequest {
                reason: Some(reason.to_string()),
            })
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(Error::Transport(parse_api_error(status, &body)))
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Transport(parse_api_error(status, &body)));
    }
    Ok(response.json::<T>().await?)
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{trimmed} ({})", status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base_url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput("central URL must not be empty".to_string()))?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "central URL must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_validated_and_trimmed() {
        assert!(HttpTransport::new("").is_err());
        assert!(HttpTransport::new("central.example.org").is_err());

        let transport = HttpTransport::new(" https://central.example.org/ ").unwrap();
        assert_eq!(transport.base_url(), "https://central.example.org");
        assert_eq!(
            transport.url("/sync/start"),
            "https://central.example.org/sync/start"
        );
    }

    #[test]
    fn api_errors_prefer_json_message() {
        let message = parse_api_error(
            StatusCode::CONFLICT,
            r#"{"error":"Race condition in session s1"}"#,
        );
        assert_eq!(message, "Race condition in session s1 (409)");

        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
        assert_eq!(
            parse_api_error(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            "boom (500)"
        );
    }
}
