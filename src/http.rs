//! HTTP client for the group location service.
//!
//! Endpoints, relative to the configured base URL:
//! - `PUT  {base}/groups/{group}/members/{member}/location` with a
//!   [`MemberStateUpdate`] JSON body
//! - `GET  {base}/groups/{group}/locations` returning `[MemberLocation]`
//!
//! Both carry `Authorization: Bearer <token>` from the [`CredentialProvider`].
//! A 429 is retried here with a short backoff; every other failure is
//! returned to the sync loop, which owns the longer backoff.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};

use crate::error::GuideError;
use crate::group::{CredentialProvider, GroupLocationService, MemberLocation, MemberStateUpdate};

const MAX_RETRIES: u32 = 3;
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// `reqwest` implementation of [`GroupLocationService`].
pub struct GroupLocationClient {
    client: Client,
    base_url: Url,
    credentials: CredentialProvider,
}

impl GroupLocationClient {
    /// Fails with [`GuideError::InvalidConfig`] when `base_url` is not an
    /// absolute http(s) URL.
    pub fn new(base_url: &str, credentials: CredentialProvider) -> Result<Self, GuideError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| GuideError::InvalidConfig(format!("group service URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(GuideError::InvalidConfig(format!(
                "group service URL cannot take a path: {}",
                base_url
            )));
        }

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| GuideError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, base_url, credentials })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Base URL with `segments` appended, each one percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, GuideError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GuideError::InvalidConfig(format!("cannot extend {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn member_location_url(&self, group_id: &str, member_id: &str) -> Result<Url, GuideError> {
        self.endpoint(&["groups", group_id, "members", member_id, "location"])
    }

    fn group_locations_url(&self, group_id: &str) -> Result<Url, GuideError> {
        self.endpoint(&["groups", group_id, "locations"])
    }

    fn bearer(&self) -> Result<String, GuideError> {
        match (self.credentials)() {
            Some(token) if !token.is_empty() => Ok(format!("Bearer {}", token)),
            _ => Err(GuideError::MissingCredential),
        }
    }

    /// Send with 429 retries. Non-2xx statuses become [`GuideError::Http`].
    async fn send(
        &self,
        label: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, GuideError> {
        let auth = self.bearer()?;
        let start = Instant::now();
        let mut retries = 0;

        loop {
            let response = build()
                .header(reqwest::header::AUTHORIZATION, auth.as_str())
                .send()
                .await
                .map_err(|e| GuideError::Network(e.to_string()))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && retries < MAX_RETRIES {
                retries += 1;
                let wait = Duration::from_millis(500 * (1 << retries.min(3)));
                warn!(
                    "[GroupClient] {} got 429 after {:?}, retry {} with {:?} backoff",
                    label,
                    start.elapsed(),
                    retries,
                    wait
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if !status.is_success() {
                warn!("[GroupClient] {} failed: HTTP {}", label, status);
                return Err(GuideError::Http { status: status.as_u16() });
            }

            debug!("[GroupClient] {} ok in {:?}", label, start.elapsed());
            return Ok(response);
        }
    }
}

#[async_trait]
impl GroupLocationService for GroupLocationClient {
    async fn push_state(
        &self,
        group_id: &str,
        member_id: &str,
        update: &MemberStateUpdate,
    ) -> Result<(), GuideError> {
        let url = self.member_location_url(group_id, member_id)?;
        self.send("push", || self.client.put(url.clone()).json(update)).await?;
        Ok(())
    }

    async fn fetch_members(&self, group_id: &str) -> Result<Vec<MemberLocation>, GuideError> {
        let url = self.group_locations_url(group_id)?;
        let response = self.send("pull", || self.client.get(url.clone())).await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GuideError::Network(format!("Body download error: {}", e)))?;
        let members: Vec<MemberLocation> = serde_json::from_slice(&bytes).map_err(|e| {
            warn!("[GroupClient] Unreadable roster for group {}: {}", group_id, e);
            GuideError::Decode(e.to_string())
        })?;

        info!(
            "[GroupClient] Pulled {} members for group {} ({:.1}KB)",
            members.len(),
            group_id,
            bytes.len() as f64 / 1024.0
        );
        Ok(members)
    }
}
