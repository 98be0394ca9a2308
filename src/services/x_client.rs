//! X (Twitter) API v2 client
//!
//! Read side used by the monitor (user timelines, username lookup) plus the
//! OAuth 2.0 token exchange used when a wallet links its account.

use super::x_errors::XApiError;
use crate::config::XApi;
use crate::types::Post;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Max posts requested per timeline read (the v2 ceiling)
const MAX_RESULTS: u32 = 100;

/// A page of posts newer than the requested cursor
#[derive(Debug, Clone, Default)]
pub struct PostPage {
    pub posts: Vec<Post>,
    /// Newest post id in the page, if the page is non-empty
    pub newest_cursor: Option<String>,
    /// Token for the next (older) page; `None` on the last page
    pub next_token: Option<String>,
}

/// Read access to a social platform
#[async_trait]
pub trait SocialReader: Send + Sync {
    /// Posts from `account_id` newer than `since`, newest first. Pass the
    /// previous page's `next_token` to continue with older posts.
    async fn list_recent_posts(
        &self,
        account_id: &str,
        since: Option<&str>,
        page_token: Option<&str>,
        credential: &str,
    ) -> Result<PostPage, XApiError>;

    /// Resolve a username to an account id; `None` if the user does not exist
    async fn resolve_username(
        &self,
        username: &str,
        credential: &str,
    ) -> Result<Option<String>, XApiError>;
}

#[derive(Debug, Deserialize)]
struct TimelineResponse {
    #[serde(default)]
    data: Vec<Post>,
    #[serde(default)]
    meta: Option<TimelineMeta>,
}

#[derive(Debug, Deserialize)]
struct TimelineMeta {
    #[serde(default)]
    newest_id: Option<String>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserLookupResponse {
    #[serde(default)]
    data: Option<XUser>,
}

/// X user profile
#[derive(Debug, Clone, Deserialize)]
pub struct XUser {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profile_image_url: Option<String>,
}

/// Tokens returned by the OAuth 2.0 token endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in.map(|secs| now + ChronoDuration::seconds(secs))
    }
}

/// HTTP client for the X API
#[derive(Clone)]
pub struct XClient {
    client: Client,
    base_url: String,
}

impl XClient {
    pub fn new() -> Self {
        Self::with_base_url(XApi::BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        credential: &str,
    ) -> Result<T, XApiError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(credential)
            .query(query)
            .send()
            .await
            .map_err(|e| XApiError::from_network_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let reset = response
                .headers()
                .get("x-rate-limit-reset")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(XApiError::from_response(status.as_u16(), &body, reset.as_deref()));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| XApiError::Decode(e.to_string()))
    }

    /// Exchange an authorization code (PKCE) for tokens
    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, XApiError> {
        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", client_id, client_secret));

        let response = self
            .client
            .post(format!("{}/2/oauth2/token", self.base_url))
            .header("Authorization", format!("Basic {}", basic))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("client_id", client_id),
                ("code_verifier", code_verifier),
            ])
            .send()
            .await
            .map_err(|e| XApiError::from_network_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(XApiError::from_response(status.as_u16(), &body, None));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| XApiError::Decode(e.to_string()))
    }

    /// Profile of the user owning `access_token`
    pub async fn fetch_me(&self, access_token: &str) -> Result<XUser, XApiError> {
        let url = format!("{}/2/users/me", self.base_url);
        let resp: UserLookupResponse = self
            .get_json(&url, &[("user.fields", "profile_image_url".to_string())], access_token)
            .await?;
        resp.data
            .ok_or_else(|| XApiError::Decode("missing user in /users/me response".to_string()))
    }
}

impl Default for XClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SocialReader for XClient {
    async fn list_recent_posts(
        &self,
        account_id: &str,
        since: Option<&str>,
        page_token: Option<&str>,
        credential: &str,
    ) -> Result<PostPage, XApiError> {
        let url = format!("{}/2/users/{}/tweets", self.base_url, account_id);
        let mut query = vec![
            ("max_results", MAX_RESULTS.to_string()),
            ("tweet.fields", "created_at,author_id".to_string()),
        ];
        if let Some(since_id) = since {
            query.push(("since_id", since_id.to_string()));
        }
        if let Some(token) = page_token {
            query.push(("pagination_token", token.to_string()));
        }

        let resp: TimelineResponse = self.get_json(&url, &query, credential).await?;
        debug!("Fetched {} posts for account {}", resp.data.len(), account_id);

        if resp.data.is_empty() {
            return Ok(PostPage::default());
        }

        let (newest_id, next_token) = match resp.meta {
            Some(meta) => (meta.newest_id, meta.next_token),
            None => (None, None),
        };
        let newest_cursor = newest_id.or_else(|| {
            resp.data
                .iter()
                .max_by(|a, b| crate::types::compare_post_ids(&a.id, &b.id))
                .map(|p| p.id.clone())
        });

        Ok(PostPage {
            posts: resp.data,
            newest_cursor,
            next_token,
        })
    }

    async fn resolve_username(
        &self,
        username: &str,
        credential: &str,
    ) -> Result<Option<String>, XApiError> {
        let url = format!(
            "{}/2/users/by/username/{}",
            self.base_url,
            urlencoding::encode(username)
        );
        match self.get_json::<UserLookupResponse>(&url, &[], credential).await {
            Ok(resp) => Ok(resp.data.map(|u| u.id)),
            Err(XApiError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeline_payload_parses() {
        let body = r#"{
            "data": [
                {"id": "1800", "text": "hello", "created_at": "2026-01-02T03:04:05.000Z", "author_id": "42"},
                {"id": "1799", "text": "older"}
            ],
            "meta": {"newest_id": "1800", "oldest_id": "1799", "result_count": 2, "next_token": "7140dibdnow9c7btw"}
        }"#;
        let resp: TimelineResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.data.len(), 2);
        assert_eq!(resp.data[0].author_id.as_deref(), Some("42"));
        assert!(resp.data[0].created_at.is_some());
        assert!(resp.data[1].created_at.is_none());
        let meta = resp.meta.unwrap();
        assert_eq!(meta.newest_id.as_deref(), Some("1800"));
        assert_eq!(meta.next_token.as_deref(), Some("7140dibdnow9c7btw"));
    }

    #[test]
    fn test_empty_timeline_parses() {
        let resp: TimelineResponse = serde_json::from_str(r#"{"meta":{"result_count":0}}"#).unwrap();
        assert!(resp.data.is_empty());
    }

    #[test]
    fn test_token_expiry() {
        let token: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","expires_in":7200,"token_type":"bearer"}"#)
                .unwrap();
        let now = Utc::now();
        assert_eq!(token.expires_at(now), Some(now + ChronoDuration::seconds(7200)));
        assert!(token.refresh_token.is_none());
    }
}
