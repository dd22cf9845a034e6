//! Token-authenticated JSON client shared by all platforms.

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::PlatformConfig;
use crate::errors::{ApiRequestError, AuthenticationError};

/// How the token is presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`.
    Bearer,
    /// HTTP basic auth with the token as user name.
    Basic,
    /// The token as the value of a named header.
    Header(String),
}

impl AuthScheme {
    /// `None` is bearer; `"basic"` is basic auth; anything else is a header name.
    pub fn from_header_setting(setting: Option<&str>) -> Self {
        match setting {
            None => Self::Bearer,
            Some(s) if s.eq_ignore_ascii_case("bearer") => Self::Bearer,
            Some(s) if s.eq_ignore_ascii_case("basic") => Self::Basic,
            Some(name) => Self::Header(name.to_string()),
        }
    }
}

/// Asynchronous JSON API client for one platform.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    platform: String,
    base_url: String,
    auth: AuthScheme,
    token: String,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("platform", &self.platform)
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Build a client. A missing or empty token fails before any request.
    pub fn new(
        platform: &str,
        base_url: &str,
        token: Option<&str>,
        token_env: &str,
        auth: AuthScheme,
    ) -> Result<Self, AuthenticationError> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthenticationError::MissingCredential {
                platform: platform.to_string(),
                env_var: token_env.to_string(),
            })?
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("rostersync/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "falling back to default HTTP client");
                reqwest::Client::new()
            });

        let base_url = base_url.trim_end_matches('/').to_string();
        info!(platform, base_url = %base_url, "created ApiClient");
        Ok(Self {
            http,
            platform: platform.to_string(),
            base_url,
            auth,
            token,
        })
    }

    pub fn from_config(name: &str, config: &PlatformConfig) -> Result<Self, AuthenticationError> {
        Self::new(
            name,
            &config.base_url,
            config.token.as_deref(),
            &config.token_env,
            AuthScheme::from_header_setting(config.auth_header.as_deref()),
        )
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    pub async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Value, ApiRequestError> {
        self.send_json(Method::GET, path, query, None).await
    }

    /// Send a request and decode the JSON response. An empty body is `null`.
    #[instrument(skip(self, query, body), fields(platform = %self.platform))]
    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value, ApiRequestError> {
        let url = self.url(path);
        let mut req = self.http.request(method.clone(), &url);
        req = match &self.auth {
            AuthScheme::Bearer => req.bearer_auth(&self.token),
            AuthScheme::Basic => req.basic_auth(&self.token, Some("")),
            AuthScheme::Header(name) => req.header(name.as_str(), &self.token),
        };
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            warn!(%method, url = %url, status = status.as_u16(), "API request failed");
            return Err(ApiRequestError::Status {
                method: method.to_string(),
                url,
                status: status.as_u16(),
                body: text,
            });
        }

        debug!(%method, url = %url, bytes = text.len(), "API request succeeded");
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiRequestError::Decode {
            url,
            detail: e.to_string(),
        })
    }
}
