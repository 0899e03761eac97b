//! HTTP client with rate limiting for the REST API of a node.
//!
//! The realtime protocol leans on a handful of REST calls: the node version
//! decides which WebSocket path to use, the node info lists the source
//! managers it can load from, resuming is configured by patching the session,
//! and stale players are probed by fetching them.
//!
//! # Rate Limiting
//!
//! Requests to a node are throttled to 10 per second with bursts up to the
//! same number. Requests that would exceed the limit are delayed.
//!
//! # Example
//!
//! ```rust
//! use lavaclient::http::{Client, NodeApi};
//!
//! let client = Client::new(&node_config)?;
//! let version = client.version().await?;
//! ```

use std::{future::Future, num::NonZeroU32, time::Duration};

use async_trait::async_trait;
use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Method, Url,
};
use serde::{Deserialize, Serialize};

use crate::{
    config::NodeConfig,
    error::{Error, Result},
    protocol,
};

/// Body of a session update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub resuming_key: String,

    /// Seconds the node keeps the session after a disconnect.
    pub timeout: u64,
}

/// What a node reports it can do.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeInfo {
    pub source_managers: Vec<String>,
    pub filters: Vec<String>,
    pub plugins: Vec<Plugin>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Plugin {
    pub name: String,
    pub version: String,
}

/// A player as stored in a node session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionPlayer {
    pub voice: VoiceState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VoiceState {
    pub connected: bool,
}

/// REST calls the realtime client makes to a node.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Returns the version string the node reports, like `4.0.8`.
    async fn version(&self) -> Result<String>;

    async fn info(&self, api: u64) -> Result<NodeInfo>;

    async fn patch_session(&self, api: u64, session: &str, update: &SessionUpdate)
        -> Result<()>;

    async fn session_player(&self, api: u64, session: &str, guild_id: u64)
        -> Result<SessionPlayer>;
}

/// HTTP client for a single node.
pub struct Client {
    /// Client without rate limiting.
    pub unlimited: reqwest::Client,

    rate_limiter: DefaultDirectRateLimiter,

    base: Url,
}

impl Client {
    /// Maximum requests per second to a node.
    const RATE_LIMIT_PER_SECOND: u32 = 10;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for individual network reads.
    const READ_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates a client that sends the node password with every request.
    ///
    /// # Errors
    ///
    /// Returns error if the password is not a valid header value, the base
    /// URL cannot be formed or the HTTP client cannot be built.
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let base = Url::parse(&config.http_base())?;
        Self::with_base(config, base)
    }

    /// Creates a client for a node reachable at `base`.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_base(config: &NodeConfig, base: Url) -> Result<Self> {
        let mut password = HeaderValue::from_str(&config.password)?;
        password.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, password);

        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .default_headers(headers)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));

        let quota = Quota::per_second(
            NonZeroU32::new(Self::RATE_LIMIT_PER_SECOND).unwrap_or(NonZeroU32::MIN),
        );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
            base,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base.join(path).map_err(Into::into)
    }

    /// Builds a request with specified method, URL and body.
    pub fn request<T>(&self, method: Method, url: Url, body: Option<T>) -> Result<reqwest::Request>
    where
        T: Serialize,
    {
        let mut request = reqwest::Request::new(method, url);
        if let Some(body) = body {
            *request.body_mut() = Some(serde_json::to_vec(&body)?.into());
            request
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        Ok(request)
    }

    /// Executes a request with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the node answers with an error
    /// status.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| {
            self.unlimited
                .execute(request)
                .map_err(Into::into)
                .and_then(|response| async move {
                    response.error_for_status().map_err(Error::from)
                })
        })
    }

    async fn text(&self, method: Method, path: &str, body: Option<impl Serialize>) -> Result<String> {
        let request = self.request(method, self.url(path)?, body)?;
        let response = self.execute(request).await?;
        response.text().await.map_err(Into::into)
    }
}

#[async_trait]
impl NodeApi for Client {
    async fn version(&self) -> Result<String> {
        let version = self.text(Method::GET, "/version", None::<()>).await?;
        Ok(version.trim().to_owned())
    }

    async fn info(&self, api: u64) -> Result<NodeInfo> {
        let body = self
            .text(Method::GET, &format!("/v{api}/info"), None::<()>)
            .await?;
        protocol::json(&body, "info")
    }

    async fn patch_session(
        &self,
        api: u64,
        session: &str,
        update: &SessionUpdate,
    ) -> Result<()> {
        self.text(Method::PATCH, &format!("/v{api}/sessions/{session}"), Some(update))
            .await
            .map(|_| ())
    }

    async fn session_player(
        &self,
        api: u64,
        session: &str,
        guild_id: u64,
    ) -> Result<SessionPlayer> {
        let body = self
            .text(
                Method::GET,
                &format!("/v{api}/sessions/{session}/players/{guild_id}"),
                None::<()>,
            )
            .await?;
        protocol::json(&body, "session player")
    }
}
