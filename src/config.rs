//! Client construction options.
//!
//! Options are caller-supplied at construction; there is no config file.
//! Use the builder for anything beyond a bare token:
//!
//! ```ignore
//! let options = ClientOptions::builder()
//!     .token("header.payload.sig")
//!     .application("MetaApi")
//!     .request_timeout(Duration::from_secs(30))
//!     .build();
//! let client = GatewayClient::new(options);
//! ```

use std::time::Duration;

/// Default application id stamped on every request.
pub const DEFAULT_APPLICATION: &str = "MetaApi";
/// Default gateway domain interpolated into the connection URL.
pub const DEFAULT_DOMAIN: &str = "agiliumtrade.agiliumtrade.ai";
/// Default per-RPC deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Default socket initial-connect deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a [`GatewayClient`](crate::client::GatewayClient).
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bearer token appended as the `auth-token` query parameter.
    pub token: String,
    /// Application id stamped on every request.
    pub application: String,
    /// Gateway domain; the connection URL is `https://mt-client-api-v1.<domain>`.
    pub domain: String,
    /// Full URL override (tests and on-premises deployments). When set,
    /// `domain` is ignored.
    pub url: Option<String>,
    /// Default per-RPC deadline.
    pub request_timeout: Duration,
    /// Socket initial-connect deadline.
    pub connect_timeout: Duration,
}

impl ClientOptions {
    /// Create an options builder.
    #[must_use]
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }

    /// Options with defaults for everything except the token.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self::builder().token(token).build()
    }

    /// The websocket URL the client dials, with scheme rewritten and the
    /// auth token attached.
    #[must_use]
    pub fn websocket_url(&self) -> String {
        let base = self
            .url
            .clone()
            .unwrap_or_else(|| format!("https://mt-client-api-v1.{}", self.domain));
        let base = base
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        format!("{}/ws?auth-token={}", base.trim_end_matches('/'), self.token)
    }
}

/// Builder for [`ClientOptions`].
#[derive(Debug, Default)]
pub struct ClientOptionsBuilder {
    token: Option<String>,
    application: Option<String>,
    domain: Option<String>,
    url: Option<String>,
    request_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
}

impl ClientOptionsBuilder {
    /// Set the auth token (required).
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the application id stamped on requests.
    #[must_use]
    pub fn application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    /// Set the gateway domain.
    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Override the gateway URL entirely (tests, on-premises deployments).
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the default per-RPC deadline.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the socket initial-connect deadline.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Build the options.
    ///
    /// # Panics
    ///
    /// Panics if `token` was not set.
    #[must_use]
    pub fn build(self) -> ClientOptions {
        ClientOptions {
            token: self.token.expect("token is required"),
            application: self
                .application
                .unwrap_or_else(|| DEFAULT_APPLICATION.to_string()),
            domain: self.domain.unwrap_or_else(|| DEFAULT_DOMAIN.to_string()),
            url: self.url,
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}
