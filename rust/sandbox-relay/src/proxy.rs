//! Performing network requests on behalf of the sandbox.
//!
//! The sandbox lives in another origin, so it can neither send the host's
//! session cookies nor reach endpoints that only accept same-site callers.
//! It hands its requests to the host instead, and the host runs them through
//! a [`HandleRequest`] implementation: [`FetchProxy`] by default, or any
//! handler the embedding application supplies.
//!
//! A handler issues each request once. Retrying is the caller's business, and
//! an HTTP error status is a perfectly good [`ProxyResponse`].

use std::future::Future;

use async_trait::async_trait;
use reqwest::{Client, Method};
use sandbox_common::{ConditionalSend, ConditionalSync};

use crate::{HeaderMap, NetworkError, ProxyRequest, ProxyResponse};

/// Runs a proxied request and reports what happened.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait HandleRequest: ConditionalSend + ConditionalSync {
    /// Perform `request` exactly once.
    async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse, NetworkError>;
}

/// Adapts an async closure into a [`HandleRequest`].
///
/// ```
/// use sandbox_relay::{HandlerFn, NetworkError, ProxyRequest, ProxyResponse};
///
/// let handler = HandlerFn::new(|_request: ProxyRequest| async {
///     Ok::<_, NetworkError>(ProxyResponse::new(204))
/// });
/// # let _ = handler;
/// ```
pub struct HandlerFn<F>(F);

impl<F> HandlerFn<F> {
    /// Wraps `handler`.
    pub fn new(handler: F) -> Self {
        Self(handler)
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl<F, Fut> HandleRequest for HandlerFn<F>
where
    F: Fn(ProxyRequest) -> Fut + ConditionalSend + ConditionalSync,
    Fut: Future<Output = Result<ProxyResponse, NetworkError>> + ConditionalSend,
{
    async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse, NetworkError> {
        (self.0)(request).await
    }
}

/// Configuration for [`FetchProxy`]
#[derive(Clone, Debug, Default)]
pub struct FetchProxyConfig {
    /// Send the host's cookies with proxied requests
    pub include_cookies: bool,

    /// Optional timeout for requests in seconds. Ignored in the browser,
    /// where the page's fetch decides.
    pub timeout_seconds: Option<u64>,
}

impl FetchProxyConfig {
    /// Choose whether session cookies accompany proxied requests.
    pub fn with_cookies(mut self, include_cookies: bool) -> Self {
        self.include_cookies = include_cookies;
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

/// The default [`HandleRequest`]: sends the request with the host's own HTTP
/// stack.
///
/// In the browser this is the page's `fetch`, with `credentials: "include"`
/// when cookies are enabled and `"same-origin"` otherwise. Natively the
/// client keeps a cookie jar when cookies are enabled, so that a session
/// established through the proxy is presented on later requests.
#[derive(Clone, Debug)]
pub struct FetchProxy {
    config: FetchProxyConfig,
    client: Client,
}

impl Default for FetchProxy {
    fn default() -> Self {
        Self::new(FetchProxyConfig::default())
    }
}

impl FetchProxy {
    /// Create a proxy with the given configuration
    pub fn new(config: FetchProxyConfig) -> Self {
        #[allow(unused_mut)]
        let mut client_builder = Client::builder();

        #[cfg(not(target_arch = "wasm32"))]
        {
            client_builder = client_builder.cookie_store(config.include_cookies);

            if let Some(timeout) = config.timeout_seconds {
                client_builder = client_builder.timeout(std::time::Duration::from_secs(timeout));
            }
        }

        let client = client_builder.build().unwrap_or_else(|_| Client::new());

        Self { config, client }
    }

    /// Whether requests carry the host's credentials.
    pub fn includes_cookies(&self) -> bool {
        self.config.include_cookies
    }

    fn build_request(&self, request: ProxyRequest) -> Result<reqwest::RequestBuilder, NetworkError> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|error| NetworkError::InvalidRequest(error.to_string()))?;

        let mut builder = self.client.request(method, &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        #[cfg(target_arch = "wasm32")]
        {
            builder = if self.config.include_cookies {
                builder.fetch_credentials_include()
            } else {
                builder.fetch_credentials_same_origin()
            };
        }

        Ok(builder)
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl HandleRequest for FetchProxy {
    async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse, NetworkError> {
        let response = self.build_request(request)?.send().await?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .text()
            .await
            .map_err(|error| NetworkError::Body(error.to_string()))?;

        Ok(ProxyResponse {
            status,
            headers,
            body: Some(body),
        })
    }
}

/// Flattens response headers into the wire map, joining repeated values the
/// way `Headers.get` does in the browser.
fn collect_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut collected = HeaderMap::new();

    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };

        collected
            .entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    collected
}
