//! What an embedder can configure.
//!
//! [`EmbedSettings`] and [`InitialState`] are plain data and deserialize from
//! the camel-cased options object the JavaScript bindings receive. The
//! parts that cannot be expressed as data (the mount target and a custom
//! request handler) live alongside them in [`EmbedOptions`].

use std::{fmt, sync::Arc};

use sandbox_relay::{HandleRequest, HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::ConfigurationError;

/// Where the sandbox UI is served from unless configured otherwise.
pub const DEFAULT_SANDBOX_URL: &str = "https://sandbox.embed.apollographql.com/sandbox/explorer";

/// Location of the sandbox UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxConfig {
    /// URL the iframe loads; its origin is the only origin the relay trusts
    pub url: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SANDBOX_URL)
    }
}

impl SandboxConfig {
    /// Point embeds at a sandbox served from `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// The parsed sandbox URL together with its serialized origin.
    pub fn resolve(&self) -> Result<(Url, String), ConfigurationError> {
        let url = Url::parse(&self.url)
            .map_err(|error| ConfigurationError::InvalidSandboxUrl(error.to_string()))?;

        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(ConfigurationError::InvalidSandboxUrl(format!(
                "{} has no origin",
                self.url
            )));
        }

        Ok((url, origin.ascii_serialization()))
    }
}

/// The operation the sandbox opens with.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitialState {
    /// GraphQL document shown in the editor
    pub document: Option<String>,
    /// Variables for the document
    pub variables: Option<Map<String, Value>>,
    /// Headers sent with the document
    pub headers: Option<HeaderMap>,
}

impl InitialState {
    /// Start from `document`.
    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    /// Provide variables.
    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Provide a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HeaderMap::new)
            .insert(name.into(), value.into());
        self
    }
}

/// The serializable part of [`EmbedOptions`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbedSettings {
    /// Endpoint the sandbox targets when it opens
    pub initial_endpoint: Option<String>,
    /// Operation the sandbox opens with
    pub initial_state: Option<InitialState>,
    /// Let the sandbox keep its tabs and settings between page loads
    pub persist_explorer_state: bool,
    /// Send the host's cookies with proxied requests. Ignored when a custom
    /// request handler is supplied.
    pub include_cookies: bool,
}

/// Where to mount the sandbox iframe.
#[derive(Clone, Debug)]
pub enum MountTarget {
    /// A CSS selector; the first matching element receives the iframe
    Selector(String),
    /// An element the caller already holds
    #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
    Element(web_sys::Element),
}

impl MountTarget {
    fn is_blank(&self) -> bool {
        match self {
            MountTarget::Selector(selector) => selector.trim().is_empty(),
            #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
            MountTarget::Element(_) => false,
        }
    }
}

impl From<&str> for MountTarget {
    fn from(selector: &str) -> Self {
        MountTarget::Selector(selector.to_string())
    }
}

impl From<String> for MountTarget {
    fn from(selector: String) -> Self {
        MountTarget::Selector(selector)
    }
}

#[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
impl From<web_sys::Element> for MountTarget {
    fn from(element: web_sys::Element) -> Self {
        MountTarget::Element(element)
    }
}

/// Everything needed to create one embedded sandbox.
#[derive(Clone, Default)]
pub struct EmbedOptions {
    /// Where the iframe goes. Required.
    pub target: Option<MountTarget>,
    /// Initial state and relay behaviour
    pub settings: EmbedSettings,
    /// Performs proxied requests instead of the built-in fetch proxy
    pub request_handler: Option<Arc<dyn HandleRequest>>,
}

impl fmt::Debug for EmbedOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbedOptions")
            .field("target", &self.target)
            .field("settings", &self.settings)
            .field("request_handler", &self.request_handler.is_some())
            .finish()
    }
}

impl EmbedOptions {
    /// Options that mount into `target`.
    pub fn new(target: impl Into<MountTarget>) -> Self {
        Self {
            target: Some(target.into()),
            ..Default::default()
        }
    }

    /// Replace all serializable settings at once.
    pub fn with_settings(mut self, settings: EmbedSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the endpoint the sandbox opens with.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.settings.initial_endpoint = Some(endpoint.into());
        self
    }

    /// Set the operation the sandbox opens with.
    pub fn with_initial_state(mut self, state: InitialState) -> Self {
        self.settings.initial_state = Some(state);
        self
    }

    /// Let the sandbox persist its state.
    pub fn with_persisted_state(mut self, persist: bool) -> Self {
        self.settings.persist_explorer_state = persist;
        self
    }

    /// Send cookies with proxied requests.
    pub fn with_cookies(mut self, include_cookies: bool) -> Self {
        self.settings.include_cookies = include_cookies;
        self
    }

    /// Perform proxied requests with `handler`.
    pub fn with_request_handler(mut self, handler: impl HandleRequest + 'static) -> Self {
        self.request_handler = Some(Arc::new(handler));
        self
    }

    /// The mount target, unless it is missing or blank.
    pub(crate) fn mount_target(&self) -> Result<&MountTarget, ConfigurationError> {
        self.target
            .as_ref()
            .filter(|target| !target.is_blank())
            .ok_or(ConfigurationError::MissingTarget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn it_reads_camel_cased_settings() -> anyhow::Result<()> {
        let settings: EmbedSettings = serde_json::from_value(json!({
            "target": "#sandbox",
            "initialEndpoint": "https://api.example.com/graphql",
            "initialState": {
                "document": "query Me { me { id } }",
                "variables": { "first": 10 },
                "headers": { "authorization": "Bearer 1" }
            },
            "includeCookies": true
        }))?;

        assert_eq!(
            settings,
            EmbedSettings {
                initial_endpoint: Some("https://api.example.com/graphql".into()),
                initial_state: Some(
                    InitialState::default()
                        .with_document("query Me { me { id } }")
                        .with_variables(json!({ "first": 10 }).as_object().cloned().unwrap())
                        .with_header("authorization", "Bearer 1")
                ),
                persist_explorer_state: false,
                include_cookies: true,
            }
        );
        Ok(())
    }

    #[test]
    fn it_derives_the_sandbox_origin() -> anyhow::Result<()> {
        let (url, origin) = SandboxConfig::default().resolve()?;

        assert_eq!(url.as_str(), DEFAULT_SANDBOX_URL);
        assert_eq!(origin, "https://sandbox.embed.apollographql.com");

        let (_, origin) = SandboxConfig::new("http://localhost:3000/sandbox").resolve()?;
        assert_eq!(origin, "http://localhost:3000");
        Ok(())
    }

    #[test]
    fn it_rejects_sandbox_urls_without_an_origin() {
        assert!(matches!(
            SandboxConfig::new("not a url").resolve(),
            Err(ConfigurationError::InvalidSandboxUrl(_))
        ));
        assert!(matches!(
            SandboxConfig::new("data:text/html,hello").resolve(),
            Err(ConfigurationError::InvalidSandboxUrl(_))
        ));
    }

    #[test]
    fn it_requires_a_non_blank_target() {
        assert_eq!(
            EmbedOptions::default().mount_target().err(),
            Some(ConfigurationError::MissingTarget)
        );
        assert_eq!(
            EmbedOptions::new("  ").mount_target().err(),
            Some(ConfigurationError::MissingTarget)
        );
        assert!(EmbedOptions::new("#sandbox").mount_target().is_ok());
    }
}
