use sandbox_relay::FrameId;
use url::Url;

use crate::{ConfigurationError, EmbedSettings};

/// Inline style applied to every sandbox iframe.
pub const FRAME_STYLE: &str = "height: 100%; width: 100%; border: none;";

/// The iframe to create for one embed instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameSpec {
    /// Instance number allocated by the page
    pub instance: u64,
    /// DOM id of the iframe
    pub id: FrameId,
    /// URL the iframe loads, initial state included
    pub src: Url,
    /// Inline style of the iframe
    pub style: &'static str,
}

impl FrameSpec {
    /// Describe the iframe for `instance`, loading `src`.
    pub fn new(instance: u64, src: Url) -> Self {
        Self {
            instance,
            id: frame_id(instance),
            src,
            style: FRAME_STYLE,
        }
    }
}

/// The DOM id given to the iframe of `instance`.
pub fn frame_id(instance: u64) -> FrameId {
    FrameId::new(format!("embedded-sandbox-{instance}"))
}

/// Builds the iframe URL, carrying the initial state as query parameters.
///
/// Parameters without a value are left out, and the URL serializer takes
/// care of escaping.
pub fn frame_src(sandbox: &Url, settings: &EmbedSettings) -> Result<Url, ConfigurationError> {
    let state = settings.initial_state.clone().unwrap_or_default();

    let variables = state
        .variables
        .as_ref()
        .map(serde_json::to_string_pretty)
        .transpose()
        .map_err(|error| ConfigurationError::InvalidInitialState(error.to_string()))?;

    let headers = state
        .headers
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|error| ConfigurationError::InvalidInitialState(error.to_string()))?;

    let mut src = sandbox.clone();
    {
        let mut query = src.query_pairs_mut();

        if let Some(endpoint) = &settings.initial_endpoint {
            query.append_pair("endpoint", endpoint);
        }
        if let Some(document) = &state.document {
            query.append_pair("defaultDocument", document);
        }
        if let Some(variables) = &variables {
            query.append_pair("defaultVariables", variables);
        }
        if let Some(headers) = &headers {
            query.append_pair("defaultHeaders", headers);
        }

        query.append_pair(
            "shouldPersistState",
            if settings.persist_explorer_state {
                "true"
            } else {
                "false"
            },
        );
        query.append_pair("version", env!("CARGO_PKG_VERSION"));
    }

    Ok(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InitialState;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;

    fn sandbox() -> Url {
        Url::parse(crate::DEFAULT_SANDBOX_URL).unwrap()
    }

    fn params(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn it_names_frames_after_their_instance() {
        assert_eq!(frame_id(0).as_str(), "embedded-sandbox-0");
        assert_eq!(frame_id(12).as_str(), "embedded-sandbox-12");
    }

    #[test]
    fn it_only_sends_the_flags_when_nothing_else_is_set() {
        let src = frame_src(&sandbox(), &EmbedSettings::default()).unwrap();

        let keys: Vec<String> = src.query_pairs().map(|(key, _)| key.into_owned()).collect();
        assert_eq!(keys, vec!["shouldPersistState", "version"]);
        assert_eq!(params(&src)["shouldPersistState"], "false");
        assert_eq!(params(&src)["version"], env!("CARGO_PKG_VERSION"));
        assert!(src.as_str().starts_with(crate::DEFAULT_SANDBOX_URL));
    }

    #[test]
    fn it_encodes_the_initial_state() {
        let settings = EmbedSettings {
            initial_endpoint: Some("https://api.example.com/graphql?team=a&b".into()),
            initial_state: Some(
                InitialState::default()
                    .with_document("query Q($first: Int) { items(first: $first) { id } }")
                    .with_variables(json!({ "first": 10 }).as_object().cloned().unwrap())
                    .with_header("authorization", "Bearer abc"),
            ),
            persist_explorer_state: true,
            include_cookies: false,
        };

        let src = frame_src(&sandbox(), &settings).unwrap();
        let params = params(&src);

        assert_eq!(params["endpoint"], "https://api.example.com/graphql?team=a&b");
        assert_eq!(
            params["defaultDocument"],
            "query Q($first: Int) { items(first: $first) { id } }"
        );
        assert_eq!(params["defaultVariables"], "{\n  \"first\": 10\n}");
        assert_eq!(params["defaultHeaders"], r#"{"authorization":"Bearer abc"}"#);
        assert_eq!(params["shouldPersistState"], "true");
        assert!(!src.query().unwrap_or_default().contains('$'));
    }
}
