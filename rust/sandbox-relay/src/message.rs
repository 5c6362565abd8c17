//! The messages exchanged between the host page and the sandbox iframe.
//!
//! Every message travels in the same envelope:
//!
//! ```text
//! { "name": "ExplorerRequest", "correlationId": "7", "payload": { ... } }
//! ```
//!
//! `name` selects one of the [`RelayMessage`] kinds, `correlationId` pairs a
//! request with its answer and is required exactly on the correlated kinds,
//! and `payload` carries the kind-specific body. Unknown fields are ignored
//! so that either side can grow the protocol without breaking the other.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::ValidationError;

/// Header names and values, as exchanged on the wire.
pub type HeaderMap = BTreeMap<String, String>;

const NAME: &str = "name";
const CORRELATION_ID: &str = "correlationId";
const PAYLOAD: &str = "payload";

/// Opaque identifier pairing a request with its response or error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wraps an identifier chosen by the sandbox.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The `name` discriminant of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageName {
    /// The sandbox finished loading and is listening (iframe → host)
    Ready,
    /// A network request to proxy (iframe → host)
    Request,
    /// The result of a proxied request (host → iframe)
    Response,
    /// A proxied request failed (host → iframe)
    Error,
    /// A schema update (host → iframe)
    SchemaPush,
}

impl MessageName {
    /// Every kind this relay understands.
    pub const ALL: [MessageName; 5] = [
        MessageName::Ready,
        MessageName::Request,
        MessageName::Response,
        MessageName::Error,
        MessageName::SchemaPush,
    ];

    /// The wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageName::Ready => "ExplorerListeningForSchema",
            MessageName::Request => "ExplorerRequest",
            MessageName::Response => "ExplorerResponse",
            MessageName::Error => "ExplorerError",
            MessageName::SchemaPush => "SchemaResponse",
        }
    }

    /// Whether envelopes of this kind must carry a `correlationId`.
    pub fn is_correlated(&self) -> bool {
        matches!(
            self,
            MessageName::Request | MessageName::Response | MessageName::Error
        )
    }
}

impl fmt::Display for MessageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageName {
    type Err = ValidationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        MessageName::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == name)
            .ok_or_else(|| ValidationError::UnknownName(name.to_string()))
    }
}

/// A network request the sandbox wants the host to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// HTTP method, e.g. `POST`
    pub method: String,
    /// Absolute URL of the GraphQL endpoint
    pub url: String,
    /// Request headers
    #[serde(default)]
    pub headers: HeaderMap,
    /// Request body, usually the JSON-encoded GraphQL operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ProxyRequest {
    /// A request without headers or body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// What the endpoint answered, whatever the status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    #[serde(default)]
    pub headers: HeaderMap,
    /// Response body as text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ProxyResponse {
    /// A response with the given status and no headers or body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Why a proxied request produced no response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human readable failure
    pub message: String,
    /// Status associated with the failure, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl From<&crate::NetworkError> for ErrorPayload {
    fn from(error: &crate::NetworkError) -> Self {
        Self {
            message: error.to_string(),
            status: error.status(),
        }
    }
}

/// A schema the host already knows, handed to the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Schema {
    /// Schema definition language text
    Sdl(String),
    /// A structured introspection query result
    Introspection(Map<String, Value>),
}

#[derive(Serialize, Deserialize)]
struct SchemaPayload {
    schema: Schema,
}

/// One message on the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// The sandbox is loaded and listening for schema pushes
    Ready,
    /// Perform `request` and answer with the same correlation id
    Request {
        /// Pairs the answer with this request
        correlation_id: CorrelationId,
        /// What to send
        request: ProxyRequest,
    },
    /// The answer to a request
    Response {
        /// The id of the request being answered
        correlation_id: CorrelationId,
        /// What the endpoint returned
        response: ProxyResponse,
    },
    /// A request failed before any response arrived
    Error {
        /// The id of the request being answered
        correlation_id: CorrelationId,
        /// What went wrong
        error: ErrorPayload,
    },
    /// A schema update; fire-and-forget
    SchemaPush {
        /// The new schema
        schema: Schema,
    },
}

impl RelayMessage {
    /// The envelope name of this message.
    pub fn name(&self) -> MessageName {
        match self {
            RelayMessage::Ready => MessageName::Ready,
            RelayMessage::Request { .. } => MessageName::Request,
            RelayMessage::Response { .. } => MessageName::Response,
            RelayMessage::Error { .. } => MessageName::Error,
            RelayMessage::SchemaPush { .. } => MessageName::SchemaPush,
        }
    }

    /// The correlation id, for the kinds that carry one.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            RelayMessage::Request { correlation_id, .. }
            | RelayMessage::Response { correlation_id, .. }
            | RelayMessage::Error { correlation_id, .. } => Some(correlation_id),
            RelayMessage::Ready | RelayMessage::SchemaPush { .. } => None,
        }
    }

    /// Decodes an envelope received from the other side.
    pub fn decode(raw: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut envelope) = raw else {
            return Err(ValidationError::NotAnObject);
        };

        let name = match envelope.remove(NAME) {
            Some(Value::String(name)) => name.parse::<MessageName>()?,
            _ => return Err(ValidationError::MissingName),
        };

        let correlation_id = match envelope.remove(CORRELATION_ID) {
            Some(Value::String(id)) => Some(CorrelationId(id)),
            None | Some(Value::Null) => None,
            Some(_) => {
                return Err(ValidationError::InvalidPayload {
                    name,
                    reason: "correlationId must be a string".into(),
                });
            }
        };

        let payload = envelope
            .remove(PAYLOAD)
            .unwrap_or_else(|| Value::Object(Map::new()));

        let message = match (name, correlation_id) {
            (MessageName::Request, Some(correlation_id)) => RelayMessage::Request {
                correlation_id,
                request: payload_of(name, payload)?,
            },
            (MessageName::Response, Some(correlation_id)) => RelayMessage::Response {
                correlation_id,
                response: payload_of(name, payload)?,
            },
            (MessageName::Error, Some(correlation_id)) => RelayMessage::Error {
                correlation_id,
                error: payload_of(name, payload)?,
            },
            (MessageName::SchemaPush, _) => {
                let SchemaPayload { schema } = payload_of(name, payload)?;
                RelayMessage::SchemaPush { schema }
            }
            (MessageName::Ready, _) => RelayMessage::Ready,
            (name, None) => return Err(ValidationError::MissingCorrelationId(name)),
        };

        Ok(message)
    }

    /// Parses and decodes a JSON string.
    pub fn decode_str(raw: &str) -> Result<Self, ValidationError> {
        let value = serde_json::from_str(raw)
            .map_err(|error| ValidationError::Malformed(error.to_string()))?;
        Self::decode(value)
    }

    /// Encodes this message into its envelope.
    pub fn encode(&self) -> Value {
        let mut envelope = Map::new();
        envelope.insert(NAME.into(), Value::String(self.name().as_str().into()));

        if let Some(correlation_id) = self.correlation_id() {
            envelope.insert(
                CORRELATION_ID.into(),
                Value::String(correlation_id.as_str().into()),
            );
        }

        let payload = match self {
            RelayMessage::Ready => Value::Object(Map::new()),
            RelayMessage::Request { request, .. } => to_payload(request),
            RelayMessage::Response { response, .. } => to_payload(response),
            RelayMessage::Error { error, .. } => to_payload(error),
            RelayMessage::SchemaPush { schema } => to_payload(&SchemaPayload {
                schema: schema.clone(),
            }),
        };
        envelope.insert(PAYLOAD.into(), payload);

        Value::Object(envelope)
    }

    /// Encodes this message as a JSON string.
    pub fn encode_string(&self) -> String {
        self.encode().to_string()
    }
}

fn payload_of<T: DeserializeOwned>(name: MessageName, payload: Value) -> Result<T, ValidationError> {
    serde_json::from_value(payload).map_err(|error| ValidationError::InvalidPayload {
        name,
        reason: error.to_string(),
    })
}

// Payloads are string-keyed plain data, which always serializes.
fn to_payload<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use testresult::TestResult;

    #[test]
    fn it_decodes_a_request() -> TestResult {
        let message = RelayMessage::decode(json!({
            "name": "ExplorerRequest",
            "correlationId": "op-1",
            "payload": {
                "method": "POST",
                "url": "https://api.example.com/graphql",
                "headers": { "content-type": "application/json" },
                "body": "{\"query\":\"{ me { id } }\"}"
            }
        }))?;

        assert_eq!(
            message,
            RelayMessage::Request {
                correlation_id: "op-1".into(),
                request: ProxyRequest::new("POST", "https://api.example.com/graphql")
                    .with_header("content-type", "application/json")
                    .with_body("{\"query\":\"{ me { id } }\"}"),
            }
        );
        Ok(())
    }

    #[test]
    fn it_rejects_messages_without_a_name() {
        let result = RelayMessage::decode(json!({ "correlationId": "1", "payload": {} }));
        assert_eq!(result, Err(ValidationError::MissingName));

        let result = RelayMessage::decode(json!({ "name": 7 }));
        assert_eq!(result, Err(ValidationError::MissingName));
    }

    #[test]
    fn it_rejects_unknown_names() {
        let result = RelayMessage::decode(json!({ "name": "webpackHotUpdate" }));
        assert_eq!(
            result,
            Err(ValidationError::UnknownName("webpackHotUpdate".into()))
        );
    }

    #[test]
    fn it_rejects_non_objects() {
        assert_eq!(
            RelayMessage::decode(json!("ExplorerRequest")),
            Err(ValidationError::NotAnObject)
        );
        assert!(matches!(
            RelayMessage::decode_str("{not json"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn it_requires_correlation_ids_on_correlated_kinds() {
        for name in [
            MessageName::Request,
            MessageName::Response,
            MessageName::Error,
        ] {
            let result = RelayMessage::decode(json!({ "name": name.as_str(), "payload": {} }));
            assert_eq!(result, Err(ValidationError::MissingCorrelationId(name)));
        }
    }

    #[test]
    fn it_rejects_payloads_of_the_wrong_shape() {
        let result = RelayMessage::decode(json!({
            "name": "ExplorerResponse",
            "correlationId": "1",
            "payload": { "status": "ok" }
        }));

        assert!(matches!(
            result,
            Err(ValidationError::InvalidPayload {
                name: MessageName::Response,
                ..
            })
        ));
    }

    #[test]
    fn it_ignores_unknown_fields() -> TestResult {
        let message = RelayMessage::decode(json!({
            "name": "ExplorerResponse",
            "correlationId": "2",
            "source": "sandbox",
            "payload": { "status": 200, "headers": {}, "elapsedMs": 31 }
        }))?;

        assert_eq!(
            message,
            RelayMessage::Response {
                correlation_id: "2".into(),
                response: ProxyResponse::new(200),
            }
        );
        Ok(())
    }

    #[test]
    fn it_accepts_readiness_without_payload() -> TestResult {
        let message = RelayMessage::decode(json!({ "name": "ExplorerListeningForSchema" }))?;
        assert_eq!(message, RelayMessage::Ready);
        Ok(())
    }

    #[test]
    fn it_distinguishes_sdl_from_introspection() -> TestResult {
        let sdl = RelayMessage::decode(json!({
            "name": "SchemaResponse",
            "payload": { "schema": "type Query { me: User }" }
        }))?;
        assert_eq!(
            sdl,
            RelayMessage::SchemaPush {
                schema: Schema::Sdl("type Query { me: User }".into())
            }
        );

        let introspection = RelayMessage::decode(json!({
            "name": "SchemaResponse",
            "payload": { "schema": { "__schema": { "queryType": { "name": "Query" } } } }
        }))?;
        assert!(matches!(
            introspection,
            RelayMessage::SchemaPush {
                schema: Schema::Introspection(_)
            }
        ));
        Ok(())
    }

    #[test]
    fn it_leaves_correlation_ids_off_uncorrelated_kinds() {
        let encoded = RelayMessage::SchemaPush {
            schema: Schema::Sdl("type Query { ok: Boolean }".into()),
        }
        .encode();

        assert!(encoded.get(CORRELATION_ID).is_none());
        assert_eq!(encoded[NAME], json!("SchemaResponse"));
    }

    #[test]
    fn it_reproduces_every_kind_after_a_round_trip() -> TestResult {
        let raw = [
            json!({ "name": "ExplorerListeningForSchema", "payload": {} }),
            json!({
                "name": "ExplorerRequest",
                "correlationId": "a",
                "payload": {
                    "method": "POST",
                    "url": "https://api.example.com/graphql",
                    "headers": { "authorization": "Bearer t", "x-trace": "1" },
                    "body": "{\"variables\":{\"id\":\"1\"}}"
                }
            }),
            json!({
                "name": "ExplorerResponse",
                "correlationId": "a",
                "payload": {
                    "status": 503,
                    "headers": { "retry-after": "10" },
                    "body": "unavailable"
                }
            }),
            json!({
                "name": "ExplorerError",
                "correlationId": "b",
                "payload": { "message": "Connection failed: refused", "status": 502 }
            }),
            json!({
                "name": "SchemaResponse",
                "payload": {
                    "schema": {
                        "__schema": {
                            "types": [{ "kind": "OBJECT", "name": "Query", "fields": [] }]
                        }
                    }
                }
            }),
        ];

        for envelope in raw {
            let decoded = RelayMessage::decode(envelope.clone())?;
            assert_eq!(decoded.encode(), envelope);
            assert_eq!(RelayMessage::decode_str(&decoded.encode_string())?, decoded);
        }
        Ok(())
    }
}
