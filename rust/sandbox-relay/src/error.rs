use thiserror::Error;

use crate::message::MessageName;

/// Why an inbound message was not accepted.
///
/// These are expected noise on a page that talks to several frames, so the
/// channel logs and drops them instead of surfacing them to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The raw message is not valid JSON
    #[error("Message is not valid JSON: {0}")]
    Malformed(String),

    /// The message is not a JSON object
    #[error("Message is not an object")]
    NotAnObject,

    /// The envelope has no `name`, or it is not a string
    #[error("Message has no name")]
    MissingName,

    /// The envelope names a kind this relay does not know
    #[error("Unrecognized message name: {0}")]
    UnknownName(String),

    /// A correlated kind arrived without a `correlationId`
    #[error("{0} message has no correlationId")]
    MissingCorrelationId(MessageName),

    /// The payload does not have the shape required by its kind
    #[error("Invalid {name} payload: {reason}")]
    InvalidPayload {
        /// The kind whose payload was malformed
        name: MessageName,
        /// What the decoder objected to
        reason: String,
    },

    /// The message was posted from an origin other than the sandbox's
    #[error("Message from {actual} ignored, expected {expected}")]
    ForeignOrigin {
        /// The sandbox origin the channel is bound to
        expected: String,
        /// The origin the message claims
        actual: String,
    },

    /// The message did not come from this instance's iframe
    #[error("Message was not sent by frame {0}")]
    ForeignSource(String),
}

/// A proxied request that could not be completed.
///
/// HTTP error statuses are not network errors; they travel back to the
/// sandbox as ordinary responses.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The request could not be built (bad method, header or URL)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The remote host could not be reached
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The request did not complete in time
    #[error("Request timed out")]
    Timeout,

    /// The response body could not be read
    #[error("Failed to read response body: {0}")]
    Body(String),

    /// Any other transport failure
    #[error("Request failed: {0}")]
    Request(String),

    /// A custom request handler refused or failed the request
    #[error("{message}")]
    Rejected {
        /// Message reported to the sandbox
        message: String,
        /// Optional status the handler associated with the failure
        status: Option<u16>,
    },
}

impl NetworkError {
    /// The HTTP status to report alongside the error, if one is known.
    pub fn status(&self) -> Option<u16> {
        match self {
            NetworkError::Rejected { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return NetworkError::Timeout;
        }

        if error.is_builder() {
            return NetworkError::InvalidRequest(error.to_string());
        }

        #[cfg(not(target_arch = "wasm32"))]
        if error.is_connect() {
            return NetworkError::Connect(error.to_string());
        }

        if error.is_body() || error.is_decode() {
            return NetworkError::Body(error.to_string());
        }

        NetworkError::Request(error.to_string())
    }
}

/// Misuse of a channel's lifecycle, or a post the page refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The channel has been disposed and no longer reaches its iframe
    #[error("Relay channel is disposed")]
    Disposed,

    /// A listener was attached to a channel that already has one
    #[error("Relay channel is already listening")]
    AlreadyAttached,

    /// The page could not deliver the message to the iframe
    #[error("Could not post message to the sandbox: {0}")]
    Undeliverable(String),
}
