#![warn(missing_docs)]

//! The message relay between a host page and an embedded GraphQL sandbox.
//!
//! The sandbox UI is served from its own origin and loaded in an iframe. It
//! cannot send the host application's cookies, and it cannot see the schema
//! the host already holds. This crate bridges both gaps over cross-frame
//! messages:
//!
//! - the sandbox posts [`RelayMessage::Request`]s, which the host performs
//!   with a [`HandleRequest`] implementation and answers with a correlated
//!   [`RelayMessage::Response`] or [`RelayMessage::Error`];
//! - the host pushes [`RelayMessage::SchemaPush`] updates whenever it likes.
//!
//! [`RelayChannel`] owns one iframe's side of that conversation. How messages
//! physically reach the page and the frame is left to [`Listener`] and
//! [`FramePort`] implementations supplied by the embedding layer.

mod channel;
pub use channel::*;

mod error;
pub use error::*;

mod message;
pub use message::*;

mod proxy;
pub use proxy::*;
