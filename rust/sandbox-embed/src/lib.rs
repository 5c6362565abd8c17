#![warn(missing_docs)]

//! Embeds a GraphQL sandbox in a host page.
//!
//! An [`EmbedRegistry`] mounts sandbox iframes into a [`HostPage`], each one
//! served by its own relay channel that proxies the sandbox's network
//! requests through the host and carries schema updates back to it:
//!
//! ```
//! # #[cfg(feature = "helpers")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use sandbox_embed::{EmbedOptions, EmbedRegistry, Schema, helpers::MemoryPage};
//!
//! let page = MemoryPage::new().with_element("#sandbox");
//! let registry = EmbedRegistry::new(Arc::new(page));
//!
//! let sandbox = registry.create(
//!     EmbedOptions::new("#sandbox").with_endpoint("https://api.example.com/graphql"),
//! )?;
//! sandbox.update_schema(Schema::Sdl("type Query { hello: String }".into()))?;
//! sandbox.dispose();
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "helpers"))]
//! # fn main() {}
//! ```
//!
//! In the browser, `web::WebPage` is the host page and the crate exports
//! an `EmbeddedSandbox` class to JavaScript.

mod embed;
pub use embed::*;

mod error;
pub use error::*;

mod frame;
pub use frame::*;

mod host;
pub use host::*;

mod options;
pub use options::*;

pub use sandbox_relay::{
    HandleRequest, HandlerFn, NetworkError, ProtocolError, ProxyRequest, ProxyResponse, Schema,
};

#[cfg(any(test, feature = "helpers"))]
pub mod helpers;

#[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
pub mod web;
