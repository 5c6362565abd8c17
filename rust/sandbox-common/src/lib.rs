#![warn(missing_docs)]

//! Small helpers shared by the embedded sandbox crates. They paper over the
//! differences between a browser page (`wasm32-unknown-unknown`, one thread,
//! `spawn_local`) and native targets (tokio, `Send` futures), so that the
//! relay can be written once and tested natively.

mod sync;
pub use sync::*;

mod task;
pub use task::*;
