use std::sync::Arc;

use sandbox_common::{ConditionalSend, ConditionalSync};
use sandbox_relay::{FramePort, Listener, RelayChannel};

use crate::{ConfigurationError, FrameSpec, MountTarget};

/// The page an embed lives in.
///
/// In the browser this is the document and window (`WebPage` on wasm32).
/// Tests use the in-memory `MemoryPage` from the `helpers` feature.
///
/// Instance numbers come from the page rather than from a registry, so every
/// registry mounting into the same page draws from one sequence and iframe
/// ids never repeat on that page.
pub trait HostPage: ConditionalSend + ConditionalSync {
    /// Hand out the next instance number for this page. Numbers start at
    /// zero and are never reused.
    fn allocate_instance(&self) -> u64;

    /// Create the iframe described by `frame` under `target` and return a
    /// port that posts into it.
    fn mount(
        &self,
        target: &MountTarget,
        frame: &FrameSpec,
    ) -> Result<Arc<dyn FramePort>, ConfigurationError>;

    /// Route the page's inbound messages to `channel`, tagging each with the
    /// frame that sent it so the channel can tell its own iframe apart.
    fn listen(
        &self,
        frame: &FrameSpec,
        channel: RelayChannel,
    ) -> Result<Box<dyn Listener>, ConfigurationError>;

    /// Remove the iframe created by [`HostPage::mount`] for `frame`. Does
    /// nothing if it is already gone.
    fn unmount(&self, frame: &FrameSpec);
}
