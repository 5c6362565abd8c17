//! An in-memory page for exercising embeds without a browser.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use sandbox_common::SharedCell;
use sandbox_relay::{
    FrameId, FramePort, InboundEvent, Listener, ProtocolError, RelayChannel, RelayMessage,
};
use serde_json::Value;
use tokio::sync::Notify;
use url::Url;

use crate::{ConfigurationError, FrameSpec, HostPage, MountTarget};

#[derive(Default)]
struct PageState {
    elements: BTreeSet<String>,
    frames: BTreeMap<FrameId, MountedFrame>,
    listeners: BTreeMap<u64, RelayChannel>,
    next_listener: u64,
    next_instance: u64,
    refuse_listeners: bool,
}

/// An iframe that exists on a [`MemoryPage`].
#[derive(Clone, Debug)]
pub struct MountedFrame {
    /// Selector of the element the frame was mounted under
    pub parent: String,
    /// URL the frame was created with
    pub src: Url,
    /// Inline style of the frame
    pub style: String,
    /// Everything posted into the frame
    pub inbox: MemoryFrame,
}

/// A [`HostPage`] that keeps its elements, frames and listeners in memory.
///
/// Elements are identified by selector and must be added with
/// [`MemoryPage::with_element`] before anything can be mounted under them.
/// Messages "posted by" a frame are delivered to every registered listener,
/// the way a browser window delivers them.
#[derive(Clone, Default)]
pub struct MemoryPage {
    state: Arc<SharedCell<PageState>>,
}

impl MemoryPage {
    /// An empty page.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element matching `selector`.
    pub fn with_element(self, selector: impl Into<String>) -> Self {
        self.state.with(|state| state.elements.insert(selector.into()));
        self
    }

    /// Make every subsequent `listen` call fail.
    pub fn refuse_listeners(&self) {
        self.state.with(|state| state.refuse_listeners = true);
    }

    /// The frame with DOM id `id`, if it is mounted.
    pub fn frame(&self, id: &FrameId) -> Option<MountedFrame> {
        self.state.with(|state| state.frames.get(id).cloned())
    }

    /// Ids of all mounted frames.
    pub fn frame_ids(&self) -> Vec<FrameId> {
        self.state.with(|state| state.frames.keys().cloned().collect())
    }

    /// Number of registered message listeners.
    pub fn listener_count(&self) -> usize {
        self.state.with(|state| state.listeners.len())
    }

    /// Deliver `event` to every registered listener.
    pub fn dispatch(&self, event: InboundEvent) {
        let channels: Vec<RelayChannel> =
            self.state.with(|state| state.listeners.values().cloned().collect());

        for channel in channels {
            channel.on_message(event.clone());
        }
    }

    /// Deliver `message` as if frame `from`, served from `origin`, had posted
    /// it.
    pub fn post_from_frame(&self, from: &FrameId, origin: &str, message: &RelayMessage) {
        self.post_raw_from_frame(from, origin, message.encode());
    }

    /// Like [`MemoryPage::post_from_frame`], for data that need not be a
    /// valid message.
    pub fn post_raw_from_frame(&self, from: &FrameId, origin: &str, data: Value) {
        self.dispatch(InboundEvent {
            origin: origin.to_string(),
            source: Some(from.clone()),
            data,
        });
    }
}

impl HostPage for MemoryPage {
    fn allocate_instance(&self) -> u64 {
        self.state.with(|state| {
            let instance = state.next_instance;
            state.next_instance += 1;
            instance
        })
    }

    fn mount(
        &self,
        target: &MountTarget,
        frame: &FrameSpec,
    ) -> Result<Arc<dyn FramePort>, ConfigurationError> {
        let selector = match target {
            MountTarget::Selector(selector) => selector,
            #[cfg(all(target_arch = "wasm32", target_os = "unknown"))]
            MountTarget::Element(_) => {
                return Err(ConfigurationError::Host(
                    "an in-memory page only mounts by selector".into(),
                ));
            }
        };

        self.state.with(|state| {
            if !state.elements.contains(selector) {
                return Err(ConfigurationError::TargetNotFound(selector.clone()));
            }

            if state.frames.contains_key(&frame.id) {
                return Err(ConfigurationError::Host(format!(
                    "id {} is already in use",
                    frame.id
                )));
            }

            let inbox = MemoryFrame::default();
            state.frames.insert(
                frame.id.clone(),
                MountedFrame {
                    parent: selector.clone(),
                    src: frame.src.clone(),
                    style: frame.style.to_string(),
                    inbox: inbox.clone(),
                },
            );

            Ok(Arc::new(inbox) as Arc<dyn FramePort>)
        })
    }

    fn listen(
        &self,
        _frame: &FrameSpec,
        channel: RelayChannel,
    ) -> Result<Box<dyn Listener>, ConfigurationError> {
        self.state.with(|state| {
            if state.refuse_listeners {
                return Err(ConfigurationError::Host("listener refused".into()));
            }

            let id = state.next_listener;
            state.next_listener += 1;
            state.listeners.insert(id, channel);

            Ok(Box::new(MemoryListener {
                id,
                state: self.state.clone(),
            }) as Box<dyn Listener>)
        })
    }

    fn unmount(&self, frame: &FrameSpec) {
        if let Some(mounted) = self.state.with(|state| state.frames.remove(&frame.id)) {
            mounted.inbox.detach();
        }
    }
}

struct MemoryListener {
    id: u64,
    state: Arc<SharedCell<PageState>>,
}

impl Listener for MemoryListener {
    fn remove(&self) {
        self.state.with(|state| state.listeners.remove(&self.id));
    }
}

#[derive(Default, Debug)]
struct Inbox {
    posted: Vec<(Value, String)>,
    detached: bool,
}

/// Records what is posted into a frame.
///
/// Posting fails once the frame has been removed from its page.
#[derive(Clone, Debug, Default)]
pub struct MemoryFrame {
    inbox: Arc<SharedCell<Inbox>>,
    arrived: Arc<Notify>,
}

impl MemoryFrame {
    /// Every message posted so far, oldest first.
    pub fn messages(&self) -> Vec<Value> {
        self.inbox.with(|inbox| {
            inbox
                .posted
                .iter()
                .map(|(message, _)| message.clone())
                .collect()
        })
    }

    /// The target origin of every post so far.
    pub fn target_origins(&self) -> Vec<String> {
        self.inbox.with(|inbox| {
            inbox
                .posted
                .iter()
                .map(|(_, origin)| origin.clone())
                .collect()
        })
    }

    /// Waits until at least `count` messages have been posted and returns
    /// them.
    pub async fn wait_for(&self, count: usize) -> Vec<Value> {
        loop {
            let messages = self.messages();
            if messages.len() >= count {
                return messages;
            }
            self.arrived.notified().await;
        }
    }

    fn detach(&self) {
        self.inbox.with(|inbox| inbox.detached = true);
    }
}

impl FramePort for MemoryFrame {
    fn post(&self, message: Value, target_origin: &str) -> Result<(), ProtocolError> {
        self.inbox.with(|inbox| {
            if inbox.detached {
                return Err(ProtocolError::Undeliverable("frame was removed".into()));
            }
            inbox.posted.push((message, target_origin.to_string()));
            Ok(())
        })?;

        self.arrived.notify_one();
        Ok(())
    }
}
