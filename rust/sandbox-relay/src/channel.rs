//! The relay channel owned by one embedded sandbox.
//!
//! A [`RelayChannel`] sits between the page's inbound message stream and one
//! iframe. It moves through three states:
//!
//! ```text
//! Uninitialized ──attach──▸ Listening ──dispose──▸ Disposed
//! ```
//!
//! While listening it accepts only messages whose origin is the sandbox
//! origin and whose source is its own iframe, answers every `Request` with
//! exactly one `Response` or `Error`, and delivers pushes once the sandbox has
//! announced it is ready. Pushes issued before that are held back and flushed
//! in order when the readiness signal arrives.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use sandbox_common::{ConditionalSend, ConditionalSync, SharedCell, spawn_detached};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::{
    CorrelationId, ErrorPayload, HandleRequest, NetworkError, ProtocolError, ProxyRequest,
    ProxyResponse, RelayMessage, ValidationError,
};

/// The DOM identity of an embedded iframe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(String);

impl FrameId {
    /// Wraps a DOM element id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The DOM element id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cross-frame message as the page received it.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// The origin the browser attributes to the sender
    pub origin: String,
    /// The iframe that sent the message, when the page could identify it
    pub source: Option<FrameId>,
    /// The posted data
    pub data: Value,
}

/// Which messages a channel accepts, and where its own posts go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelScope {
    frame: FrameId,
    origin: String,
}

impl ChannelScope {
    /// Scope a channel to `frame`, served from `origin`.
    pub fn new(frame: FrameId, origin: impl Into<String>) -> Self {
        Self {
            frame,
            origin: origin.into(),
        }
    }

    /// The iframe this channel talks to.
    pub fn frame(&self) -> &FrameId {
        &self.frame
    }

    /// The sandbox origin; also the target origin of every outbound post.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Checks that `event` came from this scope's iframe and origin.
    pub fn admit(&self, event: &InboundEvent) -> Result<(), ValidationError> {
        if event.origin != self.origin {
            return Err(ValidationError::ForeignOrigin {
                expected: self.origin.clone(),
                actual: event.origin.clone(),
            });
        }

        match &event.source {
            Some(source) if *source == self.frame => Ok(()),
            _ => Err(ValidationError::ForeignSource(self.frame.to_string())),
        }
    }
}

/// Delivers encoded messages into an iframe.
pub trait FramePort: ConditionalSend + ConditionalSync {
    /// Post `message` to the frame, restricted to `target_origin`.
    fn post(&self, message: Value, target_origin: &str) -> Result<(), ProtocolError>;
}

/// A registered inbound-message listener.
pub trait Listener: ConditionalSend + ConditionalSync {
    /// Stop routing inbound messages to the channel.
    fn remove(&self);
}

/// Callback for accepted messages other than requests.
pub trait MessageHandler: Fn(&RelayMessage) + ConditionalSend + ConditionalSync {}

impl<F> MessageHandler for F where F: Fn(&RelayMessage) + ConditionalSend + ConditionalSync {}

/// Lifecycle of a [`RelayChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Constructed, no listener attached yet
    Uninitialized,
    /// Receiving and answering messages
    Listening,
    /// Torn down; terminal
    Disposed,
}

#[derive(Debug)]
struct PendingRequest {
    method: String,
    url: String,
}

struct Session {
    state: ChannelState,
    listener: Option<Box<dyn Listener>>,
    ready: bool,
    flushing: bool,
    queued: VecDeque<RelayMessage>,
    in_flight: HashMap<CorrelationId, PendingRequest>,
    handlers: Vec<Arc<dyn MessageHandler>>,
}

struct Inner {
    scope: ChannelScope,
    port: Arc<dyn FramePort>,
    proxy: Arc<dyn HandleRequest>,
    session: SharedCell<Session>,
}

/// One embed instance's end of the relay.
///
/// Cloning is cheap and every clone drives the same channel, which is how the
/// page's listener and detached request tasks hold on to it.
#[derive(Clone)]
pub struct RelayChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayChannel")
            .field("scope", &self.inner.scope)
            .field("state", &self.state())
            .finish()
    }
}

impl RelayChannel {
    /// A channel for the iframe described by `scope` that posts through
    /// `port` and answers requests with `proxy`. It starts out
    /// [`ChannelState::Uninitialized`].
    pub fn new(
        scope: ChannelScope,
        port: Arc<dyn FramePort>,
        proxy: Arc<dyn HandleRequest>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                scope,
                port,
                proxy,
                session: SharedCell::new(Session {
                    state: ChannelState::Uninitialized,
                    listener: None,
                    ready: false,
                    flushing: false,
                    queued: VecDeque::new(),
                    in_flight: HashMap::new(),
                    handlers: Vec::new(),
                }),
            }),
        }
    }

    /// The scope this channel was created for.
    pub fn scope(&self) -> &ChannelScope {
        &self.inner.scope
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.inner.session.with(|session| session.state)
    }

    /// Whether the sandbox has announced it is listening.
    pub fn is_ready(&self) -> bool {
        self.inner.session.with(|session| session.ready)
    }

    /// Number of requests handed to the proxy and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.inner.session.with(|session| session.in_flight.len())
    }

    /// Takes ownership of the page listener feeding this channel and starts
    /// listening.
    pub fn attach(&self, listener: Box<dyn Listener>) -> Result<(), ProtocolError> {
        let refused = self.inner.session.with(|session| match session.state {
            ChannelState::Uninitialized => {
                session.listener = Some(listener);
                session.state = ChannelState::Listening;
                Ok(())
            }
            ChannelState::Listening => Err((listener, ProtocolError::AlreadyAttached)),
            ChannelState::Disposed => Err((listener, ProtocolError::Disposed)),
        });

        match refused {
            Ok(()) => {
                debug!(frame = %self.inner.scope.frame, "Relay channel listening");
                Ok(())
            }
            Err((listener, error)) => {
                listener.remove();
                Err(error)
            }
        }
    }

    /// Calls `handler` for every accepted message that is not a request,
    /// including the sandbox's readiness signal.
    pub fn register_handler(&self, handler: impl MessageHandler + 'static) {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        self.inner
            .session
            .with(|session| session.handlers.push(handler));
    }

    /// Entry point for every message the page receives.
    ///
    /// Messages from other origins or frames, malformed messages, and
    /// anything arriving while the channel is not listening are dropped
    /// without a trace outside the log.
    pub fn on_message(&self, event: InboundEvent) {
        if self.state() != ChannelState::Listening {
            trace!(frame = %self.inner.scope.frame, "Dropping message for inactive channel");
            return;
        }

        if let Err(reason) = self.accept(event) {
            trace!(frame = %self.inner.scope.frame, %reason, "Dropping inbound message");
        }
    }

    fn accept(&self, event: InboundEvent) -> Result<(), ValidationError> {
        self.inner.scope.admit(&event)?;

        match RelayMessage::decode(event.data)? {
            RelayMessage::Request {
                correlation_id,
                request,
            } => self.dispatch(correlation_id, request),
            RelayMessage::Ready => {
                self.flush();
                self.notify(&RelayMessage::Ready);
            }
            message @ (RelayMessage::Response { .. }
            | RelayMessage::Error { .. }
            | RelayMessage::SchemaPush { .. }) => self.notify(&message),
        }

        Ok(())
    }

    /// Sends `message` to the sandbox, or queues it until the sandbox is
    /// ready. Fails once the channel has been disposed.
    pub fn push(&self, message: RelayMessage) -> Result<(), ProtocolError> {
        let message = self.inner.session.with(|session| {
            if session.state == ChannelState::Disposed {
                return Err(ProtocolError::Disposed);
            }

            if session.ready {
                Ok(Some(message))
            } else {
                session.queued.push_back(message);
                Ok(None)
            }
        })?;

        match message {
            Some(message) => self.post(&message),
            None => {
                trace!(frame = %self.inner.scope.frame, "Sandbox not ready, queued push");
                Ok(())
            }
        }
    }

    /// Stops listening and releases the page listener. Requests still in
    /// flight finish, but their answers are dropped. Calling this again has
    /// no effect.
    pub fn dispose(&self) {
        let listener = self.inner.session.with(|session| {
            if session.state == ChannelState::Disposed {
                return None;
            }

            session.state = ChannelState::Disposed;
            session.queued.clear();
            session.handlers.clear();
            Some(session.listener.take())
        });

        let Some(listener) = listener else {
            return;
        };

        if let Some(listener) = listener {
            listener.remove();
        }

        debug!(frame = %self.inner.scope.frame, "Relay channel disposed");
    }

    fn dispatch(&self, correlation_id: CorrelationId, request: ProxyRequest) {
        let duplicate = self.inner.session.with(|session| {
            if session.in_flight.contains_key(&correlation_id) {
                return true;
            }

            session.in_flight.insert(
                correlation_id.clone(),
                PendingRequest {
                    method: request.method.clone(),
                    url: request.url.clone(),
                },
            );
            false
        });

        if duplicate {
            debug!(%correlation_id, "Ignoring request whose id is already in flight");
            return;
        }

        trace!(%correlation_id, method = %request.method, url = %request.url, "Proxying request");

        let channel = self.clone();
        spawn_detached(async move {
            let outcome = channel.inner.proxy.handle(request).await;
            channel.complete(correlation_id, outcome);
        });
    }

    fn complete(
        &self,
        correlation_id: CorrelationId,
        outcome: Result<ProxyResponse, NetworkError>,
    ) {
        let (pending, state) = self.inner.session.with(|session| {
            (session.in_flight.remove(&correlation_id), session.state)
        });

        if state != ChannelState::Listening {
            debug!(%correlation_id, "Channel disposed, dropping answer");
            return;
        }

        let reply = match outcome {
            Ok(response) => RelayMessage::Response {
                correlation_id,
                response,
            },
            Err(error) => {
                if let Some(PendingRequest { method, url }) = &pending {
                    debug!(%correlation_id, %method, %url, %error, "Proxied request failed");
                }
                RelayMessage::Error {
                    error: ErrorPayload::from(&error),
                    correlation_id,
                }
            }
        };

        if let Err(error) = self.post(&reply) {
            warn!(frame = %self.inner.scope.frame, %error, "Could not answer proxied request");
        }
    }

    /// Drains the queue in batches. The channel only counts as ready once
    /// the queue is observed empty, so a push racing the flush is queued
    /// behind the earlier ones rather than posted ahead of them.
    fn flush(&self) {
        let claimed = self.inner.session.with(|session| {
            if session.flushing {
                false
            } else {
                session.flushing = true;
                true
            }
        });

        if !claimed {
            return;
        }

        loop {
            let batch = self.inner.session.with(|session| {
                if session.state != ChannelState::Listening || session.queued.is_empty() {
                    session.ready = session.state == ChannelState::Listening;
                    session.flushing = false;
                    session.queued.clear();
                    return VecDeque::new();
                }
                std::mem::take(&mut session.queued)
            });

            if batch.is_empty() {
                break;
            }

            for message in batch {
                if let Err(error) = self.post(&message) {
                    warn!(frame = %self.inner.scope.frame, %error, "Could not deliver queued push");
                }
            }
        }
    }

    fn notify(&self, message: &RelayMessage) {
        let handlers = self.inner.session.with(|session| session.handlers.clone());

        for handler in handlers {
            handler(message);
        }
    }

    fn post(&self, message: &RelayMessage) -> Result<(), ProtocolError> {
        self.inner
            .port
            .post(message.encode(), self.inner.scope.origin())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HandlerFn, Schema};
    use serde_json::json;

    const ORIGIN: &str = "https://sandbox.example.com";

    #[derive(Default)]
    struct Recorder {
        posted: SharedCell<Vec<(Value, String)>>,
    }

    impl FramePort for Recorder {
        fn post(&self, message: Value, target_origin: &str) -> Result<(), ProtocolError> {
            self.posted
                .with(|posted| posted.push((message, target_origin.to_string())));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Flag(SharedCell<bool>);

    impl Listener for Arc<Flag> {
        fn remove(&self) {
            self.0.with(|removed| *removed = true);
        }
    }

    fn channel() -> (RelayChannel, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let proxy = HandlerFn::new(|_request: ProxyRequest| async {
            Ok::<_, NetworkError>(ProxyResponse::new(200))
        });
        let channel = RelayChannel::new(
            ChannelScope::new(FrameId::new("embedded-sandbox-0"), ORIGIN),
            recorder.clone(),
            Arc::new(proxy),
        );
        (channel, recorder)
    }

    fn ready_event() -> InboundEvent {
        InboundEvent {
            origin: ORIGIN.into(),
            source: Some(FrameId::new("embedded-sandbox-0")),
            data: RelayMessage::Ready.encode(),
        }
    }

    #[test]
    fn it_moves_through_its_lifecycle() -> Result<(), ProtocolError> {
        let (channel, _) = channel();
        let flag = Arc::new(Flag::default());
        assert_eq!(channel.state(), ChannelState::Uninitialized);

        channel.attach(Box::new(flag.clone()))?;
        assert_eq!(channel.state(), ChannelState::Listening);

        channel.dispose();
        assert_eq!(channel.state(), ChannelState::Disposed);
        assert!(*flag.0.lock());
        Ok(())
    }

    #[test]
    fn it_refuses_a_second_listener() -> Result<(), ProtocolError> {
        let (channel, _) = channel();
        channel.attach(Box::new(Arc::new(Flag::default())))?;

        let second = Arc::new(Flag::default());
        assert_eq!(
            channel.attach(Box::new(second.clone())),
            Err(ProtocolError::AlreadyAttached)
        );
        assert!(*second.0.lock());
        Ok(())
    }

    #[test]
    fn it_admits_only_its_own_frame_and_origin() {
        let scope = ChannelScope::new(FrameId::new("embedded-sandbox-3"), ORIGIN);
        let mut event = InboundEvent {
            origin: ORIGIN.into(),
            source: Some(FrameId::new("embedded-sandbox-3")),
            data: json!({}),
        };
        assert_eq!(scope.admit(&event), Ok(()));

        event.source = Some(FrameId::new("embedded-sandbox-4"));
        assert!(matches!(
            scope.admit(&event),
            Err(ValidationError::ForeignSource(_))
        ));

        event.source = Some(FrameId::new("embedded-sandbox-3"));
        event.origin = "https://evil.example.com".into();
        assert!(matches!(
            scope.admit(&event),
            Err(ValidationError::ForeignOrigin { .. })
        ));
    }

    #[test]
    fn it_ignores_messages_before_listening() {
        let (channel, recorder) = channel();
        channel.push(RelayMessage::SchemaPush {
            schema: Schema::Sdl("type Query { a: Int }".into()),
        })
        .ok();

        channel.on_message(ready_event());

        assert!(!channel.is_ready());
        assert!(recorder.posted.lock().is_empty());
    }

    #[test]
    fn it_flushes_queued_pushes_in_order_once_ready() -> Result<(), ProtocolError> {
        let (channel, recorder) = channel();
        channel.attach(Box::new(Arc::new(Flag::default())))?;

        for sdl in ["type Query { a: Int }", "type Query { b: Int }"] {
            channel.push(RelayMessage::SchemaPush {
                schema: Schema::Sdl(sdl.into()),
            })?;
        }
        assert!(recorder.posted.lock().is_empty());

        channel.on_message(ready_event());

        let posted = recorder.posted.lock();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].0["payload"]["schema"], json!("type Query { a: Int }"));
        assert_eq!(posted[1].0["payload"]["schema"], json!("type Query { b: Int }"));
        assert!(posted.iter().all(|(_, origin)| origin == ORIGIN));
        Ok(())
    }

    /// Pushes back into its own channel while the first queued message is
    /// being posted.
    #[derive(Default)]
    struct Interjector {
        posted: SharedCell<Vec<Value>>,
        channel: SharedCell<Option<RelayChannel>>,
    }

    impl FramePort for Interjector {
        fn post(&self, message: Value, _target_origin: &str) -> Result<(), ProtocolError> {
            let first = self.posted.with(|posted| {
                posted.push(message);
                posted.len() == 1
            });

            if first {
                if let Some(channel) = self.channel.with(|channel| channel.take()) {
                    channel.push(RelayMessage::SchemaPush {
                        schema: Schema::Sdl("type Query { late: Int }".into()),
                    })?;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn it_keeps_pushes_made_during_a_flush_behind_the_queue() -> Result<(), ProtocolError> {
        let port = Arc::new(Interjector::default());
        let proxy = HandlerFn::new(|_request: ProxyRequest| async {
            Ok::<_, NetworkError>(ProxyResponse::new(200))
        });
        let channel = RelayChannel::new(
            ChannelScope::new(FrameId::new("embedded-sandbox-0"), ORIGIN),
            port.clone(),
            Arc::new(proxy),
        );
        channel.attach(Box::new(Arc::new(Flag::default())))?;
        port.channel.with(|slot| *slot = Some(channel.clone()));

        for sdl in ["type Query { a: Int }", "type Query { b: Int }"] {
            channel.push(RelayMessage::SchemaPush {
                schema: Schema::Sdl(sdl.into()),
            })?;
        }
        channel.on_message(ready_event());

        let schemas: Vec<Value> = port
            .posted
            .lock()
            .iter()
            .map(|message| message["payload"]["schema"].clone())
            .collect();
        assert_eq!(
            schemas,
            vec![
                json!("type Query { a: Int }"),
                json!("type Query { b: Int }"),
                json!("type Query { late: Int }"),
            ]
        );
        assert!(channel.is_ready());
        Ok(())
    }

    #[test]
    fn it_rejects_pushes_after_dispose() -> Result<(), ProtocolError> {
        let (channel, recorder) = channel();
        channel.attach(Box::new(Arc::new(Flag::default())))?;
        channel.on_message(ready_event());
        channel.dispose();
        channel.dispose();

        let result = channel.push(RelayMessage::SchemaPush {
            schema: Schema::Sdl("type Query { a: Int }".into()),
        });

        assert_eq!(result, Err(ProtocolError::Disposed));
        assert!(recorder.posted.lock().is_empty());
        Ok(())
    }

    #[test]
    fn it_forwards_readiness_to_handlers() -> Result<(), ProtocolError> {
        let (channel, _) = channel();
        let seen = Arc::new(SharedCell::new(Vec::new()));
        channel.attach(Box::new(Arc::new(Flag::default())))?;

        let sink = seen.clone();
        channel.register_handler(move |message: &RelayMessage| {
            sink.with(|seen: &mut Vec<_>| seen.push(message.name()));
        });
        channel.on_message(ready_event());

        assert_eq!(*seen.lock(), vec![crate::MessageName::Ready]);
        Ok(())
    }
}
