//! Creating and tearing down embedded sandboxes.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use sandbox_relay::{
    ChannelScope, FetchProxy, FetchProxyConfig, FrameId, HandleRequest, ProtocolError,
    RelayChannel, RelayMessage, Schema,
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    ConfigurationError, EmbedOptions, EmbedSettings, FrameSpec, HostPage, SandboxConfig,
    frame_src,
};

/// Creates embedded sandboxes on one page.
///
/// Instance numbers are drawn from the page, so several registries may share
/// a page without their iframes colliding.
pub struct EmbedRegistry {
    page: Arc<dyn HostPage>,
    sandbox: SandboxConfig,
}

impl EmbedRegistry {
    /// A registry mounting into `page`, loading the default sandbox.
    pub fn new(page: Arc<dyn HostPage>) -> Self {
        Self {
            page,
            sandbox: SandboxConfig::default(),
        }
    }

    /// Load the sandbox from somewhere else.
    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Where this registry's sandboxes are loaded from.
    pub fn sandbox(&self) -> &SandboxConfig {
        &self.sandbox
    }

    /// Mounts a new sandbox iframe and starts relaying for it.
    pub fn create(&self, options: EmbedOptions) -> Result<EmbedHandle, ConfigurationError> {
        let target = options.mount_target()?;
        let (sandbox, origin) = self.sandbox.resolve()?;
        let src = frame_src(&sandbox, &options.settings)?;

        let instance = self.page.allocate_instance();
        let frame = FrameSpec::new(instance, src);

        let port = self.page.mount(target, &frame)?;
        let proxy = resolve_proxy(options.request_handler.clone(), &options.settings);
        let channel = RelayChannel::new(ChannelScope::new(frame.id.clone(), &origin), port, proxy);

        let listener = match self.page.listen(&frame, channel.clone()) {
            Ok(listener) => listener,
            Err(error) => {
                self.page.unmount(&frame);
                return Err(error);
            }
        };

        if let Err(error) = channel.attach(listener) {
            self.page.unmount(&frame);
            return Err(ConfigurationError::Host(error.to_string()));
        }

        debug!(instance, %origin, src = %frame.src, "Embedded sandbox created");

        Ok(EmbedHandle {
            page: self.page.clone(),
            frame,
            channel,
            disposed: AtomicBool::new(false),
        })
    }
}

/// A custom handler takes precedence over the cookie setting.
fn resolve_proxy(
    handler: Option<Arc<dyn HandleRequest>>,
    settings: &EmbedSettings,
) -> Arc<dyn HandleRequest> {
    match handler {
        Some(handler) => {
            if settings.include_cookies {
                warn!("includeCookies has no effect when a request handler is supplied");
            }
            handler
        }
        None => Arc::new(FetchProxy::new(
            FetchProxyConfig::default().with_cookies(settings.include_cookies),
        )),
    }
}

/// One embedded sandbox.
///
/// The iframe stays on the page until [`EmbedHandle::dispose`] is called;
/// dropping the handle does not remove it.
pub struct EmbedHandle {
    page: Arc<dyn HostPage>,
    frame: FrameSpec,
    channel: RelayChannel,
    disposed: AtomicBool,
}

impl std::fmt::Debug for EmbedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedHandle")
            .field("frame", &self.frame)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl EmbedHandle {
    /// The instance number.
    pub fn id(&self) -> u64 {
        self.frame.instance
    }

    /// DOM id of the iframe.
    pub fn frame_id(&self) -> &FrameId {
        &self.frame.id
    }

    /// URL the iframe was created with.
    pub fn src(&self) -> &Url {
        &self.frame.src
    }

    /// The sandbox origin this instance trusts and posts to.
    pub fn origin(&self) -> &str {
        self.channel.scope().origin()
    }

    /// Whether [`EmbedHandle::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The relay channel serving this instance.
    pub fn channel(&self) -> &RelayChannel {
        &self.channel
    }

    /// Hands `schema` to the sandbox. If the sandbox has not finished
    /// loading, it receives the schema as soon as it has.
    pub fn update_schema(&self, schema: Schema) -> Result<(), ProtocolError> {
        self.channel.push(RelayMessage::SchemaPush { schema })
    }

    /// Removes the iframe and stops relaying. Calling this again has no
    /// effect.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.page.unmount(&self.frame);
        self.channel.dispose();

        debug!(instance = self.frame.instance, "Embedded sandbox disposed");
    }
}
