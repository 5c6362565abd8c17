//! Browser bindings.
//!
//! [`WebPage`] implements [`HostPage`] on top of the document and window,
//! and the exported `EmbeddedSandbox` and `SandboxRegistry` classes make
//! the crate usable from JavaScript:
//!
//! ```ignore
//! // This is JavaScript code that uses the WASM bindings, not a Rust doctest
//! import { EmbeddedSandbox } from "sandbox-embed";
//!
//! const sandbox = new EmbeddedSandbox({
//!   target: "#embedded-sandbox",
//!   initialEndpoint: "https://api.example.com/graphql",
//!   initialState: { document: "query { me { id } }" },
//!   includeCookies: true,
//! });
//!
//! sandbox.updateSchema("type Query { me: User }");
//! sandbox.dispose();
//! ```
//!
//! A `handleRequest(url, init)` function in the options replaces the
//! built-in proxy. It may resolve to a fetch `Response` or to a plain
//! `{ status, headers, body }` object.

use std::{
    cell::{Cell, OnceCell},
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use js_sys::{Array, Function, JSON, Object, Promise, Reflect};
use sandbox_common::SharedCell;
use sandbox_relay::{
    FrameId, FramePort, HandleRequest, HeaderMap, InboundEvent, Listener, NetworkError,
    ProtocolError, ProxyRequest, ProxyResponse, RelayChannel, Schema,
};
use serde_json::{Value, json};
use tracing::trace;
use wasm_bindgen::{JsCast, prelude::*};
use wasm_bindgen_futures::JsFuture;
use web_sys::{Document, Element, HtmlIFrameElement, MessageEvent, Window};

use crate::{
    ConfigurationError, EmbedHandle, EmbedOptions, EmbedRegistry, EmbedSettings, FrameSpec,
    HostPage, MountTarget, SandboxConfig,
};

/// Installs the panic hook when the module is instantiated.
#[wasm_bindgen(start)]
pub fn start() {
    console_error_panic_hook::set_once();
}

fn host_error(error: JsValue) -> ConfigurationError {
    ConfigurationError::Host(describe(&error))
}

fn describe(error: &JsValue) -> String {
    if let Some(error) = error.dyn_ref::<js_sys::Error>() {
        return String::from(error.message());
    }

    if let Some(message) = error.as_string() {
        return message;
    }

    JSON::stringify(error)
        .ok()
        .and_then(|json| json.as_string())
        .unwrap_or_else(|| "unknown error".into())
}

fn to_js(value: &Value) -> Result<JsValue, JsValue> {
    JSON::parse(&value.to_string())
}

fn from_js(value: &JsValue) -> Option<Value> {
    let json = JSON::stringify(value).ok()?.as_string()?;
    serde_json::from_str(&json).ok()
}

thread_local! {
    static NEXT_INSTANCE: Cell<u64> = const { Cell::new(0) };
}

/// The browser page: mounts iframes into the document and listens on the
/// window.
///
/// Instance numbers are shared by every `WebPage` in the window, so
/// registries created independently never hand out the same iframe id.
#[derive(Clone, Debug)]
pub struct WebPage {
    window: Window,
    document: Document,
    mounted: Arc<SharedCell<BTreeMap<FrameId, HtmlIFrameElement>>>,
}

impl WebPage {
    /// The page this module is running in.
    pub fn new() -> Result<Self, ConfigurationError> {
        let window = web_sys::window()
            .ok_or_else(|| ConfigurationError::Host("no window available".into()))?;
        let document = window
            .document()
            .ok_or_else(|| ConfigurationError::Host("no document available".into()))?;

        Ok(Self {
            window,
            document,
            mounted: Arc::default(),
        })
    }

    fn resolve(&self, target: &MountTarget) -> Result<Element, ConfigurationError> {
        match target {
            MountTarget::Selector(selector) => self
                .document
                .query_selector(selector)
                .map_err(host_error)?
                .ok_or_else(|| ConfigurationError::TargetNotFound(selector.clone())),
            MountTarget::Element(element) => Ok(element.clone()),
        }
    }

    fn mounted(&self, id: &FrameId) -> Option<HtmlIFrameElement> {
        self.mounted.with(|mounted| mounted.get(id).cloned())
    }
}

impl HostPage for WebPage {
    fn allocate_instance(&self) -> u64 {
        NEXT_INSTANCE.with(|next| {
            let instance = next.get();
            next.set(instance + 1);
            instance
        })
    }

    fn mount(
        &self,
        target: &MountTarget,
        frame: &FrameSpec,
    ) -> Result<Arc<dyn FramePort>, ConfigurationError> {
        let parent = self.resolve(target)?;

        if self.mounted(&frame.id).is_some()
            || self.document.get_element_by_id(frame.id.as_str()).is_some()
        {
            return Err(ConfigurationError::Host(format!(
                "id {} is already in use",
                frame.id
            )));
        }

        let iframe = self
            .document
            .create_element("iframe")
            .map_err(host_error)?
            .dyn_into::<HtmlIFrameElement>()
            .map_err(|_| ConfigurationError::Host("could not create an iframe".into()))?;

        iframe.set_src(frame.src.as_str());
        iframe.set_id(frame.id.as_str());
        iframe
            .set_attribute("style", frame.style)
            .map_err(host_error)?;
        parent.append_child(&iframe).map_err(host_error)?;

        self.mounted
            .with(|mounted| mounted.insert(frame.id.clone(), iframe.clone()));

        Ok(Arc::new(IFramePort { iframe }))
    }

    fn listen(
        &self,
        frame: &FrameSpec,
        channel: RelayChannel,
    ) -> Result<Box<dyn Listener>, ConfigurationError> {
        let iframe = self
            .mounted(&frame.id)
            .ok_or_else(|| ConfigurationError::Host(format!("frame {} is not mounted", frame.id)))?;
        let frame_id = frame.id.clone();

        let callback = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            let source = match (event.source(), iframe.content_window()) {
                (Some(source), Some(window)) if Object::is(&source, &window) => {
                    Some(frame_id.clone())
                }
                _ => None,
            };

            let Some(data) = from_js(&event.data()) else {
                trace!(frame = %frame_id, "Ignoring message that is not JSON");
                return;
            };

            channel.on_message(InboundEvent {
                origin: event.origin(),
                source,
                data,
            });
        });

        self.window
            .add_event_listener_with_callback("message", callback.as_ref().unchecked_ref())
            .map_err(host_error)?;

        Ok(Box::new(WindowListener {
            window: self.window.clone(),
            callback,
        }))
    }

    fn unmount(&self, frame: &FrameSpec) {
        if let Some(iframe) = self.mounted.with(|mounted| mounted.remove(&frame.id)) {
            iframe.remove();
        }
    }
}

struct WindowListener {
    window: Window,
    callback: Closure<dyn FnMut(MessageEvent)>,
}

impl Listener for WindowListener {
    fn remove(&self) {
        let _ = self
            .window
            .remove_event_listener_with_callback("message", self.callback.as_ref().unchecked_ref());
    }
}

struct IFramePort {
    iframe: HtmlIFrameElement,
}

impl FramePort for IFramePort {
    fn post(&self, message: Value, target_origin: &str) -> Result<(), ProtocolError> {
        let window = self
            .iframe
            .content_window()
            .ok_or_else(|| ProtocolError::Undeliverable("frame has no window".into()))?;
        let message =
            to_js(&message).map_err(|error| ProtocolError::Undeliverable(describe(&error)))?;

        window
            .post_message(&message, target_origin)
            .map_err(|error| ProtocolError::Undeliverable(describe(&error)))
    }
}

/// Performs proxied requests with a JavaScript `handleRequest(url, init)`
/// function.
pub struct JsRequestHandler {
    function: Function,
}

impl JsRequestHandler {
    /// Wraps `function`.
    pub fn new(function: Function) -> Self {
        Self { function }
    }
}

/// The `status` a rejection carries, if it is a plausible HTTP status.
fn error_status(error: &JsValue) -> Option<u16> {
    let status = Reflect::get(error, &"status".into()).ok()?.as_f64()?;
    if status.fract() == 0.0 && (100.0..=599.0).contains(&status) {
        Some(status as u16)
    } else {
        None
    }
}

fn rejected(error: JsValue) -> NetworkError {
    NetworkError::Rejected {
        message: describe(&error),
        status: error_status(&error),
    }
}

async fn read_fetch_response(response: &web_sys::Response) -> Result<ProxyResponse, NetworkError> {
    let mut headers = HeaderMap::new();
    if let Ok(Some(entries)) = js_sys::try_iter(&response.headers()) {
        for entry in entries.flatten() {
            let entry = Array::from(&entry);
            if let (Some(name), Some(value)) = (entry.get(0).as_string(), entry.get(1).as_string())
            {
                headers.insert(name, value);
            }
        }
    }

    let text = response.text().map_err(rejected)?;
    let body = JsFuture::from(text)
        .await
        .map_err(|error| NetworkError::Body(describe(&error)))?
        .as_string();

    Ok(ProxyResponse {
        status: response.status(),
        headers,
        body,
    })
}

#[async_trait(?Send)]
impl HandleRequest for JsRequestHandler {
    async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse, NetworkError> {
        let mut init = json!({
            "method": request.method,
            "headers": request.headers,
        });
        if let Some(body) = request.body {
            init["body"] = Value::String(body);
        }
        let init = to_js(&init).map_err(|error| NetworkError::InvalidRequest(describe(&error)))?;

        let returned = self
            .function
            .call2(&JsValue::UNDEFINED, &JsValue::from_str(&request.url), &init)
            .map_err(rejected)?;
        let settled = JsFuture::from(Promise::resolve(&returned))
            .await
            .map_err(rejected)?;

        if let Some(response) = settled.dyn_ref::<web_sys::Response>() {
            return read_fetch_response(response).await;
        }

        let value = from_js(&settled).ok_or_else(|| NetworkError::Rejected {
            message: "handleRequest resolved to something that is not a response".into(),
            status: None,
        })?;

        serde_json::from_value(value).map_err(|error| NetworkError::Rejected {
            message: format!("handleRequest resolved to an invalid response: {error}"),
            status: None,
        })
    }
}

fn read_options(options: &JsValue) -> Result<EmbedOptions, JsError> {
    let target = Reflect::get(options, &"target".into()).unwrap_or(JsValue::UNDEFINED);
    let target = match target.as_string() {
        Some(selector) => Some(MountTarget::Selector(selector)),
        None => target.dyn_into::<Element>().ok().map(MountTarget::Element),
    };

    let settings = match from_js(options) {
        Some(value) => serde_json::from_value::<EmbedSettings>(value)?,
        None => EmbedSettings::default(),
    };

    let request_handler = Reflect::get(options, &"handleRequest".into())
        .ok()
        .and_then(|handler| handler.dyn_into::<Function>().ok())
        .map(|function| Arc::new(JsRequestHandler::new(function)) as Arc<dyn HandleRequest>);

    Ok(EmbedOptions {
        target,
        settings,
        request_handler,
    })
}

fn read_schema(schema: JsValue) -> Result<Schema, JsError> {
    if let Some(sdl) = schema.as_string() {
        return Ok(Schema::Sdl(sdl));
    }

    match from_js(&schema) {
        Some(Value::Object(introspection)) => Ok(Schema::Introspection(introspection)),
        _ => Err(JsError::new(
            "schema must be SDL text or an introspection result",
        )),
    }
}

thread_local! {
    static PAGE_REGISTRY: OnceCell<EmbedRegistry> = const { OnceCell::new() };
}

fn create_on_page(options: EmbedOptions) -> Result<EmbedHandle, ConfigurationError> {
    PAGE_REGISTRY.with(|cell| {
        if cell.get().is_none() {
            let _ = cell.set(EmbedRegistry::new(Arc::new(WebPage::new()?)));
        }

        match cell.get() {
            Some(registry) => registry.create(options),
            None => Err(ConfigurationError::Host("page registry unavailable".into())),
        }
    })
}

/// A set of sandboxes sharing one sandbox location.
#[wasm_bindgen(js_name = "SandboxRegistry")]
pub struct SandboxRegistryBinding {
    registry: EmbedRegistry,
}

#[wasm_bindgen(js_class = "SandboxRegistry")]
impl SandboxRegistryBinding {
    /// A registry for the current page. `sandboxUrl` overrides where the
    /// sandbox UI is loaded from.
    #[wasm_bindgen(constructor)]
    pub fn new(sandbox_url: Option<String>) -> Result<SandboxRegistryBinding, JsError> {
        let mut registry = EmbedRegistry::new(Arc::new(WebPage::new()?));
        if let Some(url) = sandbox_url {
            let sandbox = SandboxConfig::new(url);
            sandbox.resolve()?;
            registry = registry.with_sandbox(sandbox);
        }

        Ok(Self { registry })
    }

    /// Embed a sandbox with the given options.
    #[wasm_bindgen]
    pub fn embed(&self, options: JsValue) -> Result<EmbeddedSandboxBinding, JsError> {
        let handle = self.registry.create(read_options(&options)?)?;
        Ok(EmbeddedSandboxBinding { handle })
    }
}

/// An embedded sandbox iframe and its relay.
#[wasm_bindgen(js_name = "EmbeddedSandbox")]
pub struct EmbeddedSandboxBinding {
    handle: EmbedHandle,
}

#[wasm_bindgen(js_class = "EmbeddedSandbox")]
impl EmbeddedSandboxBinding {
    /// Embed a sandbox on the current page.
    #[wasm_bindgen(constructor)]
    pub fn new(options: JsValue) -> Result<EmbeddedSandboxBinding, JsError> {
        let handle = create_on_page(read_options(&options)?)?;
        Ok(Self { handle })
    }

    /// The instance number, unique on the page.
    #[wasm_bindgen(getter)]
    pub fn id(&self) -> f64 {
        self.handle.id() as f64
    }

    /// DOM id of the iframe.
    #[wasm_bindgen(getter, js_name = "frameId")]
    pub fn frame_id(&self) -> String {
        self.handle.frame_id().to_string()
    }

    /// Send a schema (SDL text or an introspection result) to the sandbox.
    #[wasm_bindgen(js_name = "updateSchema")]
    pub fn update_schema(&self, schema: JsValue) -> Result<(), JsError> {
        self.handle.update_schema(read_schema(schema)?)?;
        Ok(())
    }

    /// Remove the iframe and stop relaying.
    #[wasm_bindgen]
    pub fn dispose(&self) {
        self.handle.dispose();
    }
}
