use std::future::Future;

/// Schedules `future` on the current executor and returns immediately.
///
/// The future runs to completion on its own; nothing observes its output.
/// Natively this requires a running tokio runtime.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    drop(tokio::spawn(future));
}

/// Schedules `future` on the current executor and returns immediately.
///
/// The future runs to completion on its own; nothing observes its output.
/// In the browser this queues the future on the page's microtask loop.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}
