//! Callback translation layer.
//!
//! The engine takes bare function pointers with no user-data argument, so
//! every callback lands in one of the `extern "system"` trampolines below.
//! They look up the process-wide [`CallbackRoute`] and forward a message into
//! the session's dispatcher channel. Nothing outside this module ever sees a
//! raw pointer.

use std::ffi::c_void;
use std::sync::Mutex;

use crossbeam_channel::Sender;

use super::strings::{read_native_string, StringEncoding};
use crate::progress::ProgressSample;
use crate::session::SessionEvent;

/// Messages consumed by the session dispatcher thread.
#[derive(Debug)]
pub enum EngineMessage {
    /// Raw progress callback.
    Progress(ProgressSample),
    /// The engine switched to a different phase (raw operation code).
    OperationChanged(i32),
    /// A log line pushed by the engine.
    Log { file: String, message: String },
    /// Acknowledge once every message queued before it was handled.
    Flush(Sender<()>),
    /// Stop the dispatcher.
    Shutdown,
}

/// Owned registration handed to an engine when callbacks are registered.
///
/// Engines report through this instead of calling into the session directly;
/// every report becomes a message on the dispatcher channel, so reports are
/// handled in the order they were made regardless of the calling thread.
#[derive(Debug, Clone)]
pub struct CallbackSink {
    tx: Sender<EngineMessage>,
}

impl CallbackSink {
    pub(crate) fn new(tx: Sender<EngineMessage>) -> Self {
        Self { tx }
    }

    /// Report raw render progress.
    pub fn progress(&self, sample: ProgressSample) {
        self.send(EngineMessage::Progress(sample));
    }

    /// Report a change of the engine's current operation.
    pub fn operation_changed(&self, code: i32) {
        self.send(EngineMessage::OperationChanged(code));
    }

    /// Report a log line written to `file`.
    pub fn log(&self, file: impl Into<String>, message: impl Into<String>) {
        self.send(EngineMessage::Log {
            file: file.into(),
            message: message.into(),
        });
    }

    fn send(&self, msg: EngineMessage) {
        if self.tx.send(msg).is_err() {
            log::debug!("Dropping engine callback: session dispatcher is gone");
        }
    }
}

/// Where the trampolines deliver to.
struct CallbackRoute {
    sink: CallbackSink,
    encoding: StringEncoding,
}

static CALLBACK_ROUTE: Mutex<Option<CallbackRoute>> = Mutex::new(None);

/// Point the trampolines at `sink`. Replaces any previous route.
pub(crate) fn install_route(sink: CallbackSink, encoding: StringEncoding) {
    let mut route = CALLBACK_ROUTE.lock().unwrap_or_else(|e| e.into_inner());
    if route.is_some() {
        log::warn!("Replacing an existing engine callback route");
    }
    *route = Some(CallbackRoute { sink, encoding });
}

/// Detach the trampolines. Callbacks arriving afterwards are dropped.
pub(crate) fn clear_route() {
    let mut route = CALLBACK_ROUTE.lock().unwrap_or_else(|e| e.into_inner());
    *route = None;
}

fn with_route(f: impl FnOnce(&CallbackRoute)) {
    // Never panic here: unwinding out of an extern fn aborts the process.
    if let Ok(route) = CALLBACK_ROUTE.lock() {
        if let Some(route) = route.as_ref() {
            f(route);
        }
    }
}

pub(crate) type ProgressCallback = extern "system" fn(f64, i32, i32, i32, i32);
pub(crate) type OperationCallback = extern "system" fn(i32);
pub(crate) type LogCallback = extern "system" fn(*const c_void, *const c_void);

pub(crate) extern "system" fn on_progress(
    fraction: f64,
    slice: i32,
    slice_count: i32,
    batch: i32,
    batch_count: i32,
) {
    with_route(|route| {
        route.sink.progress(ProgressSample {
            slice_fraction: fraction,
            slice_index: slice,
            slice_count,
            batch_index: batch,
            batch_count,
        })
    });
}

pub(crate) extern "system" fn on_operation_change(code: i32) {
    with_route(|route| route.sink.operation_changed(code));
}

pub(crate) extern "system" fn on_log(file: *const c_void, message: *const c_void) {
    with_route(|route| {
        // SAFETY: the engine passes nul-terminated strings of the configured
        // width that live for the duration of the callback.
        let (file, message) = unsafe {
            (
                read_native_string(file, route.encoding),
                read_native_string(message, route.encoding),
            )
        };
        route.sink.log(file, message);
    });
}

/// Fan-out list of session observers.
///
/// Events go to observers in subscription order. Observers whose receiver was
/// dropped are removed on the next emission.
#[derive(Debug, Clone, Default)]
pub(crate) struct Observers {
    inner: std::sync::Arc<Mutex<Vec<Sender<SessionEvent>>>>,
}

impl Observers {
    pub(crate) fn subscribe(&self) -> crossbeam_channel::Receiver<SessionEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let mut observers = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
