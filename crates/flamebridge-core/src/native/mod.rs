//! The engine boundary.
//!
//! [`EngineApi`] is the one seam between the session and whatever performs
//! the actual rendering. [`NativeEngine`] implements it on top of a
//! dynamically loaded module; tests use an in-process recording engine.
//!
//! - [`binder`] - module loading and entry-point resolution
//! - [`callbacks`] - callback trampolines and the dispatcher message type
//! - [`strings`] - narrow/wide string marshalling

pub mod binder;
pub mod callbacks;
pub mod strings;

use std::panic::{self, AssertUnwindSafe};

pub use binder::{NativeEngine, ENTRY_POINTS};
pub use callbacks::CallbackSink;
pub use strings::{NativeString, StringEncoding};

use crate::error::{Result, SessionError};

/// Operations exposed by a render engine.
///
/// Method names follow the engine's entry-point table. Every call is
/// synchronous; [`EngineApi::start_render_and_wait`] blocks until the engine
/// finishes and reports progress through the registered [`CallbackSink`]
/// while it runs.
pub trait EngineApi: Send + Sync {
    /// Human-readable identity of the loaded module (usually its path).
    fn module_identity(&self) -> String;

    fn set_threading_level(&self, level: i32) -> Result<()>;
    fn initialize_library(&self) -> Result<()>;
    fn initialize_plugin(&self, directory: &str, file_name: &str) -> Result<()>;
    fn destroy_library(&self) -> Result<()>;

    /// Run the render to completion. Zero means success.
    fn start_render_and_wait(&self) -> Result<u32>;

    fn set_parameter_text(&self, text: &str) -> Result<()>;
    fn set_log_path(&self, path: &str) -> Result<()>;
    fn set_output_dimensions(&self, width: i32, height: i32) -> Result<()>;
    fn set_antialiasing(&self, oversample: i32, filter_radius: f64) -> Result<()>;
    fn set_samples_per_pixel(&self, samples_per_pixel: f64) -> Result<()>;
    fn set_vibrancy(&self, vibrancy: f64) -> Result<()>;
    fn set_output_paths(&self, image: &str, alpha: &str) -> Result<()>;

    /// Register the progress, operation-change and log callbacks.
    fn register_callbacks(&self, sink: CallbackSink) -> Result<()>;

    fn registered_name_count(&self) -> Result<u32>;
    fn registered_name_at(&self, index: u32) -> Result<String>;
    fn registered_attribute_count(&self) -> Result<u32>;
    fn registered_attribute_at(&self, index: u32) -> Result<String>;

    /// Release the module. The engine must not be used afterwards.
    fn unload(self: Box<Self>) -> Result<()>;
}

/// Run an engine call, turning a panic that unwinds out of it into
/// [`SessionError::NativeCall`].
pub(crate) fn guarded<T>(operation: &'static str, call: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let cause = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "engine call panicked".to_string());
            log::error!("Native call {} failed: {}", operation, cause);
            Err(SessionError::NativeCall { operation, cause })
        }
    }
}
