//! Entry-point binding for dynamically loaded engine modules.
//!
//! [`NativeEngine::load`] maps the module and resolves every entry point in
//! [`ENTRY_POINTS`]. Binding is all-or-nothing: the first missing symbol
//! fails the load with [`SessionError::Binding`] and the module is released
//! again.

use std::ffi::c_void;
use std::path::Path;

use libloading::Library;

use super::callbacks::{
    self, on_log, on_operation_change, on_progress, LogCallback, OperationCallback,
    ProgressCallback,
};
use super::strings::{read_native_string, NativeString, StringEncoding};
use super::{CallbackSink, EngineApi};
use crate::error::{Result, SessionError};

/// Every export the session needs, in binding order.
pub const ENTRY_POINTS: &[&str] = &[
    "ApophysisSetThreadingLevel",
    "ApophysisInitializeLibrary",
    "ApophysisInitializePlugin",
    "ApophysisDestroyLibrary",
    "ApophysisStartRenderingProcessAndWait",
    "ParametersSetParameterString",
    "ParametersSetLogSavePathString",
    "ParametersSetOutputDimensions",
    "ParametersSetSamplingParameters",
    "ParametersSetSamplesPerPixel",
    "ParametersSetVibrancy",
    "ParametersSetImagePaths",
    "EventsSetOnOperationChangeCallback",
    "EventsSetOnProgressCallback",
    "EventsSetOnLogCallback",
    "ApophysisGetRegisteredNameCount",
    "ApophysisGetRegisteredNameAt",
    "ApophysisGetRegisteredAttribCount",
    "ApophysisGetRegisteredAttribAt",
];

type VoidFn = unsafe extern "system" fn();
type SetIntFn = unsafe extern "system" fn(i32);
type SetStrFn = unsafe extern "system" fn(*const c_void);
type SetTwoStrFn = unsafe extern "system" fn(*const c_void, *const c_void);
type SetDimensionsFn = unsafe extern "system" fn(i32, i32);
type SetSamplingFn = unsafe extern "system" fn(i32, f64);
type SetDoubleFn = unsafe extern "system" fn(f64);
type StartRenderFn = unsafe extern "system" fn(*mut c_void) -> u32;
type RegisterFn = unsafe extern "system" fn(*const c_void);
type CountFn = unsafe extern "system" fn() -> u32;
type NameAtFn = unsafe extern "system" fn(u32) -> *const c_void;

/// Resolved entry points. Valid only while the owning [`Library`] is loaded.
#[derive(Clone, Copy)]
struct EntryPoints {
    set_threading_level: SetIntFn,
    initialize_library: VoidFn,
    initialize_plugin: SetTwoStrFn,
    destroy_library: VoidFn,
    start_render_and_wait: StartRenderFn,
    set_parameter_text: SetStrFn,
    set_log_path: SetStrFn,
    set_output_dimensions: SetDimensionsFn,
    set_antialiasing: SetSamplingFn,
    set_samples_per_pixel: SetDoubleFn,
    set_vibrancy: SetDoubleFn,
    set_output_paths: SetTwoStrFn,
    register_operation_change: RegisterFn,
    register_progress: RegisterFn,
    register_log: RegisterFn,
    registered_name_count: CountFn,
    registered_name_at: NameAtFn,
    registered_attribute_count: CountFn,
    registered_attribute_at: NameAtFn,
}

/// Look up one export and copy out its function pointer.
///
/// # Safety
///
/// `T` must be the function pointer type the export actually has.
unsafe fn resolve<T: Copy>(library: &Library, module: &str, symbol: &str) -> Result<T> {
    let found = library
        .get::<T>(symbol.as_bytes())
        .map_err(|source| SessionError::Binding {
            symbol: symbol.to_string(),
            module: module.to_string(),
            source,
        })?;
    log::debug!("Bound entry point {}", symbol);
    Ok(*found)
}

impl EntryPoints {
    /// # Safety
    ///
    /// The module must export the engine ABI described by [`ENTRY_POINTS`].
    unsafe fn bind(library: &Library, module: &str) -> Result<Self> {
        Ok(Self {
            set_threading_level: resolve(library, module, ENTRY_POINTS[0])?,
            initialize_library: resolve(library, module, ENTRY_POINTS[1])?,
            initialize_plugin: resolve(library, module, ENTRY_POINTS[2])?,
            destroy_library: resolve(library, module, ENTRY_POINTS[3])?,
            start_render_and_wait: resolve(library, module, ENTRY_POINTS[4])?,
            set_parameter_text: resolve(library, module, ENTRY_POINTS[5])?,
            set_log_path: resolve(library, module, ENTRY_POINTS[6])?,
            set_output_dimensions: resolve(library, module, ENTRY_POINTS[7])?,
            set_antialiasing: resolve(library, module, ENTRY_POINTS[8])?,
            set_samples_per_pixel: resolve(library, module, ENTRY_POINTS[9])?,
            set_vibrancy: resolve(library, module, ENTRY_POINTS[10])?,
            set_output_paths: resolve(library, module, ENTRY_POINTS[11])?,
            register_operation_change: resolve(library, module, ENTRY_POINTS[12])?,
            register_progress: resolve(library, module, ENTRY_POINTS[13])?,
            register_log: resolve(library, module, ENTRY_POINTS[14])?,
            registered_name_count: resolve(library, module, ENTRY_POINTS[15])?,
            registered_name_at: resolve(library, module, ENTRY_POINTS[16])?,
            registered_attribute_count: resolve(library, module, ENTRY_POINTS[17])?,
            registered_attribute_at: resolve(library, module, ENTRY_POINTS[18])?,
        })
    }
}

/// A render engine living in a dynamically loaded module.
pub struct NativeEngine {
    library: Option<Library>,
    entry: EntryPoints,
    identity: String,
    encoding: StringEncoding,
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine")
            .field("module", &self.identity)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

impl NativeEngine {
    /// Map the module at `path` and bind every entry point.
    ///
    /// # Errors
    ///
    /// [`SessionError::ModuleLoad`] if the module cannot be mapped,
    /// [`SessionError::Binding`] naming the first missing export.
    pub fn load(path: &Path, encoding: StringEncoding) -> Result<Self> {
        log::info!("Loading engine module {}", path.display());

        // SAFETY: loading runs the module's initializers; the module is the
        // engine the caller configured.
        let library = unsafe { Library::new(path) }.map_err(|source| SessionError::ModuleLoad {
            path: path.to_path_buf(),
            source,
        })?;

        let identity = path.display().to_string();
        // SAFETY: the export table is the engine ABI. On failure `library`
        // is dropped here, which releases the module.
        let entry = unsafe { EntryPoints::bind(&library, &identity)? };

        log::info!("Bound {} entry points in {}", ENTRY_POINTS.len(), identity);
        Ok(Self {
            library: Some(library),
            entry,
            identity,
            encoding,
        })
    }

    fn string(&self, value: &str) -> Result<NativeString> {
        NativeString::new(value, self.encoding)
    }

    fn read_string(&self, ptr: *const c_void) -> String {
        // SAFETY: the engine returns strings of the configured width that it
        // keeps alive at least until the next call.
        unsafe { read_native_string(ptr, self.encoding) }
    }
}

// All entry points are plain C functions; the engine serializes access
// internally and the session never calls it from two threads at once.
unsafe impl Send for NativeEngine {}
unsafe impl Sync for NativeEngine {}

impl EngineApi for NativeEngine {
    fn module_identity(&self) -> String {
        self.identity.clone()
    }

    fn set_threading_level(&self, level: i32) -> Result<()> {
        unsafe { (self.entry.set_threading_level)(level) };
        Ok(())
    }

    fn initialize_library(&self) -> Result<()> {
        unsafe { (self.entry.initialize_library)() };
        Ok(())
    }

    fn initialize_plugin(&self, directory: &str, file_name: &str) -> Result<()> {
        let directory = self.string(directory)?;
        let file_name = self.string(file_name)?;
        unsafe { (self.entry.initialize_plugin)(directory.as_ptr(), file_name.as_ptr()) };
        Ok(())
    }

    fn destroy_library(&self) -> Result<()> {
        unsafe { (self.entry.destroy_library)() };
        Ok(())
    }

    fn start_render_and_wait(&self) -> Result<u32> {
        Ok(unsafe { (self.entry.start_render_and_wait)(std::ptr::null_mut()) })
    }

    fn set_parameter_text(&self, text: &str) -> Result<()> {
        let text = self.string(text)?;
        unsafe { (self.entry.set_parameter_text)(text.as_ptr()) };
        Ok(())
    }

    fn set_log_path(&self, path: &str) -> Result<()> {
        let path = self.string(path)?;
        unsafe { (self.entry.set_log_path)(path.as_ptr()) };
        Ok(())
    }

    fn set_output_dimensions(&self, width: i32, height: i32) -> Result<()> {
        unsafe { (self.entry.set_output_dimensions)(width, height) };
        Ok(())
    }

    fn set_antialiasing(&self, oversample: i32, filter_radius: f64) -> Result<()> {
        unsafe { (self.entry.set_antialiasing)(oversample, filter_radius) };
        Ok(())
    }

    fn set_samples_per_pixel(&self, samples_per_pixel: f64) -> Result<()> {
        unsafe { (self.entry.set_samples_per_pixel)(samples_per_pixel) };
        Ok(())
    }

    fn set_vibrancy(&self, vibrancy: f64) -> Result<()> {
        unsafe { (self.entry.set_vibrancy)(vibrancy) };
        Ok(())
    }

    fn set_output_paths(&self, image: &str, alpha: &str) -> Result<()> {
        let image = self.string(image)?;
        let alpha = self.string(alpha)?;
        unsafe { (self.entry.set_output_paths)(image.as_ptr(), alpha.as_ptr()) };
        Ok(())
    }

    fn register_callbacks(&self, sink: CallbackSink) -> Result<()> {
        callbacks::install_route(sink, self.encoding);

        let progress = on_progress as ProgressCallback as *const c_void;
        let operation = on_operation_change as OperationCallback as *const c_void;
        let log_line = on_log as LogCallback as *const c_void;
        unsafe {
            (self.entry.register_progress)(progress);
            (self.entry.register_operation_change)(operation);
            (self.entry.register_log)(log_line);
        }
        Ok(())
    }

    fn registered_name_count(&self) -> Result<u32> {
        Ok(unsafe { (self.entry.registered_name_count)() })
    }

    fn registered_name_at(&self, index: u32) -> Result<String> {
        let ptr = unsafe { (self.entry.registered_name_at)(index) };
        Ok(self.read_string(ptr))
    }

    fn registered_attribute_count(&self) -> Result<u32> {
        Ok(unsafe { (self.entry.registered_attribute_count)() })
    }

    fn registered_attribute_at(&self, index: u32) -> Result<String> {
        let ptr = unsafe { (self.entry.registered_attribute_at)(index) };
        Ok(self.read_string(ptr))
    }

    fn unload(mut self: Box<Self>) -> Result<()> {
        callbacks::clear_route();
        match self.library.take() {
            Some(library) => {
                log::info!("Releasing engine module {}", self.identity);
                library.close().map_err(|e| SessionError::NativeCall {
                    operation: "unload",
                    cause: e.to_string(),
                })
            }
            None => Ok(()),
        }
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        if self.library.take().is_some() {
            callbacks::clear_route();
            log::debug!("Engine module {} released on drop", self.identity);
        }
    }
}
