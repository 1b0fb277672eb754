//! Session lifecycle.
//!
//! A [`Session`] owns one engine instance and drives it through
//! load, init, (configure)*, render, dispose. Engine callbacks are forwarded
//! into a channel drained by a dispatcher thread owned by the session, which
//! feeds the progress and log aggregators and fans events out to observers.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tempfile::TempDir;

use crate::config::SessionConfig;
use crate::error::{invalid_state, Result, SessionError};
use crate::logs::{LogAggregator, LogEvent, LogLevels, LogSources};
use crate::native::callbacks::{EngineMessage, Observers};
use crate::native::{guarded, CallbackSink, EngineApi, NativeEngine};
use crate::params::{ParameterStore, RenderParameters};
use crate::progress::{Clock, MonotonicClock, Operation, ProgressAggregator, ProgressReport};

/// Serializes renders across every session in the process.
static RENDER_GATE: Mutex<()> = Mutex::new(());

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loaded,
    Rendering,
    Disposed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Loaded => "loaded",
            SessionState::Rendering => "rendering",
            SessionState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Events delivered to observers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Progress(ProgressReport),
    OperationChanged(Operation),
    Log(LogEvent),
}

/// Result of a successful render.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutcome {
    /// Image written by the engine.
    pub image_path: PathBuf,
    /// Wall time of the render call.
    pub elapsed: Duration,
}

struct Dispatcher {
    tx: Sender<EngineMessage>,
    handle: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One engine instance and everything attached to it.
pub struct Session {
    config: SessionConfig,
    state: Mutex<SessionState>,
    engine: RwLock<Option<Box<dyn EngineApi>>>,
    params: Mutex<ParameterStore>,
    /// Held for the whole of `render()` and for every parameter write.
    render_lock: Mutex<()>,
    progress: Arc<Mutex<ProgressAggregator>>,
    logs: Arc<Mutex<LogAggregator>>,
    observers: Observers,
    dispatcher: Mutex<Option<Dispatcher>>,
    work_dir: Mutex<Option<TempDir>>,
    work_dir_path: PathBuf,
    result_path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("work_dir", &self.work_dir_path)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Load the engine module named by `config` and bring it up.
    pub fn open(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let engine = NativeEngine::load(&config.module_path, config.string_encoding)?;
        Self::with_engine(config, Box::new(engine))
    }

    /// Bring up a session around an already loaded engine.
    pub fn with_engine(config: SessionConfig, engine: Box<dyn EngineApi>) -> Result<Self> {
        Self::with_engine_and_clock(config, engine, Arc::new(MonotonicClock::default()))
    }

    /// Like [`Session::with_engine`], timing progress with `clock`.
    pub fn with_engine_and_clock(
        config: SessionConfig,
        engine: Box<dyn EngineApi>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let prepared = config.validate().and_then(|_| create_work_dir(&config));
        let work_dir = match prepared {
            Ok(dir) => dir,
            Err(e) => {
                release_unused(engine);
                return Err(e);
            }
        };

        let work_dir_path = work_dir.path().to_path_buf();
        let result_path = work_dir_path.join(format!("output.{}", config.output_extension()));
        let progress = Arc::new(Mutex::new(ProgressAggregator::new(clock.clone())));
        let logs = Arc::new(Mutex::new(LogAggregator::new(
            config.logging.levels,
            config.logging.sources,
        )));
        let observers = Observers::default();

        let (tx, rx) = unbounded();
        let handle = match spawn_dispatcher(rx, progress.clone(), logs.clone(), observers.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                release_unused(engine);
                return Err(e.into());
            }
        };

        log::info!(
            "Opening session for {} in {}",
            engine.module_identity(),
            work_dir_path.display()
        );

        let session = Session {
            config,
            state: Mutex::new(SessionState::Unloaded),
            engine: RwLock::new(Some(engine)),
            params: Mutex::new(ParameterStore::new()),
            render_lock: Mutex::new(()),
            progress,
            logs,
            observers,
            dispatcher: Mutex::new(Some(Dispatcher { tx, handle })),
            work_dir: Mutex::new(Some(work_dir)),
            work_dir_path,
            result_path,
            clock,
        };

        if let Err(e) = session.bring_up() {
            log::error!("Session initialization failed: {}", e);
            session.dispose();
            return Err(e);
        }
        Ok(session)
    }

    fn bring_up(&self) -> Result<()> {
        let sink = {
            let dispatcher = lock(&self.dispatcher);
            let tx = dispatcher
                .as_ref()
                .map(|d| d.tx.clone())
                .ok_or_else(|| invalid_state("open", SessionState::Disposed))?;
            CallbackSink::new(tx)
        };
        let log_path = self.work_dir_str()?.to_string();
        let threading = self.config.threading.resolved_code();

        {
            let guard = self.engine_read();
            let engine = guard
                .as_deref()
                .ok_or_else(|| invalid_state("open", SessionState::Disposed))?;
            guarded("register-callbacks", || engine.register_callbacks(sink))?;
            guarded("set-log-path", || engine.set_log_path(&log_path))?;
            guarded("initialize-library", || engine.initialize_library())?;
            // From here on disposal must destroy the instance.
            *lock(&self.state) = SessionState::Loaded;
            guarded("set-threading-level", || engine.set_threading_level(threading))?;
        }
        log::debug!("Engine initialized with threading level {}", threading);

        for plugin in &self.config.plugins {
            self.load_plugin(plugin)?;
        }
        self.poll_logs();
        Ok(())
    }

    /// Initialize the plugin at `path`.
    ///
    /// On failure the session is disposed and the error is surfaced as
    /// [`SessionError::PluginLoad`].
    pub fn load_plugin(&self, path: &Path) -> Result<()> {
        let result = {
            let _render = lock(&self.render_lock);
            self.require_loaded("load a plugin")?;
            self.initialize_plugin(path)
        };
        match result {
            Ok(()) => {
                log::info!("Loaded plugin {}", path.display());
                self.poll_logs();
                Ok(())
            }
            Err(cause) => {
                log::error!("Unable to load plugin {}: {}", path.display(), cause);
                self.dispose();
                Err(SessionError::PluginLoad {
                    path: path.to_path_buf(),
                    cause: Box::new(cause),
                })
            }
        }
    }

    fn initialize_plugin(&self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a file", path.display()),
            )));
        }
        let directory = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let guard = self.engine_read();
        let engine = guard
            .as_deref()
            .ok_or_else(|| invalid_state("load a plugin", SessionState::Disposed))?;
        guarded("initialize-plugin", || {
            engine.initialize_plugin(&directory, &file_name)
        })
    }

    /// Render the current parameters. Blocks until the engine is done.
    pub fn render(&self) -> Result<RenderOutcome> {
        if lock(&self.params).values().parameter_text.is_empty() {
            return Err(SessionError::Configuration(
                "no parameters to render".to_string(),
            ));
        }
        {
            let mut state = lock(&self.state);
            if *state != SessionState::Loaded {
                return Err(invalid_state("render", *state));
            }
            *state = SessionState::Rendering;
        }

        let _render = lock(&self.render_lock);
        let _gate = lock(&RENDER_GATE);

        let started = self.clock.now();
        let result = self.run_render();
        let elapsed = self.clock.now().saturating_sub(started);
        {
            let mut state = lock(&self.state);
            if *state == SessionState::Rendering {
                *state = SessionState::Loaded;
            }
        }

        self.flush_dispatcher();
        let code = match result {
            Ok(code) => code,
            Err(e) => {
                self.poll_logs();
                return Err(e);
            }
        };

        // The engine call returned, so the render is complete either way.
        let report = lock(&self.progress).finish();
        self.observers.emit(SessionEvent::Progress(report));
        self.poll_logs();

        if code != 0 {
            log::error!("Render failed with code {}", code);
            return Err(SessionError::RenderFailure { code });
        }
        log::info!("Render finished in {:.2}s", elapsed.as_secs_f64());
        Ok(RenderOutcome {
            image_path: self.result_path.clone(),
            elapsed,
        })
    }

    fn run_render(&self) -> Result<u32> {
        let values = lock(&self.params).values().clone();
        let image = self
            .result_path
            .to_str()
            .ok_or_else(|| {
                SessionError::Configuration(format!(
                    "output path {} is not valid unicode",
                    self.result_path.display()
                ))
            })?
            .to_string();

        let guard = self.engine_read();
        let engine = guard
            .as_deref()
            .ok_or_else(|| invalid_state("render", SessionState::Disposed))?;

        guarded("set-output-paths", || engine.set_output_paths(&image, ""))?;
        guarded("set-vibrancy", || engine.set_vibrancy(values.vibrancy))?;
        guarded("set-parameter-text", || {
            engine.set_parameter_text(&values.parameter_text)
        })?;
        self.poll_logs();

        lock(&self.progress).begin(values.throughput_basis());
        log::debug!(
            "Starting render: {}x{} at {} samples per pixel",
            values.width,
            values.height,
            values.samples_per_pixel
        );
        guarded("start-render-and-wait", || engine.start_render_and_wait())
    }

    /// Wait until the dispatcher has handled everything queued so far.
    fn flush_dispatcher(&self) {
        let tx = lock(&self.dispatcher).as_ref().map(|d| d.tx.clone());
        let Some(tx) = tx else { return };
        let (ack_tx, ack_rx) = bounded(1);
        let sent = tx.send(EngineMessage::Flush(ack_tx)).is_ok();
        drop(tx);
        if sent {
            let _ = ack_rx.recv();
        }
    }

    /// Release the engine and the working directory.
    ///
    /// Safe to call any number of times and from any state; errors are
    /// logged, never returned.
    pub fn dispose(&self) {
        let previous = {
            let mut state = lock(&self.state);
            if *state == SessionState::Disposed {
                return;
            }
            std::mem::replace(&mut *state, SessionState::Disposed)
        };
        log::debug!("Disposing session (was {})", previous);

        let engine = self
            .engine
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(engine) = engine {
            if matches!(previous, SessionState::Loaded | SessionState::Rendering) {
                if let Err(e) = guarded("destroy-library", || engine.destroy_library()) {
                    log::warn!("Failed to destroy engine instance: {}", e);
                }
                self.poll_logs();
            }
            if let Err(e) = guarded("unload", || engine.unload()) {
                log::warn!("Failed to release engine module: {}", e);
            }
        }

        if let Some(dispatcher) = lock(&self.dispatcher).take() {
            let _ = dispatcher.tx.send(EngineMessage::Shutdown);
            if dispatcher.handle.join().is_err() {
                log::warn!("Dispatcher thread panicked");
            }
        }

        if let Some(dir) = lock(&self.work_dir).take() {
            if let Err(e) = dir.close() {
                log::warn!(
                    "Could not remove working directory {}: {}",
                    self.work_dir_path.display(),
                    e
                );
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Configuration the session was opened with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Snapshot of the current render parameters.
    pub fn parameters(&self) -> RenderParameters {
        lock(&self.params).values().clone()
    }

    /// Session-private directory holding engine logs and output.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir_path
    }

    /// Where the engine writes the rendered image.
    pub fn result_path(&self) -> &Path {
        &self.result_path
    }

    /// Receive progress, operation and log events.
    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        self.observers.subscribe()
    }

    /// Current engine phase as last reported.
    pub fn operation(&self) -> Operation {
        lock(&self.progress).operation()
    }

    /// Set the output width, keeping the height.
    ///
    /// Setters return whether the engine was called; an unchanged value is
    /// not written again.
    pub fn set_width(&self, width: i32) -> Result<bool> {
        self.write_parameter("set the width", |store, engine| {
            store.set_width(width, engine)
        })
    }

    /// Set the output height, keeping the width.
    pub fn set_height(&self, height: i32) -> Result<bool> {
        self.write_parameter("set the height", |store, engine| {
            store.set_height(height, engine)
        })
    }

    /// Set both output dimensions with a single engine call.
    pub fn set_size(&self, width: i32, height: i32) -> Result<bool> {
        self.write_parameter("set the size", |store, engine| {
            store.set_size(width, height, engine)
        })
    }

    /// Set the oversampling level, keeping the filter radius.
    pub fn set_oversample_level(&self, level: i32) -> Result<bool> {
        self.write_parameter("set the oversample level", |store, engine| {
            store.set_oversample_level(level, engine)
        })
    }

    /// Set the filter radius, keeping the oversampling level.
    pub fn set_filter_radius(&self, radius: f64) -> Result<bool> {
        self.write_parameter("set the filter radius", |store, engine| {
            store.set_filter_radius(radius, engine)
        })
    }

    /// Set the sample density.
    pub fn set_samples_per_pixel(&self, samples_per_pixel: f64) -> Result<bool> {
        self.write_parameter("set samples per pixel", |store, engine| {
            store.set_samples_per_pixel(samples_per_pixel, engine)
        })
    }

    /// Set the vibrancy.
    pub fn set_vibrancy(&self, vibrancy: f64) -> Result<bool> {
        self.write_parameter("set the vibrancy", |store, engine| {
            store.set_vibrancy(vibrancy, engine)
        })
    }

    /// Set the flame parameters to render.
    pub fn set_parameter_text(&self, text: &str) -> Result<bool> {
        self.write_parameter("set the parameter text", |store, engine| {
            store.set_parameter_text(text, engine)
        })
    }

    /// Choose which log levels reach observers.
    pub fn set_log_levels(&self, levels: LogLevels) {
        lock(&self.logs).set_levels(levels);
    }

    /// Choose which log files are read.
    pub fn set_log_sources(&self, sources: LogSources) {
        lock(&self.logs).set_sources(sources);
    }

    /// Variation names the engine knows about.
    pub fn registered_names(&self) -> Result<Vec<String>> {
        self.enumerate("list registered names", |engine| {
            let count = guarded("get-registered-name-count", || engine.registered_name_count())?;
            (0..count)
                .map(|i| guarded("get-registered-name-at", || engine.registered_name_at(i)))
                .collect()
        })
    }

    /// Attribute names the engine knows about.
    pub fn registered_attributes(&self) -> Result<Vec<String>> {
        self.enumerate("list registered attributes", |engine| {
            let count = guarded("get-registered-attribute-count", || {
                engine.registered_attribute_count()
            })?;
            (0..count)
                .map(|i| {
                    guarded("get-registered-attribute-at", || {
                        engine.registered_attribute_at(i)
                    })
                })
                .collect()
        })
    }

    /// Re-read the engine logs and emit anything new.
    pub fn poll_logs(&self) {
        let events = lock(&self.logs).poll(&self.work_dir_path);
        for event in events {
            self.observers.emit(SessionEvent::Log(event));
        }
    }

    fn enumerate(
        &self,
        operation: &'static str,
        list: impl FnOnce(&dyn EngineApi) -> Result<Vec<String>>,
    ) -> Result<Vec<String>> {
        self.require_loaded(operation)?;
        let guard = self.engine_read();
        let engine = guard
            .as_deref()
            .ok_or_else(|| invalid_state(operation, SessionState::Disposed))?;
        list(engine)
    }

    fn write_parameter(
        &self,
        operation: &'static str,
        write: impl FnOnce(&mut ParameterStore, &dyn EngineApi) -> Result<bool>,
    ) -> Result<bool> {
        self.require_loaded(operation)?;
        let changed = {
            let _render = lock(&self.render_lock);
            // A render may have started while we waited.
            self.require_loaded(operation)?;
            let guard = self.engine_read();
            let engine = guard
                .as_deref()
                .ok_or_else(|| invalid_state(operation, SessionState::Disposed))?;
            let mut params = lock(&self.params);
            write(&mut *params, engine)?
        };
        if changed {
            self.poll_logs();
        }
        Ok(changed)
    }

    fn require_loaded(&self, operation: &'static str) -> Result<()> {
        match *lock(&self.state) {
            SessionState::Loaded => Ok(()),
            other => Err(invalid_state(operation, other)),
        }
    }

    fn engine_read(&self) -> RwLockReadGuard<'_, Option<Box<dyn EngineApi>>> {
        self.engine.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn work_dir_str(&self) -> Result<&str> {
        self.work_dir_path.to_str().ok_or_else(|| {
            SessionError::Configuration(format!(
                "working directory {} is not valid unicode",
                self.work_dir_path.display()
            ))
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn create_work_dir(config: &SessionConfig) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("flamebridge-");
    let dir = match &config.work_dir_root {
        Some(root) => builder.tempdir_in(root)?,
        None => builder.tempdir()?,
    };
    Ok(dir)
}

fn release_unused(engine: Box<dyn EngineApi>) {
    if let Err(e) = guarded("unload", || engine.unload()) {
        log::warn!("Failed to release engine module: {}", e);
    }
}

fn spawn_dispatcher(
    rx: Receiver<EngineMessage>,
    progress: Arc<Mutex<ProgressAggregator>>,
    logs: Arc<Mutex<LogAggregator>>,
    observers: Observers,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("flamebridge-dispatch".to_string())
        .spawn(move || {
            log::debug!("Dispatcher thread started");
            for msg in rx.iter() {
                match msg {
                    EngineMessage::Progress(sample) => {
                        let report = lock(&progress).ingest(sample);
                        observers.emit(SessionEvent::Progress(report));
                    }
                    EngineMessage::OperationChanged(code) => {
                        let operation = Operation::from_code(code);
                        lock(&progress).set_operation(operation);
                        log::debug!("Engine operation: {}", operation.label());
                        observers.emit(SessionEvent::OperationChanged(operation));
                    }
                    EngineMessage::Log { file, message } => {
                        let event = lock(&logs).push(&file, &message);
                        if let Some(event) = event {
                            observers.emit(SessionEvent::Log(event));
                        }
                    }
                    EngineMessage::Flush(ack) => {
                        let _ = ack.send(());
                    }
                    EngineMessage::Shutdown => break,
                }
            }
            log::debug!("Dispatcher thread stopped");
        })
}
