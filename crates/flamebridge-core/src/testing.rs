//! In-process engine used by the unit tests.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Result, SessionError};
use crate::native::{CallbackSink, EngineApi};
use crate::progress::{ManualClock, ProgressSample};

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    SetThreadingLevel(i32),
    InitializeLibrary,
    InitializePlugin(String, String),
    DestroyLibrary,
    StartRender,
    SetParameterText(String),
    SetLogPath(String),
    SetOutputDimensions(i32, i32),
    SetAntialiasing(i32, f64),
    SetSamplesPerPixel(f64),
    SetVibrancy(f64),
    SetOutputPaths(String, String),
    RegisterCallbacks,
    Unload,
}

/// Something the engine does while a render is in flight.
#[derive(Debug, Clone)]
pub enum RenderStep {
    Progress(ProgressSample),
    Operation(i32),
    Push(String, String),
    /// Append a line to `<log path>/<file>`.
    WriteLog(String, String),
    Advance(Arc<ManualClock>, Duration),
    /// Tell the test the render is running.
    Signal(Sender<()>),
    /// Block until the test lets the render continue.
    WaitFor(Receiver<()>),
}

#[derive(Default)]
struct Shared {
    calls: Vec<EngineCall>,
    sink: Option<CallbackSink>,
    log_path: Option<PathBuf>,
    fail_on: HashSet<&'static str>,
    panic_on: HashSet<&'static str>,
    steps: Vec<RenderStep>,
    render_code: u32,
    names: Vec<String>,
    attributes: Vec<String>,
}

/// Engine that records every call into a journal shared with the test.
#[derive(Clone, Default)]
pub struct RecordingEngine {
    shared: Arc<Mutex<Shared>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("recording engine poisoned")
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make the named operation return an error.
    pub fn fail_on(&self, operation: &'static str) {
        self.lock().fail_on.insert(operation);
    }

    /// Make the named operation panic.
    pub fn panic_on(&self, operation: &'static str) {
        self.lock().panic_on.insert(operation);
    }

    pub fn set_render_code(&self, code: u32) {
        self.lock().render_code = code;
    }

    pub fn script(&self, steps: Vec<RenderStep>) {
        self.lock().steps = steps;
    }

    pub fn set_registry(&self, names: &[&str], attributes: &[&str]) {
        let mut shared = self.lock();
        shared.names = names.iter().map(|s| s.to_string()).collect();
        shared.attributes = attributes.iter().map(|s| s.to_string()).collect();
    }

    pub fn boxed(&self) -> Box<dyn EngineApi> {
        Box::new(self.clone())
    }

    fn record(&self, operation: &'static str, call: EngineCall) -> Result<()> {
        let (fail, panic) = {
            let mut shared = self.lock();
            shared.calls.push(call);
            (
                shared.fail_on.contains(operation),
                shared.panic_on.contains(operation),
            )
        };
        if panic {
            panic!("{} blew up", operation);
        }
        if fail {
            return Err(SessionError::NativeCall {
                operation,
                cause: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    fn run_step(&self, step: RenderStep) {
        let (sink, log_path) = {
            let shared = self.lock();
            (shared.sink.clone(), shared.log_path.clone())
        };
        match step {
            RenderStep::Progress(sample) => {
                if let Some(sink) = sink {
                    sink.progress(sample);
                }
            }
            RenderStep::Operation(code) => {
                if let Some(sink) = sink {
                    sink.operation_changed(code);
                }
            }
            RenderStep::Push(file, message) => {
                if let Some(sink) = sink {
                    sink.log(file, message);
                }
            }
            RenderStep::WriteLog(file, line) => {
                let dir = log_path.expect("log path not set");
                let mut out = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(file))
                    .expect("open log file");
                writeln!(out, "{}", line).expect("write log line");
            }
            RenderStep::Advance(clock, by) => clock.advance(by),
            RenderStep::Signal(tx) => {
                let _ = tx.send(());
            }
            RenderStep::WaitFor(rx) => {
                let _ = rx.recv_timeout(Duration::from_secs(10));
            }
        }
    }
}

impl EngineApi for RecordingEngine {
    fn module_identity(&self) -> String {
        "recording-engine".to_string()
    }

    fn set_threading_level(&self, level: i32) -> Result<()> {
        self.record("set-threading-level", EngineCall::SetThreadingLevel(level))
    }

    fn initialize_library(&self) -> Result<()> {
        self.record("initialize-library", EngineCall::InitializeLibrary)
    }

    fn initialize_plugin(&self, directory: &str, file_name: &str) -> Result<()> {
        self.record(
            "initialize-plugin",
            EngineCall::InitializePlugin(directory.to_string(), file_name.to_string()),
        )
    }

    fn destroy_library(&self) -> Result<()> {
        self.record("destroy-library", EngineCall::DestroyLibrary)
    }

    fn start_render_and_wait(&self) -> Result<u32> {
        self.record("start-render-and-wait", EngineCall::StartRender)?;
        let steps = std::mem::take(&mut self.lock().steps);
        for step in steps {
            self.run_step(step);
        }
        Ok(self.lock().render_code)
    }

    fn set_parameter_text(&self, text: &str) -> Result<()> {
        self.record(
            "set-parameter-text",
            EngineCall::SetParameterText(text.to_string()),
        )
    }

    fn set_log_path(&self, path: &str) -> Result<()> {
        self.lock().log_path = Some(PathBuf::from(path));
        self.record("set-log-path", EngineCall::SetLogPath(path.to_string()))
    }

    fn set_output_dimensions(&self, width: i32, height: i32) -> Result<()> {
        self.record(
            "set-output-dimensions",
            EngineCall::SetOutputDimensions(width, height),
        )
    }

    fn set_antialiasing(&self, oversample: i32, filter_radius: f64) -> Result<()> {
        self.record(
            "set-antialiasing",
            EngineCall::SetAntialiasing(oversample, filter_radius),
        )
    }

    fn set_samples_per_pixel(&self, samples_per_pixel: f64) -> Result<()> {
        self.record(
            "set-samples-per-pixel",
            EngineCall::SetSamplesPerPixel(samples_per_pixel),
        )
    }

    fn set_vibrancy(&self, vibrancy: f64) -> Result<()> {
        self.record("set-vibrancy", EngineCall::SetVibrancy(vibrancy))
    }

    fn set_output_paths(&self, image: &str, alpha: &str) -> Result<()> {
        self.record(
            "set-output-paths",
            EngineCall::SetOutputPaths(image.to_string(), alpha.to_string()),
        )
    }

    fn register_callbacks(&self, sink: CallbackSink) -> Result<()> {
        self.lock().sink = Some(sink);
        self.record("register-callbacks", EngineCall::RegisterCallbacks)
    }

    fn registered_name_count(&self) -> Result<u32> {
        Ok(self.lock().names.len() as u32)
    }

    fn registered_name_at(&self, index: u32) -> Result<String> {
        Ok(self.lock().names[index as usize].clone())
    }

    fn registered_attribute_count(&self) -> Result<u32> {
        Ok(self.lock().attributes.len() as u32)
    }

    fn registered_attribute_at(&self, index: u32) -> Result<String> {
        Ok(self.lock().attributes[index as usize].clone())
    }

    fn unload(self: Box<Self>) -> Result<()> {
        self.lock().sink = None;
        self.record("unload", EngineCall::Unload)
    }
}
