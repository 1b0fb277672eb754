//! Drives a session through the public API with an engine defined outside
//! the crate.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use flamebridge_core::{
    CallbackSink, EngineApi, LogLevel, ProgressSample, Result, Session, SessionConfig,
    SessionError, SessionEvent, SessionState, ThreadingMode,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Engine that "renders" by writing the parameter text to the output path.
#[derive(Default)]
struct EchoEngine {
    sink: Mutex<Option<CallbackSink>>,
    log_dir: Mutex<Option<PathBuf>>,
    image: Mutex<Option<PathBuf>>,
    text: Mutex<String>,
    destroyed: Arc<Mutex<bool>>,
}

impl EngineApi for EchoEngine {
    fn module_identity(&self) -> String {
        "echo".to_string()
    }

    fn set_threading_level(&self, _level: i32) -> Result<()> {
        Ok(())
    }

    fn initialize_library(&self) -> Result<()> {
        Ok(())
    }

    fn initialize_plugin(&self, _directory: &str, _file_name: &str) -> Result<()> {
        Ok(())
    }

    fn destroy_library(&self) -> Result<()> {
        *self.destroyed.lock().unwrap() = true;
        Ok(())
    }

    fn start_render_and_wait(&self) -> Result<u32> {
        let sink = self.sink.lock().unwrap().clone().expect("callbacks registered");
        sink.operation_changed(2);
        for slice in 0..4 {
            sink.progress(ProgressSample::new(0.5, slice, 4, 0, 1));
        }
        sink.log("render.log", "ERROR|bucket overflow");

        let log_dir = self.log_dir.lock().unwrap().clone().expect("log path set");
        fs::write(log_dir.join("general.log"), "10:00:00|WARNING|slow disk\n")?;
        let image = self.image.lock().unwrap().clone().expect("output path set");
        fs::write(image, self.text.lock().unwrap().as_bytes())?;
        Ok(0)
    }

    fn set_parameter_text(&self, text: &str) -> Result<()> {
        *self.text.lock().unwrap() = text.to_string();
        Ok(())
    }

    fn set_log_path(&self, path: &str) -> Result<()> {
        *self.log_dir.lock().unwrap() = Some(PathBuf::from(path));
        Ok(())
    }

    fn set_output_dimensions(&self, _width: i32, _height: i32) -> Result<()> {
        Ok(())
    }

    fn set_antialiasing(&self, _oversample: i32, _filter_radius: f64) -> Result<()> {
        Ok(())
    }

    fn set_samples_per_pixel(&self, _samples_per_pixel: f64) -> Result<()> {
        Ok(())
    }

    fn set_vibrancy(&self, _vibrancy: f64) -> Result<()> {
        Ok(())
    }

    fn set_output_paths(&self, image: &str, _alpha: &str) -> Result<()> {
        *self.image.lock().unwrap() = Some(PathBuf::from(image));
        Ok(())
    }

    fn register_callbacks(&self, sink: CallbackSink) -> Result<()> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn registered_name_count(&self) -> Result<u32> {
        Ok(0)
    }

    fn registered_name_at(&self, _index: u32) -> Result<String> {
        Ok(String::new())
    }

    fn registered_attribute_count(&self) -> Result<u32> {
        Ok(0)
    }

    fn registered_attribute_at(&self, _index: u32) -> Result<String> {
        Ok(String::new())
    }

    fn unload(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_missing_module_fails_to_open() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig::for_module(dir.path().join("no-such-engine.so"));

    let err = Session::open(config).unwrap_err();
    assert!(matches!(err, SessionError::ModuleLoad { .. }));
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_full_render_through_public_api() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let config_path = root.path().join("session.toml");
    fs::write(
        &config_path,
        format!(
            "module_path = \"echo\"\nthreading = \"single\"\noutput_format = \"png\"\nwork_dir_root = {:?}\n",
            root.path()
        ),
    )
    .unwrap();
    let config = SessionConfig::load(&config_path).unwrap();
    assert_eq!(config.threading, ThreadingMode::Single);

    let engine = EchoEngine::default();
    let destroyed = engine.destroyed.clone();
    let session = Session::with_engine(config, Box::new(engine)).unwrap();
    let events = session.subscribe();

    session.set_size(640, 480).unwrap();
    session.set_parameter_text("<flame name=\"spiral\"/>").unwrap();
    let outcome = session.render().unwrap();

    assert_eq!(outcome.image_path.extension().unwrap(), "png");
    assert_eq!(
        fs::read_to_string(&outcome.image_path).unwrap(),
        "<flame name=\"spiral\"/>"
    );

    let events: Vec<SessionEvent> = events.try_iter().collect();
    let progress: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress(report) => Some(report.total_progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0.125, 0.375, 0.625, 0.875, 1.0]);

    let logs: Vec<(LogLevel, &str)> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Log(event) => Some((event.level, event.message.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(
        logs,
        vec![
            (LogLevel::Error, "bucket overflow"),
            (LogLevel::Warning, "slow disk"),
        ]
    );

    let work_dir = session.work_dir().to_path_buf();
    drop(session);
    assert!(*destroyed.lock().unwrap());
    assert!(!work_dir.exists());
}

#[test]
fn test_state_is_loaded_between_renders() {
    init_logging();
    let root = tempfile::tempdir().unwrap();
    let mut config = SessionConfig::for_module("echo");
    config.work_dir_root = Some(root.path().to_path_buf());

    let session = Session::with_engine(config, Box::new(EchoEngine::default())).unwrap();
    session.set_parameter_text("<flame/>").unwrap();
    session.render().unwrap();
    assert_eq!(session.state(), SessionState::Loaded);
    session.render().unwrap();
    assert_eq!(session.state(), SessionState::Loaded);
}
