//! flamebridge-core - Session layer for dynamically loaded flame render engines
//!
//! Drives a native render engine module through its lifecycle and turns its
//! raw callbacks and log files into typed events:
//!
//! - **Native** - module loading, entry-point binding and callback trampolines
//! - **Params** - validated render parameters written through to the engine
//! - **Session** - load, init, configure, render, dispose
//! - **Progress** - rate-limited throughput and ETA from raw progress samples
//! - **Logs** - merged, deduplicated and filtered engine log output
//!
//! # Usage
//!
//! ```no_run
//! use flamebridge_core::{Session, SessionConfig, SessionEvent};
//!
//! let config = SessionConfig::for_module("/opt/aporender/libaporender.so");
//! let session = Session::open(config)?;
//! let events = session.subscribe();
//!
//! session.set_size(1920, 1080)?;
//! session.set_parameter_text(&std::fs::read_to_string("spiral.flame")?)?;
//!
//! let outcome = session.render()?;
//! for event in events.try_iter() {
//!     if let SessionEvent::Progress(report) = event {
//!         println!("{:.0}%", report.total_progress * 100.0);
//!     }
//! }
//! println!("image at {}", outcome.image_path.display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod logs;
pub mod native;
pub mod params;
pub mod progress;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use config::{LoggingSettings, SessionConfig, ThreadingMode};
pub use error::{Result, SessionError};
pub use logs::{LogAggregator, LogEvent, LogLevel, LogLevels, LogSource, LogSources};
pub use native::{CallbackSink, EngineApi, NativeEngine, StringEncoding};
pub use params::{ParameterStore, RenderParameters};
pub use progress::{
    Clock, ManualClock, MonotonicClock, Operation, ProgressAggregator, ProgressReport,
    ProgressSample,
};
pub use session::{RenderOutcome, Session, SessionEvent, SessionState};
