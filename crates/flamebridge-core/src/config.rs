//! Session configuration.
//!
//! Configuration is plain data handed to [`crate::Session::open`]; it can be
//! built in code or loaded from a TOML file:
//!
//! ```toml
//! module_path = "/opt/aporender/libaporender.so"
//! string_encoding = "wide"
//! threading = "quad-core"
//! plugins = ["/opt/aporender/plugins/julian.dll"]
//! output_format = "png"
//!
//! [logging]
//! levels = "INFO | WARNING | ERROR"
//! sources = "RENDER"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::logs::{LogLevels, LogSources};
use crate::native::StringEncoding;

/// Default file extension of the rendered image.
pub const DEFAULT_OUTPUT_FORMAT: &str = "bmp";

/// Everything needed to open a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path of the engine module to load.
    pub module_path: PathBuf,
    /// How strings cross the engine boundary.
    pub string_encoding: StringEncoding,
    /// Engine worker thread level.
    pub threading: ThreadingMode,
    /// Plugin files initialized right after the engine comes up.
    pub plugins: Vec<PathBuf>,
    /// Parent directory of the per-session working directory. `None` uses
    /// the system temporary directory.
    pub work_dir_root: Option<PathBuf>,
    /// Extension of the image the engine writes.
    pub output_format: String,
    pub logging: LoggingSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            module_path: PathBuf::from(libloading::library_filename("aporender")),
            string_encoding: StringEncoding::default(),
            threading: ThreadingMode::default(),
            plugins: Vec::new(),
            work_dir_root: None,
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            logging: LoggingSettings::default(),
        }
    }
}

impl SessionConfig {
    /// Configuration for the given module with everything else defaulted.
    pub fn for_module(module_path: impl Into<PathBuf>) -> Self {
        Self {
            module_path: module_path.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SessionError::Config(format!(
                "Config file not found at {:?}",
                path
            )));
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.module_path.as_os_str().is_empty() {
            return Err(SessionError::Config("module_path is empty".to_string()));
        }
        let format = self.output_extension();
        if format.is_empty() || format.contains(['/', '\\', '.']) {
            return Err(SessionError::Config(format!(
                "invalid output_format {:?}",
                self.output_format
            )));
        }
        Ok(())
    }

    /// Output extension without a leading dot.
    pub fn output_extension(&self) -> &str {
        self.output_format.trim().trim_start_matches('.')
    }
}

/// Which log events reach observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub levels: LogLevels,
    pub sources: LogSources,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            levels: LogLevels::default(),
            sources: LogSources::default(),
        }
    }
}

/// Engine threading level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreadingMode {
    /// Pick a level from the number of available cores.
    #[default]
    Auto,
    Single,
    DualCore,
    QuadCore,
    QuadCoreHtLazy,
    QuadCoreHtGreedy,
}

impl ThreadingMode {
    /// Level code passed to the engine. `Auto` has no code of its own.
    pub fn code(self) -> Option<i32> {
        match self {
            ThreadingMode::Auto => None,
            ThreadingMode::Single => Some(1),
            ThreadingMode::DualCore => Some(2),
            ThreadingMode::QuadCore => Some(4),
            ThreadingMode::QuadCoreHtLazy => Some(6),
            ThreadingMode::QuadCoreHtGreedy => Some(8),
        }
    }

    /// Replace `Auto` with a concrete level for this machine.
    pub fn resolve(self) -> ThreadingMode {
        match self {
            ThreadingMode::Auto => {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                Self::for_cores(cores)
            }
            other => other,
        }
    }

    /// Concrete level code for this machine.
    pub fn resolved_code(self) -> i32 {
        self.resolve().code().unwrap_or(1)
    }

    fn for_cores(cores: usize) -> ThreadingMode {
        match cores {
            0..=2 => ThreadingMode::Single,
            3..=4 => ThreadingMode::DualCore,
            5..=6 => ThreadingMode::QuadCore,
            7..=8 => ThreadingMode::QuadCoreHtLazy,
            _ => ThreadingMode::QuadCoreHtGreedy,
        }
    }

    /// Map a host-facing thread count to a level. Zero means automatic.
    pub fn from_thread_count(threads: i32) -> ThreadingMode {
        match threads {
            0 => ThreadingMode::Auto,
            i32::MIN..=1 => ThreadingMode::Single,
            2..=3 => ThreadingMode::DualCore,
            4..=5 => ThreadingMode::QuadCore,
            6..=7 => ThreadingMode::QuadCoreHtLazy,
            _ => ThreadingMode::QuadCoreHtGreedy,
        }
    }
}
