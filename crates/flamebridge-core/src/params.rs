//! Render parameters with write-through to the engine.
//!
//! Every setter on [`ParameterStore`] follows the same discipline:
//!
//! 1. validate, rejecting with [`SessionError::Configuration`] and leaving
//!    the store untouched,
//! 2. compare with the current value; if unchanged, do nothing,
//! 3. call the engine setter,
//! 4. commit the new value locally.
//!
//! Setters return whether the engine was called.

use crate::error::{Result, SessionError};
use crate::native::{guarded, EngineApi};
use crate::progress::ThroughputBasis;

/// Validated render configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderParameters {
    pub width: i32,
    pub height: i32,
    pub oversample_level: i32,
    pub filter_radius: f64,
    pub samples_per_pixel: f64,
    pub vibrancy: f64,
    pub parameter_text: String,
}

impl Default for RenderParameters {
    fn default() -> Self {
        Self {
            width: 512,
            height: 384,
            oversample_level: 1,
            filter_radius: 0.5,
            samples_per_pixel: 50.0,
            vibrancy: 1.0,
            parameter_text: String::new(),
        }
    }
}

impl RenderParameters {
    pub fn throughput_basis(&self) -> ThroughputBasis {
        ThroughputBasis {
            width: self.width,
            height: self.height,
            samples_per_pixel: self.samples_per_pixel,
        }
    }
}

fn positive_int(name: &str, value: i32) -> Result<()> {
    if value <= 0 {
        return Err(SessionError::Configuration(format!(
            "{} should be greater than 0 but was set to {}",
            name, value
        )));
    }
    Ok(())
}

fn positive_float(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(SessionError::Configuration(format!(
            "{} should be a finite number greater than 0 but was set to {}",
            name, value
        )));
    }
    Ok(())
}

/// Current render parameters plus the write-through setters.
#[derive(Debug, Clone, Default)]
pub struct ParameterStore {
    values: RenderParameters,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &RenderParameters {
        &self.values
    }

    pub fn set_width(&mut self, width: i32, engine: &dyn EngineApi) -> Result<bool> {
        positive_int("width", width)?;
        self.set_size(width, self.values.height, engine)
    }

    pub fn set_height(&mut self, height: i32, engine: &dyn EngineApi) -> Result<bool> {
        positive_int("height", height)?;
        self.set_size(self.values.width, height, engine)
    }

    /// Set both dimensions with a single engine call.
    pub fn set_size(&mut self, width: i32, height: i32, engine: &dyn EngineApi) -> Result<bool> {
        positive_int("width", width)?;
        positive_int("height", height)?;
        if (width, height) == (self.values.width, self.values.height) {
            return Ok(false);
        }
        guarded("set-output-dimensions", || {
            engine.set_output_dimensions(width, height)
        })?;
        self.values.width = width;
        self.values.height = height;
        Ok(true)
    }

    pub fn set_oversample_level(&mut self, level: i32, engine: &dyn EngineApi) -> Result<bool> {
        positive_int("oversample level", level)?;
        self.set_antialiasing(level, self.values.filter_radius, engine)
    }

    pub fn set_filter_radius(&mut self, radius: f64, engine: &dyn EngineApi) -> Result<bool> {
        positive_float("filter radius", radius)?;
        self.set_antialiasing(self.values.oversample_level, radius, engine)
    }

    /// Oversampling level and filter radius always travel together.
    pub fn set_antialiasing(
        &mut self,
        level: i32,
        radius: f64,
        engine: &dyn EngineApi,
    ) -> Result<bool> {
        positive_int("oversample level", level)?;
        positive_float("filter radius", radius)?;
        if level == self.values.oversample_level && radius == self.values.filter_radius {
            return Ok(false);
        }
        guarded("set-antialiasing", || engine.set_antialiasing(level, radius))?;
        self.values.oversample_level = level;
        self.values.filter_radius = radius;
        Ok(true)
    }

    pub fn set_samples_per_pixel(&mut self, value: f64, engine: &dyn EngineApi) -> Result<bool> {
        positive_float("samples per pixel", value)?;
        if value == self.values.samples_per_pixel {
            return Ok(false);
        }
        guarded("set-samples-per-pixel", || engine.set_samples_per_pixel(value))?;
        self.values.samples_per_pixel = value;
        Ok(true)
    }

    pub fn set_vibrancy(&mut self, value: f64, engine: &dyn EngineApi) -> Result<bool> {
        positive_float("vibrancy", value)?;
        if value == self.values.vibrancy {
            return Ok(false);
        }
        guarded("set-vibrancy", || engine.set_vibrancy(value))?;
        self.values.vibrancy = value;
        Ok(true)
    }

    pub fn set_parameter_text(&mut self, text: &str, engine: &dyn EngineApi) -> Result<bool> {
        if text.contains('\0') {
            return Err(SessionError::Configuration(
                "parameter text contains an interior NUL".to_string(),
            ));
        }
        if text == self.values.parameter_text {
            return Ok(false);
        }
        guarded("set-parameter-text", || engine.set_parameter_text(text))?;
        self.values.parameter_text = text.to_string();
        Ok(true)
    }
}
