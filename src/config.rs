// Pipeline configuration, presets and input validation
//
// PipelineConfig holds the tunables of the controller (retrieval timeout,
// synchronization tolerance, request bounds). It can be built from defaults,
// from a preset in PipelineConfigFactory, or loaded from a JSON file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::StreamRequest;

/// Default budget for a blocking frameset wait
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5000;

/// Longest accepted device serial
const MAX_SERIAL_LEN: usize = 64;

/// Pipeline controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Timeout used by `wait_for_frameset_default`
    pub default_wait_timeout_ms: u64,
    /// Fraction of the slowest stream's frame interval within which samples
    /// of different streams are considered simultaneous
    pub sync_tolerance_ratio: f64,
    /// Largest width or height accepted in a stream request
    pub max_stream_dimension: u32,
    /// Largest frame rate accepted in a stream request
    pub max_frame_rate: u32,
    /// Largest stream index accepted in a stream request
    pub max_stream_index: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            sync_tolerance_ratio: 0.5,
            max_stream_dimension: 8192,
            max_frame_rate: 1000,
            max_stream_index: 16,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a configuration from JSON text
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig =
            serde_json::from_str(json).context("Failed to parse pipeline configuration")?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline configuration {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("Invalid pipeline configuration {}", path.display()))
    }

    /// Synchronization tolerance for a set of stream rates, keyed to the slowest one
    pub fn sync_tolerance_ms(&self, slowest_fps: u32) -> f64 {
        (1000.0 / slowest_fps.max(1) as f64) * self.sync_tolerance_ratio
    }
}

/// Factory for pipeline configurations tuned to a use case
pub struct PipelineConfigFactory;

impl PipelineConfigFactory {
    /// Tight synchronization and a short wait budget for interactive consumers
    pub fn create_realtime_config() -> PipelineConfig {
        PipelineConfig {
            default_wait_timeout_ms: 1000,
            sync_tolerance_ratio: 0.25,
            ..PipelineConfig::default()
        }
    }

    /// Lenient synchronization and a long wait budget for capture-to-disk consumers
    pub fn create_recording_config() -> PipelineConfig {
        PipelineConfig {
            default_wait_timeout_ms: 10_000,
            sync_tolerance_ratio: 0.9,
            ..PipelineConfig::default()
        }
    }
}

/// Validate pipeline configuration bounds
pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    if config.default_wait_timeout_ms == 0 || config.default_wait_timeout_ms > 600_000 {
        return Err(anyhow::anyhow!(
            "Invalid default wait timeout: {}ms (must be 1-600000ms)",
            config.default_wait_timeout_ms
        ));
    }

    if !(config.sync_tolerance_ratio > 0.0 && config.sync_tolerance_ratio <= 1.0) {
        return Err(anyhow::anyhow!(
            "Invalid sync tolerance ratio: {} (must be in (0, 1])",
            config.sync_tolerance_ratio
        ));
    }

    if config.max_stream_dimension == 0 || config.max_frame_rate == 0 {
        return Err(anyhow::anyhow!(
            "Stream bounds must be non-zero (dimension: {}, frame rate: {})",
            config.max_stream_dimension,
            config.max_frame_rate
        ));
    }

    Ok(())
}

/// Validate an application stream request against the configured bounds.
/// Zero fields are "don't care" and always accepted.
pub fn validate_stream_request(request: &StreamRequest, config: &PipelineConfig) -> Result<()> {
    if request.width > config.max_stream_dimension || request.height > config.max_stream_dimension {
        return Err(anyhow::anyhow!(
            "Stream {} dimensions {}x{} exceed the maximum of {}",
            request.kind,
            request.width,
            request.height,
            config.max_stream_dimension
        ));
    }

    if request.fps > config.max_frame_rate {
        return Err(anyhow::anyhow!(
            "Stream {} frame rate {} exceeds the maximum of {}",
            request.kind,
            request.fps,
            config.max_frame_rate
        ));
    }

    if request.index > config.max_stream_index {
        return Err(anyhow::anyhow!(
            "Stream {} index {} exceeds the maximum of {}",
            request.kind,
            request.index,
            config.max_stream_index
        ));
    }

    // Resolution is specified as a pair
    if (request.width == 0) != (request.height == 0) {
        return Err(anyhow::anyhow!(
            "Stream {} must specify both width and height or neither (got {}x{})",
            request.kind,
            request.width,
            request.height
        ));
    }

    Ok(())
}

/// Validate a device serial selector
pub fn validate_serial(serial: &str) -> Result<()> {
    if serial.is_empty() {
        return Err(anyhow::anyhow!("Device serial cannot be empty"));
    }
    if serial.len() > MAX_SERIAL_LEN {
        return Err(anyhow::anyhow!(
            "Device serial too long: maximum {} characters allowed, got {}",
            MAX_SERIAL_LEN,
            serial.len()
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.');
    if !serial.chars().all(valid_chars) {
        return Err(anyhow::anyhow!(
            "Device serial '{}' contains invalid characters. Only alphanumeric, underscore, dash and dot are allowed",
            serial
        ));
    }

    Ok(())
}
