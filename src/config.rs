//! Stream and pipeline configuration
//!
//! Configuration files are JSON. Unset per-stream fields inherit the
//! pipeline-wide values, which in turn fall back to the defaults below.

use crate::capability::AcceleratorKind;
use crate::decoder::CodecKind;
use crate::packet_queue::DEFAULT_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_PATH_VAR: &str = "CAMDECODE_CONFIG";

const DEFAULT_FRAME_INTERVAL_MS: u64 = 2000;
const DEFAULT_HW_ACCEL_KIND: &str = "vaapi";
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;
const DEFAULT_MAX_TRANSIENT_ERRORS: u32 = 30;
const DEFAULT_SOURCE_FPS: u32 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error("{CONFIG_PATH_VAR} is not set")]
    MissingPath,
}

/// Camera stream quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum VideoQuality {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
}

impl TryFrom<u8> for VideoQuality {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(VideoQuality::Low),
            2 => Ok(VideoQuality::Medium),
            3 => Ok(VideoQuality::High),
            other => Err(format!("quality must be 1, 2 or 3, got {}", other)),
        }
    }
}

impl From<VideoQuality> for u8 {
    fn from(quality: VideoQuality) -> Self {
        quality as u8
    }
}

/// Resolved per-camera settings
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub stream_id: String,
    pub codec: CodecKind,
    pub enable_hw_accel: bool,
    pub hw_accel_kind: AcceleratorKind,
    /// Accelerator device node, `None` to use the default nodes
    pub device_hint: Option<PathBuf>,
    pub sample_interval_ms: u64,
    pub quality: VideoQuality,
    pub queue_capacity: usize,
    /// Consecutive transient errors tolerated before the context is
    /// considered broken
    pub max_transient_errors: u32,
    /// Annex-B file to read packets from (CLI only)
    pub source: Option<PathBuf>,
    /// Rate at which the CLI feeds `source`
    pub source_fps: u32,
}

impl StreamConfig {
    pub fn new(stream_id: impl Into<String>, codec: CodecKind) -> Self {
        Self {
            stream_id: stream_id.into(),
            codec,
            enable_hw_accel: true,
            hw_accel_kind: AcceleratorKind::from_name(DEFAULT_HW_ACCEL_KIND),
            device_hint: None,
            sample_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            quality: VideoQuality::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_transient_errors: DEFAULT_MAX_TRANSIENT_ERRORS,
            source: None,
            source_fps: DEFAULT_SOURCE_FPS,
        }
    }

    pub fn with_hw_accel(mut self, enabled: bool) -> Self {
        self.enable_hw_accel = enabled;
        self
    }

    pub fn with_device(mut self, device: impl Into<PathBuf>) -> Self {
        self.device_hint = Some(device.into());
        self
    }

    pub fn with_sample_interval(mut self, interval_ms: u64) -> Self {
        self.sample_interval_ms = interval_ms;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_transient_errors(mut self, max: u32) -> Self {
        self.max_transient_errors = max;
        self
    }
}

#[derive(Debug, Deserialize)]
struct StreamConfigFile {
    stream_id: String,
    codec: CodecKind,
    enable_hw_accel: Option<bool>,
    hw_accel_kind: Option<String>,
    device_hint: Option<PathBuf>,
    sample_interval_ms: Option<u64>,
    quality: Option<VideoQuality>,
    queue_capacity: Option<usize>,
    max_transient_errors: Option<u32>,
    source: Option<PathBuf>,
    source_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    frame_interval: Option<u64>,
    enable_hw_accel: Option<bool>,
    hw_accel_kind: Option<String>,
    hw_device: Option<PathBuf>,
    default_quality: Option<u8>,
    #[serde(default)]
    camera_qualities: HashMap<String, u8>,
    probe_timeout_ms: Option<u64>,
    third_party_dir: Option<PathBuf>,
    #[serde(default)]
    streams: Vec<StreamConfigFile>,
}

/// Resolved process-wide configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub frame_interval_ms: u64,
    pub enable_hw_accel: bool,
    pub hw_accel_kind: AcceleratorKind,
    pub hw_device: Option<PathBuf>,
    pub default_quality: VideoQuality,
    pub camera_qualities: HashMap<String, VideoQuality>,
    pub probe_timeout: Duration,
    pub third_party_dir: Option<PathBuf>,
    pub streams: Vec<StreamConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            enable_hw_accel: true,
            hw_accel_kind: AcceleratorKind::from_name(DEFAULT_HW_ACCEL_KIND),
            hw_device: None,
            default_quality: VideoQuality::default(),
            camera_qualities: HashMap::new(),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            third_party_dir: None,
            streams: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Load from the file named by `CAMDECODE_CONFIG`
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_VAR).ok_or(ConfigError::MissingPath)?;
        Self::load(Path::new(&path))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&raw)?;
        log::info!(
            "Loaded config {} with {} stream(s)",
            path.display(),
            config.streams.len()
        );
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let file: PipelineConfigFile = serde_json::from_str(raw)?;
        Self::resolve(file)
    }

    fn resolve(file: PipelineConfigFile) -> Result<Self, ConfigError> {
        let defaults = PipelineConfig::default();

        let default_quality = match file.default_quality {
            Some(value) => VideoQuality::try_from(value).map_err(ConfigError::Invalid)?,
            None => defaults.default_quality,
        };

        let mut camera_qualities = HashMap::new();
        for (camera, value) in file.camera_qualities {
            let quality = VideoQuality::try_from(value)
                .map_err(|e| ConfigError::Invalid(format!("camera {}: {}", camera, e)))?;
            camera_qualities.insert(camera, quality);
        }

        let mut config = PipelineConfig {
            frame_interval_ms: file.frame_interval.unwrap_or(defaults.frame_interval_ms),
            enable_hw_accel: file.enable_hw_accel.unwrap_or(defaults.enable_hw_accel),
            hw_accel_kind: file
                .hw_accel_kind
                .as_deref()
                .map(AcceleratorKind::from_name)
                .unwrap_or(defaults.hw_accel_kind),
            hw_device: file.hw_device,
            default_quality,
            camera_qualities,
            probe_timeout: file
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            third_party_dir: file.third_party_dir,
            streams: Vec::new(),
        };

        let mut seen = std::collections::HashSet::new();
        for stream in file.streams {
            if stream.stream_id.is_empty() {
                return Err(ConfigError::Invalid("stream_id must not be empty".into()));
            }
            if !seen.insert(stream.stream_id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stream_id {}",
                    stream.stream_id
                )));
            }
            let resolved = config.resolve_stream(stream);
            config.streams.push(resolved);
        }

        Ok(config)
    }

    fn resolve_stream(&self, file: StreamConfigFile) -> StreamConfig {
        let quality = file
            .quality
            .unwrap_or_else(|| self.quality_for(&file.stream_id));
        StreamConfig {
            codec: file.codec,
            enable_hw_accel: file.enable_hw_accel.unwrap_or(self.enable_hw_accel),
            hw_accel_kind: file
                .hw_accel_kind
                .as_deref()
                .map(AcceleratorKind::from_name)
                .unwrap_or(self.hw_accel_kind),
            device_hint: file.device_hint.or_else(|| self.hw_device.clone()),
            sample_interval_ms: file.sample_interval_ms.unwrap_or(self.frame_interval_ms),
            quality,
            queue_capacity: file.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            max_transient_errors: file
                .max_transient_errors
                .unwrap_or(DEFAULT_MAX_TRANSIENT_ERRORS),
            source: file.source,
            source_fps: file.source_fps.unwrap_or(DEFAULT_SOURCE_FPS).max(1),
            stream_id: file.stream_id,
        }
    }

    /// Quality configured for a camera, or the default tier
    pub fn quality_for(&self, camera: &str) -> VideoQuality {
        self.camera_qualities
            .get(camera)
            .copied()
            .unwrap_or(self.default_quality)
    }
}
