pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod storage;
pub mod timing;

use std::path::{Path, PathBuf};

use capture::{Geometry, PixelFormat};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::storage::DatasetSpec;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "LABCAP";

/// Session configuration, built once at startup and passed by reference
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub frame_chunk_size: usize,
    pub preview_fps: f64,
    pub idle_poll_ms: u64,
    pub enqueue_poll_ms: u64,
    pub max_flush_failures: u32, // 0 = retry forever
    pub pin_threads: bool,       // CPU pinning of capture threads
    pub ready_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub sync_on_chunk: bool, // fsync every acknowledged chunk
}

/// Where a stream's frames come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CameraSource {
    Synthetic,
    V4l2 { device: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub source: CameraSource,
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
    pub fps: f64,
    /// Recording length; 0 records until stopped
    #[serde(default)]
    pub duration_secs: f64,
}

impl StreamConfig {
    pub fn geometry(&self) -> Geometry {
        Geometry::for_format(self.width, self.height, self.format)
    }

    /// `round(duration * fps)`; 0 for an open-ended stream
    pub fn frames_to_acquire(&self) -> u64 {
        if self.duration_secs <= 0.0 {
            return 0;
        }
        (self.duration_secs * self.fps).round() as u64
    }

    pub fn dataset_spec(&self) -> DatasetSpec {
        DatasetSpec::new(self.name.clone(), self.geometry())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
            streams: vec![
                StreamConfig {
                    name: "depth".into(),
                    source: CameraSource::Synthetic,
                    width: 512,
                    height: 424,
                    format: PixelFormat::Depth16,
                    fps: 30.0,
                    duration_secs: 10.0,
                },
                StreamConfig {
                    name: "gray".into(),
                    source: CameraSource::Synthetic,
                    width: 640,
                    height: 512,
                    format: PixelFormat::Gray8,
                    fps: 100.0,
                    duration_secs: 10.0,
                },
            ],
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: pipeline::DEFAULT_CAPACITY,
            frame_chunk_size: 50,
            preview_fps: 30.0,
            idle_poll_ms: 1,
            enqueue_poll_ms: 50,
            max_flush_failures: 8,
            pin_threads: false,
            ready_timeout_ms: 5_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("recording"),
            sync_on_chunk: true,
        }
    }
}

impl Config {
    /// Layer an optional TOML file under `LABCAP__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.is_empty() {
            return Err(ConfigError::Invalid("no streams configured".into()));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".into()));
        }
        if self.pipeline.frame_chunk_size == 0 {
            return Err(ConfigError::Invalid("frame_chunk_size must be positive".into()));
        }
        for (i, stream) in self.streams.iter().enumerate() {
            if stream.name.is_empty() {
                return Err(ConfigError::Invalid(format!("stream #{} has no name", i)));
            }
            if !storage::raw::is_plain_name(&stream.name) {
                return Err(ConfigError::Invalid(format!(
                    "stream name '{}' must not contain path separators or '..'",
                    stream.name
                )));
            }
            if self.streams[..i].iter().any(|s| s.name == stream.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stream name '{}'",
                    stream.name
                )));
            }
            if stream.fps.is_nan() || stream.fps <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "stream '{}' needs a positive fps",
                    stream.name
                )));
            }
            if stream.geometry().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stream '{}' has an empty frame size",
                    stream.name
                )));
            }
        }
        Ok(())
    }

    pub fn dataset_specs(&self) -> Vec<DatasetSpec> {
        self.streams.iter().map(StreamConfig::dataset_spec).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pipeline.queue_capacity, 100);
        assert_eq!(config.streams[0].frames_to_acquire(), 300);
        assert_eq!(config.dataset_specs()[1].geometry.bytes(), 640 * 512);
    }

    #[test]
    fn frames_to_acquire_rounds() {
        let mut stream = Config::default().streams.remove(0);
        stream.fps = 29.97;
        stream.duration_secs = 60.0;
        assert_eq!(stream.frames_to_acquire(), 1798);
        stream.duration_secs = 0.0;
        assert_eq!(stream.frames_to_acquire(), 0);
    }

    #[test]
    fn rejects_path_like_names() {
        for name in ["../x", "left/right", "a\\b"] {
            let mut config = Config::default();
            config.streams[0].name = name.into();
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut config = Config::default();
        config.streams[1].name = "depth".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
