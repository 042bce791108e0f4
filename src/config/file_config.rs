use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub media_path: Option<String>,
    pub scratch_dir: Option<String>,
    pub port: Option<u16>,
    pub ffmpeg_bin: Option<String>,
    pub ffprobe_bin: Option<String>,

    // Feature configs
    pub pipeline: Option<PipelineConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    /// Quality keys to produce, e.g. ["320kbps", "128kbps"]
    pub qualities: Option<Vec<String>>,
    /// Keys whose completion is required for READY. Defaults to all qualities.
    pub required_keys: Option<Vec<String>>,
    pub preview_start_secs: Option<f64>,
    pub preview_duration_secs: Option<f64>,
    pub preview_bitrate_kbps: Option<u32>,
    pub waveform_sample_count: Option<usize>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub transcode_timeout_secs: Option<u64>,
    pub max_output_bytes: Option<u64>,
    pub max_upload_bytes: Option<u64>,
    pub max_duration_secs: Option<f64>,
    pub accepted_formats: Option<Vec<String>>,
    pub default_lane_workers: Option<usize>,
    pub low_lane_workers: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
