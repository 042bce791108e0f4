mod file_config;

pub use file_config::{FileConfig, PipelineConfig};

use crate::intake::DEFAULT_ACCEPTED_FORMATS;
use crate::pipeline::{ArtifactKey, AudioQuality};
use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// Mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub media_path: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub port: u16,
    pub ffmpeg_bin: Option<String>,
    pub ffprobe_bin: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub media_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub port: u16,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,

    // Pipeline settings (with defaults)
    pub pipeline: PipelineSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        // Validate db_dir exists
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let media_path = file
            .media_path
            .map(PathBuf::from)
            .or_else(|| cli.media_path.clone())
            .unwrap_or_else(|| db_dir.clone());

        let scratch_dir = file
            .scratch_dir
            .map(PathBuf::from)
            .or_else(|| cli.scratch_dir.clone())
            .unwrap_or_else(std::env::temp_dir);

        let port = file.port.unwrap_or(cli.port);

        let ffmpeg_bin = file
            .ffmpeg_bin
            .or_else(|| cli.ffmpeg_bin.clone())
            .unwrap_or_else(|| "ffmpeg".to_string());
        let ffprobe_bin = file
            .ffprobe_bin
            .or_else(|| cli.ffprobe_bin.clone())
            .unwrap_or_else(|| "ffprobe".to_string());

        let pipeline = PipelineSettings::resolve(file.pipeline.unwrap_or_default())?;

        Ok(Self {
            db_dir,
            media_path,
            scratch_dir,
            port,
            ffmpeg_bin,
            ffprobe_bin,
            pipeline,
        })
    }

    pub fn pipeline_db_path(&self) -> PathBuf {
        self.db_dir.join("pipeline.db")
    }
}

/// Settings for the processing pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Quality renditions to produce for every track.
    pub qualities: Vec<AudioQuality>,
    /// Keys whose completion is required for the track to become READY.
    pub required_keys: Vec<ArtifactKey>,
    pub preview_start_secs: f64,
    pub preview_duration_secs: f64,
    pub preview_bitrate_kbps: u32,
    pub waveform_sample_count: usize,
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
    pub transcode_timeout_secs: u64,
    pub max_output_bytes: u64,
    pub max_upload_bytes: u64,
    pub max_duration_secs: f64,
    pub accepted_formats: Vec<String>,
    pub default_lane_workers: usize,
    pub low_lane_workers: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let qualities = vec![AudioQuality::Kbps320, AudioQuality::Kbps128];
        let required_keys = qualities.iter().map(|q| ArtifactKey::Quality(*q)).collect();
        Self {
            qualities,
            required_keys,
            preview_start_secs: 0.0,
            preview_duration_secs: 30.0,
            preview_bitrate_kbps: 128,
            waveform_sample_count: 200,
            max_attempts: 3,
            initial_backoff_secs: 5,
            max_backoff_secs: 300,
            backoff_multiplier: 2.0,
            transcode_timeout_secs: 120,
            max_output_bytes: 512 * 1024 * 1024,
            max_upload_bytes: 256 * 1024 * 1024,
            max_duration_secs: 7200.0,
            accepted_formats: DEFAULT_ACCEPTED_FORMATS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_lane_workers: 4,
            low_lane_workers: 1,
        }
    }
}

impl PipelineSettings {
    /// Merge file config over the defaults.
    fn resolve(file: PipelineConfig) -> Result<Self> {
        let defaults = Self::default();

        let qualities = match file.qualities {
            Some(names) => {
                let mut parsed = Vec::with_capacity(names.len());
                for name in &names {
                    match AudioQuality::parse(name) {
                        Some(q) => parsed.push(q),
                        None => bail!("Unknown quality in config: {}", name),
                    }
                }
                if parsed.is_empty() {
                    bail!("pipeline.qualities must not be empty");
                }
                parsed
            }
            None => defaults.qualities,
        };

        let required_keys = match file.required_keys {
            Some(names) => {
                let mut parsed = Vec::with_capacity(names.len());
                for name in &names {
                    match ArtifactKey::parse(name) {
                        Some(key) => parsed.push(key),
                        None => bail!("Unknown artifact key in config: {}", name),
                    }
                }
                parsed
            }
            None => qualities.iter().map(|q| ArtifactKey::Quality(*q)).collect(),
        };

        // A required quality must also be produced
        for key in &required_keys {
            if let ArtifactKey::Quality(q) = key {
                if !qualities.contains(q) {
                    bail!("Required key {} is not among configured qualities", key);
                }
            }
        }

        Ok(Self {
            qualities,
            required_keys,
            preview_start_secs: file.preview_start_secs.unwrap_or(defaults.preview_start_secs),
            preview_duration_secs: file
                .preview_duration_secs
                .unwrap_or(defaults.preview_duration_secs),
            preview_bitrate_kbps: file
                .preview_bitrate_kbps
                .unwrap_or(defaults.preview_bitrate_kbps),
            waveform_sample_count: file
                .waveform_sample_count
                .unwrap_or(defaults.waveform_sample_count),
            max_attempts: file.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff_secs: file
                .initial_backoff_secs
                .unwrap_or(defaults.initial_backoff_secs),
            max_backoff_secs: file.max_backoff_secs.unwrap_or(defaults.max_backoff_secs),
            backoff_multiplier: file
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            transcode_timeout_secs: file
                .transcode_timeout_secs
                .unwrap_or(defaults.transcode_timeout_secs),
            max_output_bytes: file.max_output_bytes.unwrap_or(defaults.max_output_bytes),
            max_upload_bytes: file.max_upload_bytes.unwrap_or(defaults.max_upload_bytes),
            max_duration_secs: file.max_duration_secs.unwrap_or(defaults.max_duration_secs),
            accepted_formats: file.accepted_formats.unwrap_or(defaults.accepted_formats),
            default_lane_workers: file
                .default_lane_workers
                .unwrap_or(defaults.default_lane_workers),
            low_lane_workers: file.low_lane_workers.unwrap_or(defaults.low_lane_workers),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            media_path: Some(PathBuf::from("/media")),
            scratch_dir: None,
            port: 3001,
            ffmpeg_bin: Some("/usr/bin/ffmpeg".to_string()),
            ffprobe_bin: None,
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.media_path, PathBuf::from("/media"));
        assert_eq!(config.port, 3001);
        assert_eq!(config.ffmpeg_bin, "/usr/bin/ffmpeg");
        assert_eq!(config.ffprobe_bin, "ffprobe");
        assert_eq!(config.pipeline.max_attempts, 3);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            media_path: Some(PathBuf::from("/cli/media")),
            port: 3001,
            ..Default::default()
        };

        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            media_path: Some("/toml/media".to_string()),
            port: Some(4000),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.media_path, PathBuf::from("/toml/media"));
        assert_eq!(config.port, 4000);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_media_path_defaults_to_db_dir() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            media_path: None,
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.media_path, temp_dir.path());
    }

    #[test]
    fn test_db_path_helper() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.pipeline_db_path(), temp_dir.path().join("pipeline.db"));
    }

    #[test]
    fn test_pipeline_defaults() {
        let settings = PipelineSettings::default();
        assert_eq!(
            settings.qualities,
            vec![AudioQuality::Kbps320, AudioQuality::Kbps128]
        );
        // Required = all qualities; preview and waveform are advisory
        assert_eq!(
            settings.required_keys,
            vec![
                ArtifactKey::Quality(AudioQuality::Kbps320),
                ArtifactKey::Quality(AudioQuality::Kbps128),
            ]
        );
        assert_eq!(settings.preview_duration_secs, 30.0);
        assert_eq!(settings.waveform_sample_count, 200);
    }

    #[test]
    fn test_pipeline_config_parsing() {
        let file = PipelineConfig {
            qualities: Some(vec!["320kbps".to_string()]),
            required_keys: Some(vec!["320kbps".to_string(), "preview".to_string()]),
            max_attempts: Some(5),
            ..Default::default()
        };

        let settings = PipelineSettings::resolve(file).unwrap();
        assert_eq!(settings.qualities, vec![AudioQuality::Kbps320]);
        assert_eq!(
            settings.required_keys,
            vec![
                ArtifactKey::Quality(AudioQuality::Kbps320),
                ArtifactKey::Preview,
            ]
        );
        assert_eq!(settings.max_attempts, 5);
    }

    #[test]
    fn test_pipeline_config_unknown_quality() {
        let file = PipelineConfig {
            qualities: Some(vec!["64kbps".to_string()]),
            ..Default::default()
        };
        assert!(PipelineSettings::resolve(file).is_err());
    }

    #[test]
    fn test_pipeline_config_required_not_produced() {
        let file = PipelineConfig {
            qualities: Some(vec!["320kbps".to_string()]),
            required_keys: Some(vec!["128kbps".to_string()]),
            ..Default::default()
        };
        assert!(PipelineSettings::resolve(file).is_err());
    }

    #[test]
    fn test_pipeline_config_empty_qualities() {
        let file = PipelineConfig {
            qualities: Some(vec![]),
            ..Default::default()
        };
        assert!(PipelineSettings::resolve(file).is_err());
    }

    #[test]
    fn test_file_config_toml_parsing() {
        let toml_str = r#"
            db_dir = "/data"
            port = 8080

            [pipeline]
            qualities = ["320kbps", "128kbps"]
            max_attempts = 4
            preview_duration_secs = 20.0
        "#;
        let file: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(file.db_dir.as_deref(), Some("/data"));
        assert_eq!(file.port, Some(8080));

        let pipeline = file.pipeline.unwrap();
        assert_eq!(pipeline.max_attempts, Some(4));
        assert_eq!(pipeline.preview_duration_secs, Some(20.0));
    }
}
