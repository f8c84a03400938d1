use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the WebM converter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Directory where converted files are written and listed from
    pub output_dir: PathBuf,
    /// Directory holding persistent state (the original-size ledger)
    pub state_dir: PathBuf,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Suffix appended to the input stem when deriving an output name
    pub output_suffix: String,
    /// Minimum interval between progress notifications, in milliseconds
    pub progress_interval_ms: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConverterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            output_dir: PathBuf::from("/tmp/webmconv/output"),
            state_dir: PathBuf::from("/tmp/webmconv/state"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            output_suffix: "_converted".to_string(),
            progress_interval_ms: 200,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Location of the persisted original-size ledger
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join(crate::ledger::LEDGER_RECORD_NAME)
    }

    /// Derive `<output_dir>/<stem><suffix>.webm` for an input file
    pub fn output_path_for(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        self.output_dir.join(format!("{}{}.webm", stem, self.output_suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = ConverterConfig::load_config(Some(Path::new("/nonexistent/webmconv.toml"))).unwrap();
        assert_eq!(cfg.progress_interval_ms, 200);
        assert_eq!(cfg.ffmpeg_bin, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "output_dir = \"/srv/webm\"\nprogress_interval_ms = 500\n").unwrap();

        let cfg = ConverterConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.output_dir, PathBuf::from("/srv/webm"));
        assert_eq!(cfg.progress_interval_ms, 500);
        assert_eq!(cfg.output_suffix, "_converted");
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"ffmpeg_bin": "/opt/ffmpeg/bin/ffmpeg"}"#).unwrap();

        let cfg = ConverterConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.ffmpeg_bin, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(ConverterConfig::load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_output_path_for() {
        let cfg = ConverterConfig {
            output_dir: PathBuf::from("/out"),
            ..Default::default()
        };
        assert_eq!(
            cfg.output_path_for(Path::new("/videos/holiday.clip.mp4")),
            PathBuf::from("/out/holiday.clip_converted.webm")
        );
    }
}
