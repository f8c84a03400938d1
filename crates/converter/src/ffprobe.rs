use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Frame rate assumed when the container does not expose one
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Sentinel frame count meaning "no frame-based estimate"
pub const UNKNOWN_FRAMES: i64 = -1;

/// Approximate timing metadata for an input file
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Derived frame count, or [`UNKNOWN_FRAMES`]
    pub frame_count: i64,
    pub duration_ms: i64,
    pub frame_rate: f64,
}

impl Metadata {
    /// Build metadata from duration and frame rate, deriving the frame count
    pub fn from_duration(duration_ms: i64, frame_rate: Option<f64>) -> Self {
        let frame_rate = frame_rate
            .filter(|f| f.is_finite() && *f > 0.0)
            .unwrap_or(DEFAULT_FRAME_RATE);
        let duration_ms = duration_ms.max(0);
        let frames = (duration_ms as f64 * frame_rate / 1000.0).floor() as i64;

        Self {
            frame_count: if frames > 0 { frames } else { UNKNOWN_FRAMES },
            duration_ms,
            frame_rate,
        }
    }
}

/// Source of input metadata. `None` means frame-based progress is unavailable.
#[async_trait]
pub trait MetadataProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Option<Metadata>;
}

/// Subset of ffprobe's JSON output needed for timing
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub codec_type: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub r_frame_rate: Option<String>,
    pub duration: Option<String>,
}

impl FFProbeData {
    fn video_stream(&self) -> Option<&FFProbeStream> {
        self.streams.iter().find(|s| s.codec_type.as_deref() == Some("video"))
    }

    /// Container duration, falling back to the video stream's duration
    pub fn duration_ms(&self) -> Option<i64> {
        self.format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .or_else(|| self.video_stream().and_then(|s| s.duration.as_deref()))
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(|secs| (secs * 1000.0) as i64)
    }

    pub fn frame_rate(&self) -> Option<f64> {
        let stream = self.video_stream()?;
        stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
    }

    pub fn to_metadata(&self) -> Metadata {
        Metadata::from_duration(self.duration_ms().unwrap_or(0), self.frame_rate())
    }
}

/// Parse a frame rate string ("30/1", "29.97", "60"); `None` for "0/0" and nonsense
pub fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    let s = frame_rate_str.trim();

    if let Some((num, den)) = s.split_once('/') {
        let num = num.trim().parse::<f64>().ok()?;
        let den = den.trim().parse::<f64>().ok()?;
        if den == 0.0 || num <= 0.0 {
            return None;
        }
        return Some(num / den).filter(|f| f.is_finite());
    }

    s.parse::<f64>().ok().filter(|&f| f > 0.0 && f < 1000.0)
}

/// Probe backed by a local ffprobe binary
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe_bin: PathBuf,
}

impl FfprobeProbe {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self { ffprobe_bin: ffprobe_bin.into() }
    }

    /// Run ffprobe and parse its JSON output
    pub async fn probe_file(&self, file_path: &Path) -> Result<FFProbeData> {
        if !file_path.exists() {
            anyhow::bail!("File does not exist: {}", file_path.display());
        }

        debug!("Executing FFprobe for: {}", file_path.display());

        // output() waits for the child and closes its pipes on every path
        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(file_path)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!(
                "Failed to execute FFprobe for: {}. Ensure FFprobe is installed and accessible at: {}",
                file_path.display(),
                self.ffprobe_bin.display()
            ))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "FFprobe failed (exit code {}) for {}: {}",
                output.status.code().unwrap_or(-1),
                file_path.display(),
                stderr.trim()
            );
        }

        let json_str = String::from_utf8(output.stdout)
            .context("FFprobe output is not valid UTF-8")?;

        serde_json::from_str(&json_str)
            .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))
    }
}

#[async_trait]
impl MetadataProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Option<Metadata> {
        match self.probe_file(path).await {
            Ok(data) => {
                let meta = data.to_metadata();
                debug!(
                    "Video metadata - Total Frames: {}, Duration: {}ms, FPS: {:.3}",
                    meta.frame_count, meta.duration_ms, meta.frame_rate
                );
                Some(meta)
            }
            Err(e) => {
                warn!("Metadata probe failed, frame-based progress disabled: {:#}", e);
                None
            }
        }
    }
}
