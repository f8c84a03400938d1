use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use crate::progress::ProgressSample;

/// Number of stderr lines kept for failure diagnostics
const STDERR_TAIL_LINES: usize = 5;

/// How an encoder run ended, when it could be started at all
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderOutcome {
    Completed,
    Cancelled,
    Failed {
        exit_code: Option<i32>,
        diagnostic: String,
    },
}

/// Runs the external encoder for one job.
///
/// Implementations push telemetry into `telemetry` (dropping samples when it
/// is full is fine) and stop the encoder when `cancel` fires. An `Err` means
/// the encoder could not be launched or supervised.
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        args: Vec<String>,
        telemetry: mpsc::Sender<ProgressSample>,
        cancel: oneshot::Receiver<()>,
    ) -> Result<EncoderOutcome>;
}

/// Encoder thread count: one core left free, between 2 and 8 threads
pub fn thread_count(available_cores: usize) -> usize {
    available_cores.saturating_sub(1).clamp(2, 8)
}

/// Logical CPU count of this machine
pub fn available_cores() -> usize {
    let system = sysinfo::System::new_all();
    system.cpus().len().max(1)
}

/// Command builder for the fixed VP9/Opus WebM parameter set
pub struct CommandBuilder {
    threads: usize,
}

impl CommandBuilder {
    pub fn new(threads: usize) -> Self {
        CommandBuilder { threads }
    }

    /// Build the full encode command line (without the ffmpeg binary itself)
    pub fn build_webm_command(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let threads = self.threads.to_string();

        // Overwrite without prompting; machine-readable telemetry on stdout, logs on stderr
        push_args(&mut args, &["-hide_banner", "-nostdin", "-y"]);
        push_args(&mut args, &["-progress", "pipe:1", "-nostats"]);
        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        // Video: VP9, bitrate-bounded, latency over ratio
        push_args(&mut args, &["-c:v", "libvpx-vp9"]);
        push_args(&mut args, &["-deadline", "realtime", "-cpu-used", "4"]);
        push_args(&mut args, &["-b:v", "3M", "-maxrate", "6M", "-minrate", "2M"]);
        push_args(&mut args, &["-pix_fmt", "yuv420p"]);
        push_args(&mut args, &["-threads", threads.as_str()]);
        push_args(&mut args, &["-row-mt", "1", "-tile-columns", "2"]);
        push_args(&mut args, &["-auto-alt-ref", "1", "-lag-in-frames", "0"]);
        push_args(&mut args, &["-fps_mode", "cfr"]);

        // Audio: Opus VBR, 20 ms frames
        push_args(&mut args, &["-c:a", "libopus"]);
        push_args(&mut args, &["-b:a", "96k", "-vbr", "on"]);
        push_args(&mut args, &["-compression_level", "5"]);
        push_args(&mut args, &["-frame_duration", "20"]);
        push_args(&mut args, &["-application", "audio"]);

        push_args(&mut args, &["-f", "webm"]);
        args.push(output.to_string_lossy().to_string());

        args
    }
}

fn push_args(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

/// Incremental parser for ffmpeg `-progress` output.
///
/// ffmpeg writes `key=value` lines and closes each block with
/// `progress=continue` or `progress=end`; one sample is produced per block.
#[derive(Debug, Default)]
pub struct TelemetryParser {
    current: ProgressSample,
    have_out_time_us: bool,
}

impl TelemetryParser {
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressSample> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key.trim() {
            "frame" => {
                if let Ok(frame) = value.parse::<u64>() {
                    self.current.frame_number = frame;
                }
            }
            "total_size" => {
                if let Ok(bytes) = value.parse::<u64>() {
                    self.current.processed_bytes = bytes;
                }
            }
            "out_time_us" => {
                if let Some(ms) = parse_micros_as_ms(value) {
                    self.current.elapsed_ms = ms;
                    self.have_out_time_us = true;
                }
            }
            // Misnamed by ffmpeg: this one is microseconds too
            "out_time_ms" if !self.have_out_time_us => {
                if let Some(ms) = parse_micros_as_ms(value) {
                    self.current.elapsed_ms = ms;
                }
            }
            "bitrate" => {
                self.current.bitrate_kbps = value
                    .trim_end_matches("kbits/s")
                    .trim()
                    .parse::<f64>()
                    .unwrap_or(0.0);
            }
            "speed" => {
                self.current.speed = value.trim_end_matches('x').trim().parse::<f64>().unwrap_or(0.0);
            }
            "progress" => {
                self.have_out_time_us = false;
                return Some(self.current);
            }
            _ => {}
        }

        None
    }
}

fn parse_micros_as_ms(value: &str) -> Option<u64> {
    value.parse::<i64>().ok().map(|us| (us.max(0) / 1000) as u64)
}

/// Encoder backed by a local ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_bin: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>) -> Self {
        Self { ffmpeg_bin: ffmpeg_bin.into() }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        args: Vec<String>,
        telemetry: mpsc::Sender<ProgressSample>,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<EncoderOutcome> {
        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!(
                "Failed to spawn FFmpeg process at: {}. Ensure FFmpeg is installed and accessible.",
                self.ffmpeg_bin.display()
            ))?;

        let stdout = child.stdout.take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stdout"))?;
        let stderr = child.stderr.take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stderr"))?;

        let telemetry_handle = tokio::spawn(async move {
            let mut parser = TelemetryParser::default();
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(sample) = parser.feed_line(&line) {
                    // Lossy on purpose: a full queue means newer samples are coming
                    let _ = telemetry.try_send(sample);
                }
            }
        });

        let stderr_handle = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("ffmpeg: {}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let status = tokio::select! {
            status = child.wait() => Some(status.context("Failed to wait for FFmpeg process")?),
            Ok(()) = &mut cancel => None,
        };

        let outcome = match status {
            None => {
                info!("Cancellation requested, stopping FFmpeg");
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill FFmpeg process: {}", e);
                }
                EncoderOutcome::Cancelled
            }
            Some(status) if status.success() => EncoderOutcome::Completed,
            Some(status) => {
                let diagnostic = stderr_handle.await.unwrap_or_default();
                let _ = telemetry_handle.await;
                return Ok(EncoderOutcome::Failed {
                    exit_code: status.code(),
                    diagnostic: if diagnostic.trim().is_empty() {
                        format!("FFmpeg exited with status: {}", status)
                    } else {
                        diagnostic
                    },
                });
            }
        };

        let _ = telemetry_handle.await;
        let _ = stderr_handle.await;
        Ok(outcome)
    }
}
