use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::ffprobe::UNKNOWN_FRAMES;

/// Lifecycle of a conversion job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

/// One accepted request to transcode one input file to one output file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    /// Probed frame count, -1 when unknown
    pub total_frames: i64,
    pub last_frame_seen: i64,
    /// Input size captured at start; reported on success regardless of later changes
    pub original_size_bytes: u64,
}

impl Job {
    pub fn new(input_path: PathBuf, output_path: PathBuf, original_size_bytes: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            input_path,
            output_path,
            state: JobState::Starting,
            started_at: Utc::now(),
            total_frames: UNKNOWN_FRAMES,
            last_frame_seen: 0,
            original_size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new(PathBuf::from("/in.mp4"), PathBuf::from("/out.webm"), 42);
        assert_eq!(job.state, JobState::Starting);
        assert_eq!(job.total_frames, UNKNOWN_FRAMES);
        assert_eq!(job.original_size_bytes, 42);
        assert!(Uuid::parse_str(&job.id).is_ok());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Idle.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }
}
