pub mod config;
pub mod events;
pub mod ffmpeg;
pub mod ffprobe;
pub mod job;
pub mod ledger;
pub mod library;
pub mod manager;
pub mod progress;

pub use config::ConverterConfig;
pub use events::{ChannelListener, ConversionListener, JobEvent};
pub use ffprobe::Metadata;
pub use job::{Job, JobState};
pub use ledger::{LedgerError, SizeLedger};
pub use library::OutputEntry;
pub use manager::{ConversionManager, ManagerOptions, StartError};
pub use progress::ProgressSample;
