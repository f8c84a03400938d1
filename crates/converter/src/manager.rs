use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use crate::config::ConverterConfig;
use crate::events::{ConversionListener, EventDispatcher, EventSender, JobEvent};
use crate::ffmpeg::{available_cores, thread_count, CommandBuilder, Encoder, EncoderOutcome, FfmpegEncoder};
use crate::ffprobe::{FfprobeProbe, MetadataProbe, UNKNOWN_FRAMES};
use crate::job::{Job, JobState};
use crate::ledger::SizeLedger;
use crate::progress::{ProgressEstimator, ProgressUpdate, DEFAULT_THROTTLE};

/// Longest diagnostic carried in a failure notification, in characters
pub const FAILURE_DIAGNOSTIC_LIMIT: usize = 200;

const TELEMETRY_QUEUE: usize = 64;

/// Reasons a `start` request is refused. No job exists and no events are emitted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("Input file does not exist: {}", .0.display())]
    InputNotFound(PathBuf),
    #[error("Conversion already in progress")]
    AlreadyRunning,
    #[error("Cancelled job for {} is still cleaning up", .0.display())]
    CleanupPending(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Minimum spacing between progress notifications
    pub progress_interval: Duration,
    /// Thread count handed to the encoder
    pub encoder_threads: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_THROTTLE,
            encoder_threads: thread_count(available_cores()),
        }
    }
}

struct ActiveJob {
    seq: u64,
    job: Job,
    cancel: Option<oneshot::Sender<()>>,
}

struct Shared {
    busy: AtomicU64,
    next_seq: AtomicU64,
    active: Mutex<Option<ActiveJob>>,
    cleanup_pending: Mutex<HashSet<PathBuf>>,
    ledger: Arc<Mutex<SizeLedger>>,
    probe: Arc<dyn MetadataProbe>,
    encoder: Arc<dyn Encoder>,
    commands: CommandBuilder,
    events: EventSender,
    progress_interval: Duration,
}

/// The conversion state machine:
/// `Idle → Starting → Running → {Succeeded | Failed | Cancelled} → Idle`.
///
/// At most one job runs at a time. The busy guard holds the owning job's
/// sequence number (0 when idle). `start` claims it with a compare-and-swap;
/// `cancel` and the completion path release it only while they still own it.
pub struct ConversionManager {
    shared: Arc<Shared>,
    dispatcher: EventDispatcher,
}

impl ConversionManager {
    /// Create a manager delivering events to `listener`. Must be called within a tokio runtime.
    pub fn new(
        listener: Arc<dyn ConversionListener>,
        ledger: Arc<Mutex<SizeLedger>>,
        probe: Arc<dyn MetadataProbe>,
        encoder: Arc<dyn Encoder>,
        options: ManagerOptions,
    ) -> Self {
        let dispatcher = EventDispatcher::spawn(listener);
        let shared = Shared {
            busy: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            active: Mutex::new(None),
            cleanup_pending: Mutex::new(HashSet::new()),
            ledger,
            probe,
            encoder,
            commands: CommandBuilder::new(options.encoder_threads),
            events: dispatcher.sender(),
            // interval() rejects a zero period
            progress_interval: options.progress_interval.max(Duration::from_millis(1)),
        };

        Self {
            shared: Arc::new(shared),
            dispatcher,
        }
    }

    /// Manager wired to local ffmpeg/ffprobe binaries and the on-disk ledger
    pub fn from_config(cfg: &ConverterConfig, listener: Arc<dyn ConversionListener>) -> Self {
        let ledger = SizeLedger::load(cfg.ledger_path()).unwrap_or_else(|e| {
            warn!("Starting with an empty ledger: {}", e);
            SizeLedger::new(cfg.ledger_path())
        });
        let options = ManagerOptions {
            progress_interval: Duration::from_millis(cfg.progress_interval_ms),
            ..Default::default()
        };
        info!("Using {} encoder threads", options.encoder_threads);

        Self::new(
            listener,
            Arc::new(Mutex::new(ledger)),
            Arc::new(FfprobeProbe::new(&cfg.ffprobe_bin)),
            Arc::new(FfmpegEncoder::new(&cfg.ffmpeg_bin)),
            options,
        )
    }

    /// Accept a conversion job and hand it to a background task.
    ///
    /// Returns the job id as soon as the job is accepted; nothing here waits on
    /// the probe or the encoder. Everything after acceptance, including output
    /// preparation and launch failures, is reported through the listener.
    pub fn start(&self, input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<String, StartError> {
        let input = input.as_ref();
        let output = output.as_ref().to_path_buf();
        let shared = &self.shared;

        let original_size = match fs::metadata(input) {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(StartError::InputNotFound(input.to_path_buf())),
        };

        if shared.cleanup_pending.lock().contains(&output) {
            warn!("Refusing to start: cancelled job for {} still cleaning up", output.display());
            return Err(StartError::CleanupPending(output));
        }

        let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        if shared.busy.compare_exchange(0, seq, Ordering::AcqRel, Ordering::Acquire).is_err() {
            warn!("Conversion already in progress");
            return Err(StartError::AlreadyRunning);
        }
        let started = Instant::now();

        let job = Job::new(input.to_path_buf(), output.clone(), original_size);
        if let Err(e) = shared.ledger.lock().put(&output, original_size) {
            warn!("Original size not recorded: {}", e);
        }
        *shared.active.lock() = Some(ActiveJob { seq, job: job.clone(), cancel: None });

        let id = job.id.clone();
        info!("Accepted job {}: {} -> {}", id, input.display(), output.display());
        tokio::spawn(run_job(Arc::clone(shared), seq, job, started));

        Ok(id)
    }

    /// Ask the running encoder to stop. No-op unless a job is Running.
    ///
    /// The busy guard is released immediately; deleting the partial output and
    /// the `Cancelled` notification follow once the encoder has stopped.
    pub fn cancel(&self) -> bool {
        let shared = &self.shared;
        let mut active = shared.active.lock();

        let Some(current) = active.as_mut().filter(|a| a.job.state == JobState::Running) else {
            debug!("Cancel requested with no running job");
            return false;
        };

        let seq = current.seq;
        if let Some(tx) = current.cancel.take() {
            let _ = tx.send(());
        }
        shared.cleanup_pending.lock().insert(current.job.output_path.clone());
        info!("Cancelling job {}", current.job.id);

        *active = None;
        drop(active);
        shared.release(seq);
        true
    }

    pub fn state(&self) -> JobState {
        self.shared
            .active
            .lock()
            .as_ref()
            .map(|a| a.job.state)
            .unwrap_or(JobState::Idle)
    }

    /// Snapshot of the job currently owned by the manager
    pub fn current_job(&self) -> Option<Job> {
        self.shared.active.lock().as_ref().map(|a| a.job.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire) != 0
    }

    pub fn ledger(&self) -> Arc<Mutex<SizeLedger>> {
        Arc::clone(&self.shared.ledger)
    }

    /// Stop accepting work and wait until every queued event has been delivered,
    /// including those of a job still running in the background
    pub async fn shutdown(self) {
        let ConversionManager { shared, dispatcher } = self;
        drop(shared);
        dispatcher.shutdown().await;
    }
}

impl Shared {
    fn update_active(&self, seq: u64, f: impl FnOnce(&mut ActiveJob)) {
        if let Some(active) = self.active.lock().as_mut().filter(|a| a.seq == seq) {
            f(active);
        }
    }

    /// Release the busy guard if `seq` still owns it
    fn release(&self, seq: u64) {
        let _ = self.busy.compare_exchange(seq, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    fn report_progress(&self, seq: u64, update: ProgressUpdate) {
        let mut active = self.active.lock();
        // Cancelled jobs are no longer active; their progress is not interesting
        let Some(current) = active.as_mut().filter(|a| a.seq == seq) else {
            return;
        };
        current.job.last_frame_seen = update.current_frame;
        self.events.emit(JobEvent::Progress {
            percent: update.percent,
            current_frame: update.current_frame,
            total_frames: update.total_frames,
        });
    }

    /// Retire the job and queue its terminal event. The output path leaves the
    /// cleanup set under the same lock `cancel` inserts it with.
    fn finish(&self, seq: u64, output: &Path, state: JobState, event: JobEvent) {
        let mut active = self.active.lock();
        if let Some(current) = active.as_mut().filter(|a| a.seq == seq) {
            current.job.state = state;
            info!("Job {} finished: {:?}", current.job.id, state);
            *active = None;
        }
        self.cleanup_pending.lock().remove(output);
        drop(active);
        self.events.emit(event);
    }

    fn complete(&self, seq: u64, job: &Job, result: Result<EncoderOutcome>) {
        // A new job may start whatever happens while reporting this one
        self.release(seq);
        let output = job.output_path.as_path();

        let (state, event) = match result {
            Ok(EncoderOutcome::Cancelled) => {
                info!("Conversion cancelled: {}", job.id);
                remove_partial_output(output);
                (JobState::Cancelled, JobEvent::Cancelled)
            }
            Ok(EncoderOutcome::Completed) => match fs::metadata(output) {
                Ok(meta) if meta.is_file() => {
                    info!(
                        "Conversion successful: {} ({} -> {} bytes)",
                        output.display(), job.original_size_bytes, meta.len()
                    );
                    (JobState::Succeeded, JobEvent::Succeeded {
                        output_path: output.to_path_buf(),
                        original_size: job.original_size_bytes,
                        new_size: meta.len(),
                    })
                }
                _ => {
                    error!("Encoder reported success but output is missing: {}", output.display());
                    (JobState::Failed, JobEvent::Failed {
                        message: format!("Output file was not created: {}", output.display()),
                    })
                }
            },
            Ok(EncoderOutcome::Failed { exit_code, diagnostic }) => {
                error!("Conversion failed (exit code {:?}): {}", exit_code, diagnostic);
                remove_partial_output(output);
                (JobState::Failed, JobEvent::Failed {
                    message: format!("Conversion failed: {}", truncate_chars(&diagnostic, FAILURE_DIAGNOSTIC_LIMIT)),
                })
            }
            Err(e) => {
                error!("Conversion error: {:#}", e);
                remove_partial_output(output);
                (JobState::Failed, JobEvent::Failed {
                    message: format!("Conversion error: {}", truncate_chars(&format!("{:#}", e), FAILURE_DIAGNOSTIC_LIMIT)),
                })
            }
        };

        self.finish(seq, output, state, event);
    }
}

/// Background half of a job: persist the ledger, probe, prepare the output,
/// then supervise the encoder. Reports exactly one terminal outcome.
async fn run_job(shared: Arc<Shared>, seq: u64, mut job: Job, started: Instant) {
    persist_ledger(&shared.ledger).await;

    job.total_frames = shared
        .probe
        .probe(&job.input_path)
        .await
        .map(|meta| meta.frame_count)
        .unwrap_or(UNKNOWN_FRAMES);
    shared.update_active(seq, |active| active.job.total_frames = job.total_frames);

    info!(
        "Starting job {}: {} bytes, {} frames",
        job.id, job.original_size_bytes, job.total_frames
    );
    shared.events.emit(JobEvent::Started {
        original_size: job.original_size_bytes,
        total_frames: job.total_frames,
    });

    if let Err(e) = prepare_output(&job.output_path) {
        error!("Job {}: {:#}", job.id, e);
        shared.release(seq);
        shared.finish(seq, &job.output_path, JobState::Failed, JobEvent::Failed {
            message: format!("Failed to prepare output file: {}", truncate_chars(&format!("{:#}", e), FAILURE_DIAGNOSTIC_LIMIT)),
        });
        return;
    }

    let (cancel_tx, cancel_rx) = oneshot::channel();
    job.state = JobState::Running;
    shared.update_active(seq, |active| {
        active.job.state = JobState::Running;
        active.cancel = Some(cancel_tx);
    });

    let args = shared.commands.build_webm_command(&job.input_path, &job.output_path);
    let result = supervise(&shared, seq, &job, args, cancel_rx, started).await;
    shared.complete(seq, &job, result);
}

/// Run the encoder, turning telemetry and timer ticks into throttled progress
async fn supervise(
    shared: &Shared,
    seq: u64,
    job: &Job,
    args: Vec<String>,
    cancel: oneshot::Receiver<()>,
    started: Instant,
) -> Result<EncoderOutcome> {
    let (telemetry_tx, mut telemetry_rx) = mpsc::channel(TELEMETRY_QUEUE);
    let mut estimator = ProgressEstimator::new(
        job.total_frames,
        job.original_size_bytes,
        started,
        shared.progress_interval,
    );

    let mut ticker = tokio::time::interval(shared.progress_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut encode = shared.encoder.encode(args, telemetry_tx, cancel);
    let mut telemetry_open = true;

    let result = loop {
        tokio::select! {
            result = &mut encode => break result,
            sample = telemetry_rx.recv(), if telemetry_open => match sample {
                Some(sample) => {
                    if let Some(update) = estimator.on_sample(sample, Instant::now()) {
                        shared.report_progress(seq, update);
                    }
                }
                None => telemetry_open = false,
            },
            _ = ticker.tick() => {
                if let Some(update) = estimator.on_tick(Instant::now()) {
                    shared.report_progress(seq, update);
                }
            }
        }
    };

    debug!("Job {} last progress: {}", job.id, estimator.description());
    result
}

/// Write the ledger off the async workers; a failed save only costs the
/// compression report after a restart
async fn persist_ledger(ledger: &Arc<Mutex<SizeLedger>>) {
    let ledger = Arc::clone(ledger);
    match tokio::task::spawn_blocking(move || ledger.lock().save()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Failed to persist ledger: {}", e),
        Err(e) => warn!("Ledger save task failed: {}", e),
    }
}

/// Ensure the output directory exists and no stale output is in the way
fn prepare_output(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }

    match fs::remove_file(output) {
        Ok(()) => {
            debug!("Deleted existing output file: {}", output.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e)
            .with_context(|| format!("Failed to delete existing output file: {}", output.display())),
    }
}

/// Best effort: a leftover partial file is not worth failing over
fn remove_partial_output(output: &Path) {
    match fs::remove_file(output) {
        Ok(()) => debug!("Removed partial output: {}", output.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", output.display(), e),
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}
