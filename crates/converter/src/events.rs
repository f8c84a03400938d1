use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, error};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        original_size: u64,
        total_frames: i64,
    },
    Progress {
        percent: u8,
        current_frame: i64,
        total_frames: i64,
    },
    Succeeded {
        output_path: PathBuf,
        original_size: u64,
        new_size: u64,
    },
    Failed {
        message: String,
    },
    Cancelled,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Succeeded { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled)
    }
}

/// Consumer of job notifications (the presentation layer)
pub trait ConversionListener: Send + Sync {
    fn on_start(&self, _original_size: u64, _total_frames: i64) {}
    fn on_progress(&self, _percent: u8, _current_frame: i64, _total_frames: i64) {}
    fn on_success(&self, _output_path: &Path, _original_size: u64, _new_size: u64) {}
    fn on_failure(&self, _message: &str) {}
    fn on_cancelled(&self) {}
}

/// Route one event to the matching listener method
pub fn dispatch(listener: &dyn ConversionListener, event: &JobEvent) {
    match event {
        JobEvent::Started { original_size, total_frames } => listener.on_start(*original_size, *total_frames),
        JobEvent::Progress { percent, current_frame, total_frames } => {
            listener.on_progress(*percent, *current_frame, *total_frames)
        }
        JobEvent::Succeeded { output_path, original_size, new_size } => {
            listener.on_success(output_path, *original_size, *new_size)
        }
        JobEvent::Failed { message } => listener.on_failure(message),
        JobEvent::Cancelled => listener.on_cancelled(),
    }
}

/// Cloneable handle for queueing events
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl EventSender {
    pub fn emit(&self, event: JobEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event dispatcher stopped, dropping event");
        }
    }
}

/// The single delivery context: one task draining the event queue into a
/// listener, so calls never overlap and arrive in the order produced
pub struct EventDispatcher {
    sender: EventSender,
    handle: JoinHandle<()>,
}

impl EventDispatcher {
    /// Start the dispatcher task. Must be called within a tokio runtime.
    pub fn spawn(listener: Arc<dyn ConversionListener>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobEvent>();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let delivered = catch_unwind(AssertUnwindSafe(|| dispatch(listener.as_ref(), &event)));
                if delivered.is_err() {
                    error!("Listener panicked while handling {:?}", event);
                }
            }
        });

        Self {
            sender: EventSender { tx },
            handle,
        }
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Close the queue and wait until every queued event has been delivered
    pub async fn shutdown(self) {
        let EventDispatcher { sender, handle } = self;
        drop(sender);
        if let Err(e) = handle.await {
            error!("Event dispatcher task failed: {}", e);
        }
    }
}

/// Listener forwarding every event into a channel, for callers that prefer
/// awaiting events over implementing callbacks
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }
}

impl ConversionListener for ChannelListener {
    fn on_start(&self, original_size: u64, total_frames: i64) {
        self.forward(JobEvent::Started { original_size, total_frames });
    }

    fn on_progress(&self, percent: u8, current_frame: i64, total_frames: i64) {
        self.forward(JobEvent::Progress { percent, current_frame, total_frames });
    }

    fn on_success(&self, output_path: &Path, original_size: u64, new_size: u64) {
        self.forward(JobEvent::Succeeded {
            output_path: output_path.to_path_buf(),
            original_size,
            new_size,
        });
    }

    fn on_failure(&self, message: &str) {
        self.forward(JobEvent::Failed { message: message.to_string() });
    }

    fn on_cancelled(&self) {
        self.forward(JobEvent::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
    }

    impl ConversionListener for Flaky {
        fn on_progress(&self, _percent: u8, _current_frame: i64, _total_frames: i64) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("listener bug");
        }

        fn on_cancelled(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (listener, mut rx) = ChannelListener::new();
        let dispatcher = EventDispatcher::spawn(Arc::new(listener));
        let sender = dispatcher.sender();

        let sent = vec![
            JobEvent::Started { original_size: 10, total_frames: 300 },
            JobEvent::Progress { percent: 1, current_frame: 3, total_frames: 300 },
            JobEvent::Progress { percent: 2, current_frame: 6, total_frames: 300 },
            JobEvent::Failed { message: "boom".to_string() },
        ];
        for event in sent.clone() {
            sender.emit(event);
        }
        drop(sender);
        dispatcher.shutdown().await;

        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_delivery() {
        let listener = Arc::new(Flaky { calls: AtomicUsize::new(0) });
        let dispatcher = EventDispatcher::spawn(listener.clone());
        let sender = dispatcher.sender();

        sender.emit(JobEvent::Progress { percent: 1, current_frame: 1, total_frames: 10 });
        sender.emit(JobEvent::Cancelled);
        drop(sender);
        dispatcher.shutdown().await;

        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(JobEvent::Started { original_size: 5, total_frames: -1 }).unwrap();
        assert_eq!(json["event"], "started");
        assert_eq!(json["total_frames"], -1);
        assert!(JobEvent::Cancelled.is_terminal());
        assert!(!JobEvent::Started { original_size: 0, total_frames: 0 }.is_terminal());
    }
}
