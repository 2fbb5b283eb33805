//! Structured events published by a running job.
//!
//! The pipeline knows nothing about who is listening. It pushes events into a
//! bounded channel, and if the channel is full, the event is dropped rather
//! than making a worker wait.

use schemars::JsonSchema;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::prelude::*;

/// Default capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A log line about one image, or about the job as a whole.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct LogEntry {
    /// The image this entry refers to. Empty for job-level messages.
    pub filename: String,

    /// 1-based position of this image in the job, counting images that were
    /// already done. 0 for job-level messages.
    pub index: usize,

    /// Total number of matching images.
    pub total: usize,

    /// Human-readable message.
    pub message: String,

    /// Does this entry describe a failure?
    pub is_error: bool,
}

/// Aggregate progress.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ProgressUpdate {
    /// Images processed so far, including those done by earlier runs.
    pub current: usize,

    /// Total number of matching images.
    pub total: usize,

    /// `current / total`, in `0.0..=1.0`.
    pub fraction: f64,
}

impl ProgressUpdate {
    /// Build an update for `current` of `total`.
    pub fn new(current: usize, total: usize) -> Self {
        let fraction = if total == 0 {
            0.0
        } else {
            current as f64 / total as f64
        };
        Self {
            current,
            total,
            fraction,
        }
    }
}

/// Anything a job can publish.
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Log(LogEntry),
    Progress(ProgressUpdate),
}

/// The sending half of an event channel. Cheap to clone.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: Option<mpsc::Sender<JobEvent>>,
}

impl EventSender {
    /// Create a sender and a receiver with room for `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that throws everything away.
    #[cfg(test)]
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Publish an event without waiting.
    pub fn send(&self, event: JobEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                trace!(?event, "Event channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Event channel closed, dropping event");
            }
        }
    }

    /// Publish a log entry.
    pub fn log(
        &self,
        filename: &str,
        index: usize,
        total: usize,
        message: impl Into<String>,
        is_error: bool,
    ) {
        self.send(JobEvent::Log(LogEntry {
            filename: filename.to_owned(),
            index,
            total,
            message: message.into(),
            is_error,
        }));
    }

    /// Publish a job-level informational message.
    pub fn info(&self, message: impl Into<String>) {
        self.log("", 0, 0, message, false);
    }

    /// Publish a job-level error message.
    pub fn error(&self, message: impl Into<String>) {
        self.log("", 0, 0, message, true);
    }

    /// Publish a progress update.
    pub fn progress(&self, current: usize, total: usize) {
        self.send(JobEvent::Progress(ProgressUpdate::new(current, total)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        assert_eq!(ProgressUpdate::new(0, 0).fraction, 0.0);
        assert_eq!(ProgressUpdate::new(1, 4).fraction, 0.25);
        assert_eq!(ProgressUpdate::new(4, 4).fraction, 1.0);
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (events, mut rx) = EventSender::channel(2);
        for i in 0..10 {
            events.progress(i, 10);
        }
        drop(events);

        let mut received = vec![];
        while let Some(event) = rx.recv().await {
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                JobEvent::Progress(ProgressUpdate::new(0, 10)),
                JobEvent::Progress(ProgressUpdate::new(1, 10)),
            ]
        );
    }

    #[test]
    fn test_closed_and_discarding_senders_are_silent() {
        let (events, rx) = EventSender::channel(1);
        drop(rx);
        events.error("nobody is listening");
        EventSender::discard().info("nor here");
    }
}
