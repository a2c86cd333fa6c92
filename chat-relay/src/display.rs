//! Operator-facing output.
//!
//! The relay never prints directly. Every task that has something to show
//! posts a [`DisplayEvent`] into a bounded queue, and a single consumer
//! ([`run_console`]) renders the queue in order. Posting never blocks the
//! caller; if the consumer falls behind the line is dropped and recorded in
//! the tracing log instead.

use std::io;

use chrono::{DateTime, Local};
use tokio::{
    io::AsyncWriteExt,
    sync::mpsc::{self, error::TrySendError},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayLevel {
    Info,
    Error,
}

#[derive(Debug, Clone)]
pub struct DisplayEvent {
    pub at: DateTime<Local>,
    pub level: DisplayLevel,
    pub text: String,
}

impl DisplayEvent {
    fn new(level: DisplayLevel, text: String) -> Self {
        Self {
            at: Local::now(),
            level,
            text,
        }
    }

    /// `HH:MM:SS <text>`
    pub fn render(&self) -> String {
        format!("{} {}", self.at.format("%H:%M:%S"), self.text)
    }
}

#[derive(Debug, Clone)]
pub struct DisplaySink {
    tx: mpsc::Sender<DisplayEvent>,
}

impl DisplaySink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DisplayEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn post_line(&self, text: impl Into<String>) {
        self.post(DisplayEvent::new(DisplayLevel::Info, text.into()));
    }

    pub fn post_error(&self, text: impl Into<String>) {
        self.post(DisplayEvent::new(DisplayLevel::Error, text.into()));
    }

    fn post(&self, event: DisplayEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(line = %event.text, "display queue full; dropping line");
            }
            Err(TrySendError::Closed(event)) => {
                debug!(line = %event.text, "display consumer gone");
            }
        }
    }
}

/// Drains `events` to stdout until every [`DisplaySink`] has been dropped.
pub async fn run_console(mut events: mpsc::Receiver<DisplayEvent>) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        let mut line = event.render();
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}
