//! Fan-out of one rendered line to every admitted session.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::{
    display::DisplaySink,
    error::SessionError,
    registry::Registry,
    session::{Session, SessionId},
};

/// Who produced a broadcast line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Session(SessionId),
    Server,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Session(id) => write!(f, "session-{id}"),
            Origin::Server => f.write_str("server"),
        }
    }
}

/// A line on its way out. Lives only for the duration of one fan-out.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub seq: u64,
    pub origin: Origin,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub seq: u64,
    pub delivered: usize,
    pub failed: Vec<SessionId>,
}

pub struct Broadcaster {
    registry: Arc<Registry>,
    display: DisplaySink,
    next_seq: AtomicU64,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>, display: DisplaySink) -> Self {
        Self {
            registry,
            display,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Writes `text` to every session in one registry snapshot.
    ///
    /// Recipients are written concurrently, so a slow peer delays only its own
    /// write (bounded by the session write timeout). A recipient whose write
    /// fails is removed from the registry and closed; the rest of the snapshot
    /// still receives the line.
    pub async fn broadcast(&self, origin: Origin, text: impl Into<String>) -> BroadcastReport {
        let message = OutboundMessage {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            origin,
            text: text.into(),
        };

        let recipients = self.registry.snapshot();
        let results = join_all(
            recipients
                .iter()
                .map(|session| session.write_line(&message.text)),
        )
        .await;

        let mut report = BroadcastReport {
            seq: message.seq,
            delivered: 0,
            failed: Vec::new(),
        };
        for (session, result) in recipients.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    self.evict(session, &err).await;
                    report.failed.push(session.id());
                }
            }
        }

        debug!(
            seq = message.seq,
            origin = %message.origin,
            delivered = report.delivered,
            failed = report.failed.len(),
            "broadcast complete"
        );
        report
    }

    async fn evict(&self, session: &Session, err: &SessionError) {
        // Already on its way out through another path.
        if matches!(err, SessionError::Closed) {
            debug!(session = session.id(), "skipped closed recipient");
            return;
        }

        warn!(session = session.id(), error = ?err, "dropping recipient after failed write");
        self.display
            .post_error(format!("Failed to deliver to [{}]: {err}", session.label()));
        self.registry.remove(session.id());
        session.close().await;
    }
}
