//! Security events and the bounded queue that delivers them.
//!
//! Audit logging and lockout callbacks are side effects the request path must
//! never wait on. Components submit a [`SecurityEvent`] to an [`EventQueue`];
//! a single worker task drains the queue into an [`EventHandler`].
//!
//! Delivery is best-effort and at-most-once. When the queue is full or the
//! worker has stopped, the event is dropped, logged and counted under
//! `security_events_dropped_total`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metrics::{MetricsSink, names};

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Security-relevant occurrences emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SecurityEvent {
    /// An OIDC callback completed.
    LoginSucceeded {
        subject: String,
        provider: String,
        session_id: Option<String>,
    },
    /// A login attempt failed.
    LoginFailed {
        subject: Option<String>,
        source_addr: Option<String>,
        reason: String,
        /// Failures counted against the subject so far, when tracked.
        failed_attempts: Option<u32>,
    },
    /// A principal or address was locked out.
    LockedOut {
        subject: String,
        duration: Duration,
        failed_attempts: u32,
        lockout_count: u32,
    },
    /// A lockout was cleared by success or an administrator.
    LockoutCleared { subject: String },
    /// A single-use token was presented again.
    ReplayDetected {
        jti: String,
        issuer: String,
        source_addr: Option<String>,
    },
    /// The provider's key set changed between two refreshes.
    KeyRotation {
        provider: String,
        added: usize,
        removed: usize,
        at: OffsetDateTime,
    },
    /// One or more sessions were revoked.
    SessionRevoked {
        user_id: String,
        count: usize,
        reason: String,
    },
    /// A back-channel logout notification was processed.
    BackChannelLogout {
        subject: Option<String>,
        session_id: Option<String>,
        sessions_terminated: usize,
    },
}

impl SecurityEvent {
    /// Short, stable label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoginSucceeded { .. } => "login_succeeded",
            Self::LoginFailed { .. } => "login_failed",
            Self::LockedOut { .. } => "locked_out",
            Self::LockoutCleared { .. } => "lockout_cleared",
            Self::ReplayDetected { .. } => "replay_detected",
            Self::KeyRotation { .. } => "key_rotation",
            Self::SessionRevoked { .. } => "session_revoked",
            Self::BackChannelLogout { .. } => "backchannel_logout",
        }
    }
}

/// Consumer of delivered events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event. Failures are the handler's own concern.
    async fn handle(&self, event: SecurityEvent);
}

/// Handler that writes events to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, event: SecurityEvent) {
        tracing::info!(kind = event.kind(), event = ?event, "security event");
    }
}

/// Producer side of the bounded event queue.
#[derive(Clone)]
pub struct EventQueue {
    sender: mpsc::Sender<SecurityEvent>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("capacity", &self.sender.max_capacity())
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl EventQueue {
    /// Creates the queue and spawns its worker.
    ///
    /// The worker exits once every `EventQueue` clone has been dropped and
    /// the remaining events are drained.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or if called outside a tokio runtime.
    pub fn spawn(
        capacity: usize,
        handler: Arc<dyn EventHandler>,
        metrics: Arc<dyn MetricsSink>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel(capacity);
        let worker = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                handler.handle(event).await;
            }
            tracing::debug!("security event worker stopped");
        });
        (Self { sender, metrics }, worker)
    }

    /// Submits an event without waiting.
    ///
    /// Returns `false` if the event was dropped.
    pub fn submit(&self, event: SecurityEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(kind = event.kind(), "security event queue full, dropping event");
                self.metrics.increment_counter(
                    names::SECURITY_EVENTS_DROPPED_TOTAL,
                    &[("reason", "full")],
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::warn!(kind = event.kind(), "security event worker gone, dropping event");
                self.metrics.increment_counter(
                    names::SECURITY_EVENTS_DROPPED_TOTAL,
                    &[("reason", "closed")],
                );
                false
            }
        }
    }
}

/// Submits to an optional queue; no queue means nobody is listening.
pub(crate) fn emit(queue: Option<&EventQueue>, event: SecurityEvent) {
    if let Some(queue) = queue {
        queue.submit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RecordingMetrics;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<SecurityEvent>>,
    }

    #[async_trait]
    impl EventHandler for Collecting {
        async fn handle(&self, event: SecurityEvent) {
            self.seen.lock().await.push(event);
        }
    }

    struct Blocking {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl EventHandler for Blocking {
        async fn handle(&self, _event: SecurityEvent) {
            self.release.notified().await;
        }
    }

    fn cleared(subject: &str) -> SecurityEvent {
        SecurityEvent::LockoutCleared {
            subject: subject.to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let handler = Arc::new(Collecting::default());
        let metrics = Arc::new(RecordingMetrics::new());
        let (queue, worker) = EventQueue::spawn(8, handler.clone(), metrics.clone());

        assert!(queue.submit(cleared("alice")));
        assert!(queue.submit(cleared("bob")));
        drop(queue);
        worker.await.unwrap();

        let seen = handler.seen.lock().await;
        assert_eq!(*seen, vec![cleared("alice"), cleared("bob")]);
        assert_eq!(metrics.counter(names::SECURITY_EVENTS_DROPPED_TOTAL), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let handler = Arc::new(Blocking {
            release: tokio::sync::Notify::new(),
        });
        let metrics = Arc::new(RecordingMetrics::new());
        let (queue, _worker) = EventQueue::spawn(1, handler.clone(), metrics.clone());

        // The worker may pick up the first event and block on it; at most two
        // events fit (one in flight, one buffered) so a batch of five drops some.
        let accepted = (0..5).filter(|i| queue.submit(cleared(&i.to_string()))).count();

        assert!(accepted <= 2);
        assert_eq!(
            metrics.counter_with(names::SECURITY_EVENTS_DROPPED_TOTAL, &[("reason", "full")]),
            (5 - accepted) as u64
        );
        handler.release.notify_waiters();
    }

    #[tokio::test]
    async fn test_closed_queue_drops() {
        let handler = Arc::new(Collecting::default());
        let metrics = Arc::new(RecordingMetrics::new());
        let (queue, worker) = EventQueue::spawn(4, handler, metrics.clone());
        worker.abort();
        let _ = worker.await;

        assert!(!queue.submit(cleared("carol")));
        assert_eq!(
            metrics.counter_with(names::SECURITY_EVENTS_DROPPED_TOTAL, &[("reason", "closed")]),
            1
        );
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(cleared("x").kind(), "lockout_cleared");
        let event = SecurityEvent::ReplayDetected {
            jti: "j".into(),
            issuer: "i".into(),
            source_addr: None,
        };
        assert_eq!(event.kind(), "replay_detected");
    }
}
