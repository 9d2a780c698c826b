//! Audit events and the best-effort emitter
//!
//! Events are immutable once built. The emitter hands them to a single
//! forwarding task over a bounded queue; when the queue is full the event is
//! dropped and a warning logged, so auditing never blocks or fails the
//! operation that produced the event.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    CredentialRegistered,
    RegistrationFailed,
    AuthenticationSucceeded,
    AuthenticationFailed,
    CredentialSuspended,
    CredentialReactivated,
    CredentialDeleted,
    SignCountAnomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    High,
    Critical,
}

/// A single audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub credential_id: Option<Uuid>,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl AuditEvent {
    /// Start building an event
    #[must_use]
    pub fn builder(
        event_type: AuditEventType,
        tenant_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> AuditEventBuilder {
        AuditEventBuilder {
            event_type,
            severity: AuditSeverity::Info,
            tenant_id: tenant_id.into(),
            correlation_id: correlation_id.into(),
            user_id: None,
            credential_id: None,
            details: serde_json::Map::new(),
        }
    }
}

#[derive(Debug)]
pub struct AuditEventBuilder {
    event_type: AuditEventType,
    severity: AuditSeverity,
    tenant_id: String,
    correlation_id: String,
    user_id: Option<String>,
    credential_id: Option<Uuid>,
    details: serde_json::Map<String, serde_json::Value>,
}

impl AuditEventBuilder {
    #[must_use]
    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn credential(mut self, credential_id: Uuid) -> Self {
        self.credential_id = Some(credential_id);
        self
    }

    #[must_use]
    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn build(self) -> AuditEvent {
        AuditEvent {
            id: Uuid::new_v4(),
            event_type: self.event_type,
            severity: self.severity,
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            credential_id: self.credential_id,
            correlation_id: self.correlation_id,
            timestamp: Utc::now(),
            details: serde_json::Value::Object(self.details),
        }
    }
}

/// Append-only destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one event
    ///
    /// # Errors
    /// Returns a description of the failure; the emitter logs and drops it
    async fn append(&self, event: AuditEvent) -> Result<(), String>;
}

/// Collects events in memory
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event appended so far
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn events_of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<(), String> {
        self.events
            .lock()
            .map_err(|_| "audit store poisoned".to_string())?
            .push(event);
        Ok(())
    }
}

enum AuditMessage {
    Event(Box<AuditEvent>),
    Flush(oneshot::Sender<()>),
}

/// Bounded-queue audit emitter
///
/// Cloning is cheap; all clones feed the same forwarding task. The task ends
/// when the last clone is dropped.
#[derive(Clone, Debug)]
pub struct AuditEmitter {
    sender: mpsc::Sender<AuditMessage>,
}

impl std::fmt::Debug for AuditMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditMessage::Event(event) => write!(f, "Event({:?})", event.event_type),
            AuditMessage::Flush(_) => write!(f, "Flush"),
        }
    }
}

impl AuditEmitter {
    /// Spawn the forwarding task on the current tokio runtime
    ///
    /// # Panics
    /// Panics if called outside a tokio runtime
    #[must_use]
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<AuditMessage>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                match message {
                    AuditMessage::Event(event) => {
                        let event_type = event.event_type;
                        let correlation_id = event.correlation_id.clone();
                        if let Err(err) = sink.append(*event).await {
                            log::warn!(
                                "Audit sink rejected {event_type:?} event (correlation_id={correlation_id}): {err}"
                            );
                        }
                    }
                    AuditMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            log::debug!("Audit emitter stopped");
        });
        Self { sender }
    }

    /// Queue an event; never blocks
    pub fn emit(&self, event: AuditEvent) {
        if let Err(err) = self.sender.try_send(AuditMessage::Event(Box::new(event))) {
            let (reason, message) = match err {
                mpsc::error::TrySendError::Full(m) => ("queue full", m),
                mpsc::error::TrySendError::Closed(m) => ("emitter stopped", m),
            };
            if let AuditMessage::Event(event) = message {
                log::warn!(
                    "Dropping {:?} audit event ({reason}) tenant_id={} correlation_id={}",
                    event.event_type,
                    event.tenant_id,
                    event.correlation_id
                );
            }
        }
    }

    /// Wait until every event queued before this call has reached the sink
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(AuditMessage::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn append(&self, _event: AuditEvent) -> Result<(), String> {
            Err("disk full".to_string())
        }
    }

    fn event(event_type: AuditEventType) -> AuditEvent {
        AuditEvent::builder(event_type, "tenant-a", "corr-1")
            .user("user-1")
            .detail("reason", "test")
            .build()
    }

    #[test]
    fn test_builder_collects_details() {
        let built = AuditEvent::builder(AuditEventType::SignCountAnomaly, "t", "c")
            .severity(AuditSeverity::Critical)
            .detail("expectedCounter", 5)
            .detail("receivedCounter", 3)
            .build();
        assert_eq!(built.severity, AuditSeverity::Critical);
        assert_eq!(built.details["expectedCounter"], 5);
        assert_eq!(built.details["receivedCounter"], 3);
        assert!(built.user_id.is_none());
    }

    #[tokio::test]
    async fn test_emit_and_flush() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let emitter = AuditEmitter::spawn(sink.clone(), 16);

        emitter.emit(event(AuditEventType::CredentialRegistered));
        emitter.emit(event(AuditEventType::AuthenticationSucceeded));
        emitter.flush().await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::CredentialRegistered);
        assert_eq!(events[1].user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let emitter = AuditEmitter::spawn(sink.clone(), 1);

        // The forwarding task cannot run until we yield, so only one fits
        for _ in 0..10 {
            emitter.emit(event(AuditEventType::AuthenticationFailed));
        }
        emitter.flush().await;
        assert!(sink.events().len() < 10);
    }

    #[tokio::test]
    async fn test_sink_failures_are_swallowed() {
        let emitter = AuditEmitter::spawn(Arc::new(FailingSink), 4);
        emitter.emit(event(AuditEventType::CredentialDeleted));
        emitter.flush().await;
    }
}
