//! Application event broadcasting for real-time status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::health::HealthStatus;
use super::history::SyncStatus;
use super::policy::SyncTrigger;
use super::snapshot::RevisionId;
use super::status::SyncPhase;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ApplicationEventKind {
    Registered,
    #[serde(rename_all = "camelCase")]
    Removed { cascade: bool },
    #[serde(rename_all = "camelCase")]
    SyncStarted {
        revision: RevisionId,
        trigger: SyncTrigger,
        patches: usize,
    },
    #[serde(rename_all = "camelCase")]
    SyncCompleted {
        revision: RevisionId,
        status: SyncStatus,
    },
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        phase: SyncPhase,
        health: HealthStatus,
    },
    #[serde(rename_all = "camelCase")]
    PolicyRejected { reason: String },
    #[serde(rename_all = "camelCase")]
    SourceUnavailable {
        consecutive_failures: u32,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    RenderFailed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationEvent {
    pub application: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ApplicationEventKind,
}

impl ApplicationEvent {
    pub fn new(application: &str, kind: ApplicationEventKind) -> Self {
        Self {
            application: application.to_string(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[derive(Clone)]
pub struct EventBroadcaster {
    sender: Arc<broadcast::Sender<ApplicationEvent>>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, application: &str, kind: ApplicationEventKind) {
        // No subscribers is fine.
        let _ = self.sender.send(ApplicationEvent::new(application, kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApplicationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
