use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::session::Step;

#[derive(Clone, Debug, Serialize)]
pub struct EventHeader {
    pub event_id: Uuid,
    pub session_id: Uuid,
    pub timestamp: SystemTime,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    StepChanged { from: Step, to: Step },
    Progress { percent: u8 },
    FileRejected { mime: String },
    ResultReady,
    /// A late result arrived for an attempt that is no longer current.
    StaleDiscarded { ticket: Uuid },
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionEvent {
    pub header: EventHeader,
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub const CHANNEL_CAPACITY: usize = 64;

    pub fn new(session_id: Uuid, kind: SessionEventKind) -> Self {
        Self {
            header: EventHeader {
                event_id: Uuid::new_v4(),
                session_id,
                timestamp: SystemTime::now(),
            },
            kind,
        }
    }
}

/// Fan-out of session events. Publishing with no subscribers is not an error.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(SessionEvent::CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, session_id: Uuid, kind: SessionEventKind) {
        let _ = self.tx.send(SessionEvent::new(session_id, kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}
