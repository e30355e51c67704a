use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::RequestId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Ready {
        request_id: RequestId,
        expires_at: DateTime<Utc>,
    },
    Failed {
        request_id: RequestId,
        message: String,
    },
    Expired {
        request_id: RequestId,
    },
    Cancelled {
        request_id: RequestId,
    },
    ExpiringSoon {
        request_id: RequestId,
        expires_at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            JobEvent::Ready { request_id, .. }
            | JobEvent::Failed { request_id, .. }
            | JobEvent::Expired { request_id }
            | JobEvent::Cancelled { request_id }
            | JobEvent::ExpiringSoon { request_id, .. } => request_id,
        }
    }
}

/// Receives lifecycle events; delivery (mail, queues) lives behind it.
pub trait EventSink: Send + Sync {
    fn event(&self, event: JobEvent);
}

pub struct TracingSink;

impl EventSink for TracingSink {
    fn event(&self, event: JobEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => tracing::info!(request_id = %event.request_id(), %payload, "job event"),
            Err(err) => tracing::warn!(error = %err, "unserialisable job event"),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<JobEvent>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<JobEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl EventSink for MemorySink {
    fn event(&self, event: JobEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
