//! Events the core emits to an injected bus. The bus implementation itself
//! is a collaborator: production buses are typically queue-backed with their
//! own consumer, tests collect into a list. Publication must never block the
//! I/O path.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::config::ServiceType;
use crate::protocol::{ServerFeature, Status};

/// Where and when an event happened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventContext {
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
    pub core_id: Uuid,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    FeatureNegotiationCompleted { negotiated: Vec<ServerFeature> },
    ErrorMapLoaded { version: u16 },
    ErrorMapLoadingFailure { status: Status },
    ErrorMapUndecodable,
    SaslAuthCompleted { mechanism: String },
    SaslAuthFailed { status: Status },
    BucketSelected { bucket: String },
    BucketSelectionFailed { bucket: String, status: Status },
    EndpointConnected,
    EndpointDisconnected,
    ConfigUpdated { rev_epoch: i64, rev: i64 },
    ConfigParsingFailure { message: String },
    ProtocolViolation { message: String },
    RequestRetried { service: ServiceType, attempt: u32 },
    RequestTimeout { service: ServiceType },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub context: EventContext,
}

/// The seam the core publishes through. Implementations must not block.
pub trait EventBus: Send + Sync + Debug {
    fn publish(&self, event: Event);
}

/// Discards every event. The default when callers do not care.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn publish(&self, _: Event) {}
}

/// Forwards events to the `log` facade at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventBus;

impl EventBus for LogEventBus {
    fn publish(&self, event: Event) {
        log::debug!("{:?} ({:?})", event.kind, event.context);
    }
}

/// Collects events into a list for inspection, used by tests.
#[derive(Debug, Clone, Default)]
pub struct CollectingEventBus {
    events: Arc<Mutex<Vec<Event>>>,
}

impl CollectingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Event> {
        self.events.lock().unwrap().drain(..).collect()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.kind.clone())
            .collect()
    }
}

impl EventBus for CollectingEventBus {
    fn publish(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
