//! # Event Bus System
//!
//! Channel-based change notification for the sync engine using `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The reconciler, the sidecar workflow and the service loop push typed events
//! onto one [`EventBus`]. Collaborators (a publish workflow, a presentation
//! layer, the CLI) subscribe independently and receive every event emitted
//! after they subscribed.
//!
//! ```text
//! ┌────────────┐   emit   ┌───────────┐  subscribe  ┌────────────┐
//! │ Reconciler ├─────────>│           ├────────────>│ Subscriber │
//! └────────────┘          │ EventBus  │             └────────────┘
//! ┌────────────┐   emit   │ (broadcast│  subscribe  ┌────────────┐
//! │  Sidecar   ├─────────>│  channel) ├────────────>│ Subscriber │
//! │  workflow  │          └───────────┘             └────────────┘
//! └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CatalogEvent, CoreEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut subscriber = bus.subscribe();
//!
//! bus.emit(CoreEvent::Catalog(CatalogEvent::TableChanged {
//!     root: "/srv/media".to_string(),
//! }))
//! .ok();
//!
//! let event = subscriber.recv().await.unwrap();
//! assert_eq!(event.description(), "Catalog changed");
//! # }
//! ```
//!
//! Emitting with no subscribers returns an error which callers ignore with
//! `.ok()`; events are notifications, not commands.

use crate::config::DEFAULT_EVENT_BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError, TryRecvError};
pub use tokio::sync::broadcast::Receiver;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Catalog mutations
    Catalog(CatalogEvent),
    /// Background sidecar creation
    Sidecar(SidecarEvent),
    /// Watch registration
    Watch(WatchEvent),
    /// An operation failed and was reported at the service boundary
    Error(ErrorEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Catalog(e) => e.description(),
            CoreEvent::Sidecar(e) => e.description(),
            CoreEvent::Watch(e) => e.description(),
            CoreEvent::Error(_) => "Operation failed",
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Error(_) => EventSeverity::Error,
            CoreEvent::Sidecar(SidecarEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Watch(WatchEvent::RegistrationFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Catalog(CatalogEvent::RootInvalidated { .. }) => EventSeverity::Warning,
            CoreEvent::Catalog(CatalogEvent::MediaAdded { .. }) => EventSeverity::Info,
            CoreEvent::Sidecar(SidecarEvent::Created { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Catalog Events
// ============================================================================

/// Events raised by live reconciliation. Never emitted for the bulk pass
/// performed while registering a root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum CatalogEvent {
    /// Any mutation was committed to a root's table.
    TableChanged {
        /// Absolute root path
        root: String,
    },
    /// New media files were inserted.
    MediaAdded {
        root: String,
        /// Absolute paths of the new media files
        paths: Vec<String>,
    },
    /// Sidecars appeared for tracked media files.
    SidecarAdded {
        root: String,
        /// Absolute paths of the media files that gained a sidecar
        paths: Vec<String>,
    },
    /// Sidecars disappeared for tracked media files.
    SidecarRemoved {
        root: String,
        /// Absolute paths of the media files that lost their sidecar
        paths: Vec<String>,
    },
    /// A watched directory vanished and the root's table was dropped.
    RootInvalidated {
        root: String,
        /// The directory whose disappearance triggered the drop
        missing: String,
    },
}

impl CatalogEvent {
    fn description(&self) -> &str {
        match self {
            CatalogEvent::TableChanged { .. } => "Catalog changed",
            CatalogEvent::MediaAdded { .. } => "Media files added",
            CatalogEvent::SidecarAdded { .. } => "Sidecars added",
            CatalogEvent::SidecarRemoved { .. } => "Sidecars removed",
            CatalogEvent::RootInvalidated { .. } => "Root invalidated",
        }
    }
}

// ============================================================================
// Sidecar Events
// ============================================================================

/// Progress of background sidecar creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SidecarEvent {
    /// The generator was launched for a media file.
    Started { path: String },
    /// The sidecar appeared on disk.
    Created { path: String, sidecar: String },
    /// The generator failed or the sidecar never appeared.
    Failed { path: String, message: String },
}

impl SidecarEvent {
    fn description(&self) -> &str {
        match self {
            SidecarEvent::Started { .. } => "Sidecar creation started",
            SidecarEvent::Created { .. } => "Sidecar created",
            SidecarEvent::Failed { .. } => "Sidecar creation failed",
        }
    }
}

// ============================================================================
// Watch Events
// ============================================================================

/// Watch subsystem notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum WatchEvent {
    /// Some directories could not be watched. The rest remain registered.
    RegistrationFailed { paths: Vec<String> },
}

impl WatchEvent {
    fn description(&self) -> &str {
        match self {
            WatchEvent::RegistrationFailed { .. } => "Directory watch failed",
        }
    }
}

// ============================================================================
// Error Events
// ============================================================================

/// A failure surfaced at the top-level reporting boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Operation that failed, e.g. `"reconcile /srv/media/show"`
    pub operation: String,
    /// Underlying cause
    pub message: String,
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast hub shared by every event producer. Clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// A bus whose subscribers may fall `capacity` events behind before they
    /// start missing events.
    pub fn new(capacity: usize) -> Self {
        Self {
            sender: broadcast::channel(capacity.max(1)).0,
        }
    }

    /// Deliver `event` to current subscribers; returns how many got it.
    ///
    /// Fails only when nobody is subscribed.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Receive events emitted from now on.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Filtered view of a fresh subscription.
    pub fn stream(&self) -> EventStream {
        EventStream::new(self.subscribe())
    }

    /// ```rust
    /// use core_runtime::events::EventBus;
    ///
    /// let bus = EventBus::new(8);
    /// let _subscriber = bus.subscribe();
    /// assert_eq!(bus.subscriber_count(), 1);
    /// ```
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

// ============================================================================
// Event Stream
// ============================================================================

type Predicate = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// Subscription that skips events below a severity or outside a predicate.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventSeverity};
///
/// let bus = EventBus::new(16);
/// let problems = bus.stream().min_severity(EventSeverity::Warning);
/// let catalog = bus.stream().filter(|event| matches!(event, CoreEvent::Catalog(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    min_severity: EventSeverity,
    predicate: Option<Predicate>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            min_severity: EventSeverity::Debug,
            predicate: None,
        }
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    pub fn min_severity(mut self, severity: EventSeverity) -> Self {
        self.min_severity = severity;
        self
    }

    fn wants(&self, event: &CoreEvent) -> bool {
        event.severity() >= self.min_severity && self.predicate.as_ref().map_or(true, |p| p(event))
    }

    /// Next matching event.
    ///
    /// # Errors
    ///
    /// `RecvError::Lagged(n)` after `n` events were missed,
    /// `RecvError::Closed` once every bus handle is gone.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.wants(&event) {
                return Ok(event);
            }
        }
    }

    /// Next matching event already buffered; `None` when there is none.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            let event = match self.receiver.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(n)) => return Some(Err(RecvError::Lagged(n))),
                Err(TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            };
            if self.wants(&event) {
                return Some(Ok(event));
            }
        }
    }

    /// Every matching event already buffered. Gaps from lagging are skipped.
    pub fn drain(&mut self) -> Vec<CoreEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Some(Ok(event)) => events.push(event),
                Some(Err(RecvError::Lagged(_))) => continue,
                Some(Err(RecvError::Closed)) | None => return events,
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("min_severity", &self.min_severity)
            .field("filtered", &self.predicate.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
