//! A Tag is a named, typed value holder with timestamp and authorship,
//! change callbacks, and an optional request-to-author handler.
//!
//! Tags are created through [`crate::tags::TagRegistry`] so that one
//! object exists per name in a process. Within a process any task may
//! read or write a tag; callbacks run synchronously on the writer's
//! stack, before the change leaves the process.

use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use thiserror::Error;
use tracing::error;

use crate::protocol::Value;
use crate::tags::registry::{BusEvent, BusLink};

/// Microseconds since the Unix epoch, the bus timestamp unit.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Declared scalar type of a tag. `Dict` and `List` both travel as JSON
/// on the wire; the declaration keeps them apart for the edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Int,
    Float,
    Str,
    Bytes,
    Dict,
    List,
}

impl TagKind {
    /// Whether a wire value is admissible for this declared kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (TagKind::Int, Value::Int(_)) => true,
            (TagKind::Float, Value::Float(_)) => true,
            (TagKind::Float, Value::Int(_)) => true,
            (TagKind::Str, Value::Text(_)) => true,
            (TagKind::Bytes, Value::Bytes(_)) => true,
            (TagKind::Dict, Value::Json(serde_json::Value::Object(_))) => true,
            (TagKind::List, Value::Json(serde_json::Value::Array(_))) => true,
            _ => false,
        }
    }
}

/// Programming errors at the tag layer. None of these are recoverable
/// mid-operation; they point at the calling code.
#[derive(Debug, Error)]
pub enum TagError {
    #[error("tag {0} already exists with kind {1:?}")]
    KindConflict(String, TagKind),
    #[error("value kind does not match tag {0} ({1:?})")]
    KindMismatch(String, TagKind),
    #[error("write to {0} from within its own callback")]
    ReentrantWrite(String),
    #[error("tag {0} is not attached to a bus client")]
    NoBusLink(String),
}

/// Display and engineering metadata attached from configuration. Never
/// on the hot path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagMetadata {
    pub desc: Option<String>,
    pub units: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub dp: Option<u32>,
    pub multi: Option<Vec<String>>,
    pub format: Option<String>,
}

/// Everything needed to declare a tag: resolved kind, metadata and an
/// optional initial value (applied before any bus connection exists).
#[derive(Debug, Clone)]
pub struct TagSpec {
    pub kind: TagKind,
    pub metadata: TagMetadata,
    pub init: Option<Value>,
}

pub type Callback = Arc<dyn Fn(&Tag) + Send + Sync>;
pub type RtaHandler = Arc<dyn Fn(&Tag, Value) + Send + Sync>;

#[derive(Default)]
struct TagState {
    value: Value,
    time_us: u64,
    bus_id: u16,
    id: u16,
}

pub struct Tag {
    name: String,
    kind: TagKind,
    metadata: Mutex<TagMetadata>,
    state: Mutex<TagState>,
    callbacks: Mutex<Vec<(Callback, u16)>>,
    rta_handler: Mutex<Option<RtaHandler>>,
    firing: Mutex<Vec<ThreadId>>,
    link: Mutex<Option<BusLink>>,
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tag")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

fn relock<T>(lock: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Tag {
    pub(crate) fn new(name: String, kind: TagKind) -> Tag {
        Tag {
            name,
            kind,
            metadata: Mutex::new(TagMetadata::default()),
            state: Mutex::new(TagState::default()),
            callbacks: Mutex::new(Vec::new()),
            rta_handler: Mutex::new(None),
            firing: Mutex::new(Vec::new()),
            link: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TagKind {
        self.kind
    }

    /// Current value; `Value::Null` until the first write.
    pub fn value(&self) -> Value {
        relock(&self.state).value.clone()
    }

    /// Microsecond stamp of the last accepted write, 0 if never written.
    pub fn time_us(&self) -> u64 {
        relock(&self.state).time_us
    }

    /// Connection that authored the current value; 0 means the value was
    /// written locally and has not crossed the bus.
    pub fn bus_id(&self) -> u16 {
        relock(&self.state).bus_id
    }

    /// Bus-assigned wire id; 0 until the registration round-trip lands.
    pub fn id(&self) -> u16 {
        relock(&self.state).id
    }

    pub(crate) fn set_id(&self, id: u16) {
        relock(&self.state).id = id;
    }

    pub fn metadata(&self) -> TagMetadata {
        relock(&self.metadata).clone()
    }

    pub(crate) fn set_metadata(&self, metadata: TagMetadata) {
        *relock(&self.metadata) = metadata;
    }

    /// Install (or replace, on client restart) the bus link.
    pub(crate) fn attach_link(&self, link: BusLink) {
        *relock(&self.link) = Some(link);
    }

    /// Write a value stamped with the current time, authored locally.
    pub fn set(&self, value: Value) -> Result<(), TagError> {
        self.set_from(value, now_us(), 0)
    }

    /// Write a value with an explicit stamp, authored locally.
    pub fn set_at(&self, value: Value, time_us: u64) -> Result<(), TagError> {
        self.set_from(value, time_us, 0)
    }

    /// Write a value with full control of stamp and authorship.
    ///
    /// A stamp strictly below the stored one is a stale write and a
    /// silent no-op. Callbacks run synchronously in registration order;
    /// afterwards a locally authored change (`bus_id == 0`) is handed to
    /// the bus link for publication.
    pub fn set_from(&self, value: Value, time_us: u64, bus_id: u16) -> Result<(), TagError> {
        if !self.kind.accepts(&value) {
            return Err(TagError::KindMismatch(self.name.clone(), self.kind));
        }
        if relock(&self.firing).contains(&thread::current().id()) {
            return Err(TagError::ReentrantWrite(self.name.clone()));
        }

        {
            let mut state = relock(&self.state);
            if time_us < state.time_us {
                return Ok(());
            }
            state.value = value.clone();
            state.time_us = time_us;
            state.bus_id = bus_id;
        }

        self.fire_callbacks(bus_id);

        if bus_id == 0 {
            if let Some(link) = relock(&self.link).clone() {
                let _ = link.send(BusEvent::Publish {
                    name: self.name.clone(),
                    value,
                    time_us,
                });
            }
        }
        Ok(())
    }

    fn fire_callbacks(&self, bus_id: u16) {
        let callbacks: Vec<(Callback, u16)> = relock(&self.callbacks).clone();
        if callbacks.is_empty() {
            return;
        }
        let me = thread::current().id();
        relock(&self.firing).push(me);
        for (callback, filter) in callbacks {
            if filter != 0 && filter != bus_id {
                continue;
            }
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(self)
            }));
            if result.is_err() {
                error!(tag = %self.name, "change callback panicked");
            }
        }
        relock(&self.firing).retain(|id| *id != me);
    }

    /// Register a change handler. `filter_bus_id` 0 fires on every change;
    /// a non-zero filter fires only on changes authored by that
    /// connection. Handlers run in registration order on the writer's
    /// stack and receive the tag itself.
    pub fn add_callback(
        &self,
        handler: impl Fn(&Tag) + Send + Sync + 'static,
        filter_bus_id: u16,
    ) {
        relock(&self.callbacks).push((Arc::new(handler), filter_bus_id));
    }

    /// Install the request-to-author handler, at most one per tag. The
    /// process that both authors the tag and holds the handler answers
    /// RTA traffic for it.
    pub fn set_rta_handler(&self, handler: impl Fn(&Tag, Value) + Send + Sync + 'static) {
        *relock(&self.rta_handler) = Some(Arc::new(handler));
    }

    pub(crate) fn rta_handler(&self) -> Option<RtaHandler> {
        relock(&self.rta_handler).clone()
    }

    /// Send a request to whichever connection authored this tag. The
    /// response arrives as an ordinary SET on the same tag.
    pub fn rta(&self, value: Value) -> Result<(), TagError> {
        let link = relock(&self.link)
            .clone()
            .ok_or_else(|| TagError::NoBusLink(self.name.clone()))?;
        link.send(BusEvent::Request {
            name: self.name.clone(),
            value,
        })
        .map_err(|_| TagError::NoBusLink(self.name.clone()))
    }
}
