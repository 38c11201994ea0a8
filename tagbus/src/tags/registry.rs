//! Process-wide tag registry.
//!
//! Tags are singletons by name: any number of `tag()` calls for the same
//! name return the same `Arc<Tag>`. The registry is an explicit context
//! object threaded through constructors rather than a process global, so
//! independent registries (and their tests) never interfere.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::protocol::Value;
use crate::tags::tag::{Tag, TagError, TagKind, TagSpec};

/// Traffic from tags and the registry towards the bus client.
#[derive(Debug)]
pub enum BusEvent {
    /// A tag now exists and needs ID/SUB registration.
    Created { name: String },
    /// A locally authored change to publish.
    Publish {
        name: String,
        value: Value,
        time_us: u64,
    },
    /// An outbound request-to-author.
    Request { name: String, value: Value },
    /// Pull the current bus value without subscribing.
    Refresh { name: String },
}

/// Sending half of the client's event channel; installed on every tag.
pub type BusLink = UnboundedSender<BusEvent>;

/// Manages every tag in the process. Cloning is cheap and shares state.
#[derive(Clone)]
pub struct TagRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    tags: DashMap<String, Arc<Tag>>,
    link: Mutex<Option<BusLink>>,
}

impl TagRegistry {
    pub fn new() -> TagRegistry {
        TagRegistry {
            inner: Arc::new(RegistryInner {
                tags: DashMap::new(),
                link: Mutex::new(None),
            }),
        }
    }

    /// Get or create the tag named `name`. A second creation with the
    /// same name returns the existing instance; a conflicting kind is a
    /// programming error.
    pub fn tag(&self, name: &str, kind: TagKind) -> Result<Arc<Tag>, TagError> {
        if let Some(existing) = self.inner.tags.get(name) {
            if existing.kind() != kind {
                return Err(TagError::KindConflict(name.to_owned(), existing.kind()));
            }
            return Ok(existing.clone());
        }

        let mut created = false;
        let tag = self
            .inner
            .tags
            .entry(name.to_owned())
            .or_insert_with(|| {
                created = true;
                Arc::new(Tag::new(name.to_owned(), kind))
            })
            .clone();

        if !created {
            // Lost the insert race; re-check the winner's kind.
            if tag.kind() != kind {
                return Err(TagError::KindConflict(name.to_owned(), tag.kind()));
            }
            return Ok(tag);
        }

        debug!(tag = name, ?kind, "tag created");
        if let Some(link) = self.current_link() {
            tag.attach_link(link.clone());
            let _ = link.send(BusEvent::Created {
                name: name.to_owned(),
            });
        }
        Ok(tag)
    }

    /// Declare a tag from configuration: kind, metadata and the optional
    /// initial value, stamped and locally authored.
    pub fn declare(&self, name: &str, spec: TagSpec) -> Result<Arc<Tag>, TagError> {
        let tag = self.tag(name, spec.kind)?;
        tag.set_metadata(spec.metadata);
        if let Some(init) = spec.init {
            tag.set(init)?;
        }
        Ok(tag)
    }

    /// Look up an existing tag without creating it.
    pub fn get(&self, name: &str) -> Option<Arc<Tag>> {
        self.inner.tags.get(name).map(|entry| entry.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.tags.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tags.is_empty()
    }

    fn current_link(&self) -> Option<BusLink> {
        self.inner
            .link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Attach the bus client's event channel. Existing tags are linked,
    /// announced for registration, and any locally authored values (for
    /// example configured `init` values) are queued for publication.
    pub(crate) fn attach_link(&self, link: BusLink) {
        {
            let mut slot = self
                .inner
                .link
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *slot = Some(link.clone());
        }
        for entry in self.inner.tags.iter() {
            let tag = entry.value();
            tag.attach_link(link.clone());
            let _ = link.send(BusEvent::Created {
                name: tag.name().to_owned(),
            });
            if tag.bus_id() == 0 && tag.time_us() > 0 {
                let _ = link.send(BusEvent::Publish {
                    name: tag.name().to_owned(),
                    value: tag.value(),
                    time_us: tag.time_us(),
                });
            }
        }
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::new()
    }
}
