//! The Tag abstraction and the process-wide tag registry.

pub mod registry;
pub mod tag;

pub use registry::{BusEvent, BusLink, TagRegistry};
pub use tag::{now_us, Tag, TagError, TagKind, TagMetadata, TagSpec};
