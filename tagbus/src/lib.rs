//! A distributed SCADA tag bus.
//!
//! The bus is an in-memory, last-value store of named, typed values
//! (tags) published by exception and fanned out to subscribers over a
//! compact TCP framing. Any process may author any tag; request-to-
//! author messages rendezvous with whichever connection last set a tag,
//! which is how on-demand payloads (history blobs, DB queries) travel
//! without a second channel.
//!
//! A process embeds [`TagRegistry`] + [`BusClient`]; the server runs as
//! its own process from [`BusServer`] (see `src/main.rs`).

pub mod bus;
pub mod config;
pub mod logging;
pub mod periodic;
pub mod protocol;
pub mod tags;

pub use bus::{BusClient, BusError, BusServer, ClientStatus};
pub use config::{Settings, SettingsError, TagDeclaration};
pub use protocol::Value;
pub use tags::{Tag, TagError, TagKind, TagRegistry};
