//! labgrid-state — embedded object store for labgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for problems, problem environments, workers and heartbeat leases.
//!
//! # Architecture
//!
//! Every object is `{metadata, spec, status}` JSON-serialized into a
//! per-kind redb table. Writes are conditional on `resource_version`, owner
//! references drive cascading deletes, and committed changes are broadcast
//! to watchers so controllers can react to them.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod conditions;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use conditions::*;
pub use error::{StateError, StateResult};
pub use store::{StateStore, WatchEvent, WatchEventType};
pub use types::*;
