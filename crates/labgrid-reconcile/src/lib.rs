//! labgrid-reconcile — level-triggered controller runtime.
//!
//! Turns store change notifications into reconcile calls. A reconciler
//! names the kind it owns and the kinds whose changes should wake their
//! owner; the runtime handles deduplication, per-key serialization,
//! requeue delays and exponential backoff on failure.
//!
//! # Architecture
//!
//! ```text
//! StateStore::watch()
//!   └── Controller<R>
//!       ├── event → keys (own kind by name, owned kinds by owner)
//!       ├── WorkQueue (ready / delayed / in-flight / dirty)
//!       └── JoinSet of blocking R::reconcile(key) passes
//! ```

pub mod controller;
pub mod error;
pub mod queue;

pub use controller::{Action, Controller, DEFAULT_WORKERS, Reconciler};
pub use error::{ReconcileError, ReconcileResult};
pub use queue::{WorkQueue, backoff_delay};
