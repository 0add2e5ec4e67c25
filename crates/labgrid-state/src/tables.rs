//! redb table definitions for the labgrid object store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized objects).
//! Cluster-scoped kinds are keyed by `{name}`, namespaced kinds by
//! `{namespace}/{name}`.

use redb::TableDefinition;

/// Problems keyed by `{name}`.
pub const PROBLEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("problems");

/// Problem environments keyed by `{name}`.
pub const ENVIRONMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");

/// Workers keyed by `{name}`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Heartbeat leases keyed by `{namespace}/{name}`.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
