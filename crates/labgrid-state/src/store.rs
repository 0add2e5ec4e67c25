//! StateStore — redb-backed object store for labgrid.
//!
//! Provides versioned, typed CRUD over problems, environments, workers and
//! leases. All values are JSON-serialized into redb's `&[u8]` value columns.
//! Every write goes through a single redb write transaction; change
//! notifications are published on a broadcast channel once the transaction
//! has committed. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const WATCH_CAPACITY: usize = 1024;
const GENERATED_SUFFIX_LEN: usize = 5;
const GENERATE_NAME_ATTEMPTS: usize = 8;
const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Change notification published after a committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ResourceKind,
    /// Table key of the object (`{namespace}/{name}` for leases).
    pub name: String,
    pub event_type: WatchEventType,
    /// Owner references of the object as of this event.
    pub owners: Vec<OwnerReference>,
}

/// Kind-agnostic view of a stored object, used by delete and cascade.
#[derive(Serialize, Deserialize)]
struct Envelope {
    metadata: ObjectMeta,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

/// Thread-safe object store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<WatchEvent>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for kind in ResourceKind::ALL {
            txn.open_table(kind.table()).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to change notifications for every kind.
    pub fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    fn publish(&self, events: Vec<WatchEvent>) {
        for event in events {
            // No subscribers is not an error.
            let _ = self.events.send(event);
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get an object by table key.
    pub fn get<T: Resource>(&self, name: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::KIND.table()).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let obj: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(obj))
            }
            None => Ok(None),
        }
    }

    /// Get a namespaced object (leases).
    pub fn get_namespaced<T: Resource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> StateResult<Option<T>> {
        self.get(&table_key(namespace, name))
    }

    /// List every object of a kind, ordered by key.
    pub fn list<T: Resource>(&self) -> StateResult<Vec<T>> {
        self.list_filtered(|_: &T| true)
    }

    /// List objects carrying the label `key=value`.
    pub fn list_labeled<T: Resource>(&self, key: &str, value: &str) -> StateResult<Vec<T>> {
        self.list_filtered(|obj: &T| {
            obj.metadata()
                .labels
                .get(key)
                .is_some_and(|v| v == value)
        })
    }

    /// List objects whose owner references name `owner`.
    pub fn list_owned_by<T: Resource>(&self, owner: &ObjectMeta) -> StateResult<Vec<T>> {
        self.list_filtered(|obj: &T| obj.metadata().is_owned_by(&owner.uid))
    }

    /// Table keys of every object of a kind, in key order.
    pub fn keys(&self, kind: ResourceKind) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(kind.table()).map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    fn list_filtered<T: Resource>(&self, keep: impl Fn(&T) -> bool) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::KIND.table()).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let obj: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&obj) {
                results.push(obj);
            }
        }
        Ok(results)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Create a new object and return it as stored.
    ///
    /// When `name` is empty it is derived from `generate_name` plus a random
    /// suffix. Server-owned metadata (uid, versions, timestamps) is assigned
    /// here and anything the caller put there is ignored.
    pub fn create<T: Resource>(&self, mut obj: T) -> StateResult<T> {
        let kind = T::KIND;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let key;
        {
            let mut table = txn.open_table(kind.table()).map_err(map_err!(Table))?;
            let meta = obj.metadata_mut();

            if meta.name.is_empty() {
                if meta.generate_name.is_empty() {
                    return Err(StateError::Invalid(format!(
                        "{kind} needs a name or generate_name"
                    )));
                }
                let mut attempts = 0;
                loop {
                    let candidate = format!("{}{}", meta.generate_name, random_suffix());
                    let taken = table
                        .get(table_key(&meta.namespace, &candidate).as_str())
                        .map_err(map_err!(Read))?
                        .is_some();
                    if !taken {
                        meta.name = candidate;
                        break;
                    }
                    attempts += 1;
                    if attempts >= GENERATE_NAME_ATTEMPTS {
                        return Err(StateError::AlreadyExists {
                            kind: kind.as_str(),
                            name: meta.generate_name.clone(),
                        });
                    }
                }
            }

            key = meta.table_key();
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists {
                    kind: kind.as_str(),
                    name: key,
                });
            }

            meta.uid = uuid::Uuid::new_v4().to_string();
            meta.resource_version = 1;
            meta.generation = 1;
            meta.creation_timestamp = epoch_millis();
            meta.deletion_timestamp = None;

            let value = serde_json::to_vec(&obj).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %kind, %key, "object created");

        self.publish(vec![WatchEvent {
            kind,
            name: key,
            event_type: WatchEventType::Added,
            owners: obj.metadata().owner_references.clone(),
        }]);
        Ok(obj)
    }

    /// Write metadata and spec, keeping the stored status.
    ///
    /// Conditional on `resource_version`. `generation` is bumped when the spec
    /// changed. An object that is being deleted and has no finalizers left is
    /// removed.
    pub fn update<T: Resource>(&self, obj: &T) -> StateResult<T> {
        self.write_conditional(obj, |stored, mut incoming| {
            let spec_changed = !incoming.spec_eq(&stored);
            let old = stored.metadata().clone();
            incoming.take_status_from(stored);

            let meta = incoming.metadata_mut();
            meta.uid = old.uid;
            meta.creation_timestamp = old.creation_timestamp;
            meta.deletion_timestamp = old.deletion_timestamp;
            meta.generation = old.generation + u64::from(spec_changed);
            incoming
        })
    }

    /// Write status only, keeping the stored metadata and spec.
    ///
    /// Conditional on `resource_version`.
    pub fn update_status<T: Resource>(&self, obj: &T) -> StateResult<T> {
        self.write_conditional(obj, |mut stored, incoming| {
            stored.take_status_from(incoming);
            stored
        })
    }

    fn write_conditional<T: Resource>(
        &self,
        obj: &T,
        merge: impl FnOnce(T, T) -> T,
    ) -> StateResult<T> {
        let kind = T::KIND;
        let key = obj.metadata().table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let merged;
        let event_type;
        {
            let mut table = txn.open_table(kind.table()).map_err(map_err!(Table))?;
            let raw = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let Some(raw) = raw else {
                return Err(StateError::NotFound {
                    kind: kind.as_str(),
                    name: key,
                });
            };
            let stored: T = serde_json::from_slice(&raw).map_err(map_err!(Deserialize))?;

            let expected = obj.metadata().resource_version;
            let actual = stored.metadata().resource_version;
            if expected != actual {
                return Err(StateError::Conflict {
                    kind: kind.as_str(),
                    name: key,
                    expected,
                    actual,
                });
            }

            let mut next = merge(stored, obj.clone());
            let meta = next.metadata_mut();
            meta.resource_version = actual + 1;

            if meta.is_deleting() && meta.finalizers.is_empty() {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
                event_type = WatchEventType::Deleted;
            } else {
                let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                event_type = WatchEventType::Modified;
            }
            merged = next;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = %kind, %key, ?event_type, "object written");

        self.publish(vec![WatchEvent {
            kind,
            name: key,
            event_type,
            owners: merged.metadata().owner_references.clone(),
        }]);
        Ok(merged)
    }

    /// Delete an object by table key. Returns true if it existed.
    ///
    /// Objects with finalizers are only marked for deletion. Objects owned by
    /// the deleted object are deleted the same way, in the same transaction.
    pub fn delete<T: Resource>(&self, name: &str) -> StateResult<bool> {
        self.delete_kind(T::KIND, name)
    }

    /// Untyped form of [`StateStore::delete`].
    pub fn delete_kind(&self, kind: ResourceKind, name: &str) -> StateResult<bool> {
        self.delete_checked(kind, name, None)
    }

    /// Delete `obj` only if it is unchanged since it was read.
    ///
    /// Conditional on `resource_version` like [`StateStore::update`]; a
    /// stale copy fails with `Conflict` and nothing is deleted.
    pub fn delete_unchanged<T: Resource>(&self, obj: &T) -> StateResult<bool> {
        let meta = obj.metadata();
        self.delete_checked(T::KIND, &meta.table_key(), Some(meta.resource_version))
    }

    fn delete_checked(
        &self,
        kind: ResourceKind,
        name: &str,
        expected: Option<u64>,
    ) -> StateResult<bool> {
        let now = epoch_millis();
        let mut events = Vec::new();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = delete_in_txn(&txn, kind, name, expected, now, &mut events)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            kind = %kind,
            key = %name,
            existed,
            cascaded = events.len().saturating_sub(1),
            "object deleted"
        );

        self.publish(events);
        Ok(existed)
    }
}

fn delete_in_txn(
    txn: &WriteTransaction,
    kind: ResourceKind,
    key: &str,
    expected: Option<u64>,
    now: u64,
    events: &mut Vec<WatchEvent>,
) -> StateResult<bool> {
    let uid;
    {
        let mut table = txn.open_table(kind.table()).map_err(map_err!(Table))?;
        let raw = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        let Some(raw) = raw else {
            return Ok(false);
        };
        let mut envelope: Envelope = serde_json::from_slice(&raw).map_err(map_err!(Deserialize))?;
        if let Some(expected) = expected {
            let actual = envelope.metadata.resource_version;
            if expected != actual {
                return Err(StateError::Conflict {
                    kind: kind.as_str(),
                    name: key.to_string(),
                    expected,
                    actual,
                });
            }
        }
        if envelope.metadata.is_deleting() {
            // Already marked; finalizers still pending.
            return Ok(true);
        }

        uid = envelope.metadata.uid.clone();
        let owners = envelope.metadata.owner_references.clone();
        if envelope.metadata.finalizers.is_empty() {
            table.remove(key).map_err(map_err!(Write))?;
            events.push(WatchEvent {
                kind,
                name: key.to_string(),
                event_type: WatchEventType::Deleted,
                owners,
            });
        } else {
            envelope.metadata.deletion_timestamp = Some(now);
            envelope.metadata.resource_version += 1;
            let value = serde_json::to_vec(&envelope).map_err(map_err!(Serialize))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
            events.push(WatchEvent {
                kind,
                name: key.to_string(),
                event_type: WatchEventType::Modified,
                owners,
            });
        }
    }

    if uid.is_empty() {
        return Ok(true);
    }

    for dependent_kind in ResourceKind::ALL {
        // Collect keys first; the table cannot stay open across the recursion.
        let dependents: Vec<String> = {
            let table = txn
                .open_table(dependent_kind.table())
                .map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (k, value) = entry.map_err(map_err!(Read))?;
                let envelope: Envelope =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if envelope.metadata.is_owned_by(&uid) && !envelope.metadata.is_deleting() {
                    keys.push(k.value().to_string());
                }
            }
            keys
        };
        for dependent in dependents {
            delete_in_txn(txn, dependent_kind, &dependent, None, now, events)?;
        }
    }
    Ok(true)
}

fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..GENERATED_SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.random_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}
