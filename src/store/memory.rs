use super::collection::{Collection, DocumentFeed, Listeners};
use super::record::{Document, Fields, StoreTimestamp};
use super::DocumentStore;
use crate::clock::{Clock, SystemClock};
use crate::domain::OwnerId;
use crate::error::{Result, TaskError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// A write that reached the store
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert(String),
    Merge(String, Fields),
    Delete(String),
}

#[derive(Debug, Default)]
struct State {
    collection: Collection,
    listeners: Listeners,
    writes: Vec<WriteOp>,
    fail_listen: bool,
    fail_all_writes: bool,
    failing_ids: HashSet<String>,
}

/// In-process document store with owner-scoped live queries.
///
/// Server timestamps come from the injected clock. Failures can be injected
/// per document or globally to exercise error paths.
pub struct MemoryDocumentStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryDocumentStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `listen` fail
    pub fn fail_listen(&self, fail: bool) {
        self.state().fail_listen = fail;
    }

    /// Make every write fail
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_all_writes = fail;
    }

    /// Make writes to one document fail
    pub fn fail_writes_for(&self, id: &str, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_ids.insert(id.to_string());
        } else {
            state.failing_ids.remove(id);
        }
    }

    /// Writes that were applied, oldest first
    pub fn writes(&self) -> Vec<WriteOp> {
        self.state().writes.clone()
    }

    /// Fields of one document
    pub fn get(&self, id: &str) -> Option<Fields> {
        self.state().collection.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of open live queries
    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    /// End every live query, as a store does when it revokes access
    pub fn close_listeners(&self) {
        self.state().listeners = Listeners::default();
    }

    /// Insert a raw document as if written by another client
    pub fn put_raw(&self, fields: Fields) -> String {
        let now = StoreTimestamp::server_now(self.clock.as_ref());
        let mut state = self.state();
        let id = state.collection.insert(fields, now);
        let State {
            collection,
            listeners,
            ..
        } = &mut *state;
        listeners.publish(collection);
        id
    }

    /// Documents owned by `owner`
    pub fn documents_of(&self, owner: &OwnerId) -> Vec<Document> {
        self.state().collection.owned_by(owner)
    }

    fn check_write(state: &State, id: Option<&str>) -> Result<()> {
        if state.fail_all_writes || id.is_some_and(|id| state.failing_ids.contains(id)) {
            return Err(TaskError::Store("write rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn listen(&self, owner: &OwnerId) -> Result<DocumentFeed> {
        let mut state = self.state();
        if state.fail_listen {
            return Err(TaskError::Store("permission denied".to_string()));
        }
        let State {
            collection,
            listeners,
            ..
        } = &mut *state;
        Ok(listeners.register(owner, collection))
    }

    async fn insert(&self, fields: Fields) -> Result<String> {
        let now = StoreTimestamp::server_now(self.clock.as_ref());
        let mut state = self.state();
        Self::check_write(&state, None)?;
        let State {
            collection,
            listeners,
            writes,
            ..
        } = &mut *state;
        let id = collection.insert(fields, now);
        writes.push(WriteOp::Insert(id.clone()));
        listeners.publish(collection);
        Ok(id)
    }

    async fn merge(&self, owner: &OwnerId, id: &str, fields: Fields) -> Result<()> {
        let now = StoreTimestamp::server_now(self.clock.as_ref());
        let mut state = self.state();
        Self::check_write(&state, Some(id))?;
        let State {
            collection,
            listeners,
            writes,
            ..
        } = &mut *state;
        collection.merge(owner, id, fields.clone(), now)?;
        writes.push(WriteOp::Merge(id.to_string(), fields));
        listeners.publish(collection);
        Ok(())
    }

    async fn delete(&self, owner: &OwnerId, id: &str) -> Result<()> {
        let mut state = self.state();
        Self::check_write(&state, Some(id))?;
        let State {
            collection,
            listeners,
            writes,
            ..
        } = &mut *state;
        collection.delete(owner, id)?;
        writes.push(WriteOp::Delete(id.to_string()));
        listeners.publish(collection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::record::{FIELD_OWNER_ID, FIELD_UPDATED_AT};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::Value;

    fn alice() -> OwnerId {
        OwnerId::new("alice")
    }

    fn owned(owner: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert(FIELD_OWNER_ID.to_string(), Value::from(owner));
        fields
    }

    #[tokio::test]
    async fn test_listen_delivers_current_then_changes() {
        let store = MemoryDocumentStore::default();
        store.put_raw(owned("alice"));

        let mut feed = store.listen(&OwnerId::new("alice")).await.unwrap();
        assert_eq!(feed.recv().await.unwrap().len(), 1);

        store.insert(owned("alice")).await.unwrap();
        assert_eq!(feed.recv().await.unwrap().len(), 2);

        // Other owners' writes still publish, but the result set is unchanged
        store.insert(owned("bob")).await.unwrap();
        assert_eq!(feed.recv().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_merge_uses_server_clock() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        let store = MemoryDocumentStore::new(Arc::new(clock.clone()));
        let id = store.insert(owned("alice")).await.unwrap();

        clock.advance(Duration::seconds(30));
        store.merge(&alice(), &id, Fields::new()).await.unwrap();

        let fields = store.get(&id).unwrap();
        assert_eq!(
            StoreTimestamp::from_value(&fields[FIELD_UPDATED_AT]),
            Some(StoreTimestamp::new(1_714_554_030, 0))
        );
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryDocumentStore::default();
        let id = store.insert(owned("alice")).await.unwrap();

        store.fail_writes_for(&id, true);
        assert!(matches!(
            store.merge(&alice(), &id, Fields::new()).await,
            Err(TaskError::Store(_))
        ));
        store.fail_writes_for(&id, false);
        store.merge(&alice(), &id, Fields::new()).await.unwrap();

        store.fail_writes(true);
        assert!(store.insert(owned("alice")).await.is_err());
        assert_eq!(store.writes().len(), 2);

        store.fail_listen(true);
        assert!(store.listen(&OwnerId::new("alice")).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryDocumentStore::default();
        assert!(matches!(store.delete(&alice(), "ghost").await, Err(TaskError::NotFound(_))));
    }
}
