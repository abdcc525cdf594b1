use super::record::{
    Document, Fields, StoreTimestamp, FIELD_CREATED_AT, FIELD_OWNER_ID, FIELD_UPDATED_AT,
};
use crate::domain::OwnerId;
use crate::error::{Result, TaskError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Snapshot stream delivered to one listener
pub type DocumentFeed = mpsc::UnboundedReceiver<Vec<Document>>;

/// All documents of the `tasks` collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(default)]
    documents: BTreeMap<String, Fields>,
}

impl Collection {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Fields> {
        self.documents.get(id)
    }

    /// Add a document under a fresh id, stamping server timestamps
    pub fn insert(&mut self, mut fields: Fields, now: StoreTimestamp) -> String {
        let id = Uuid::new_v4().simple().to_string();
        fields.insert(FIELD_CREATED_AT.to_string(), now.to_value());
        fields.insert(FIELD_UPDATED_AT.to_string(), now.to_value());
        self.documents.insert(id.clone(), fields);
        id
    }

    /// Document `id` if `owner` owns it. Someone else's document reads as
    /// missing.
    fn owned_mut(&mut self, owner: &OwnerId, id: &str) -> Result<&mut Fields> {
        self.documents
            .get_mut(id)
            .filter(|fields| {
                fields.get(FIELD_OWNER_ID).and_then(|v| v.as_str()) == Some(owner.as_str())
            })
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// Merge fields into a document of `owner` and refresh `updatedAt`
    pub fn merge(
        &mut self,
        owner: &OwnerId,
        id: &str,
        fields: Fields,
        now: StoreTimestamp,
    ) -> Result<()> {
        let doc = self.owned_mut(owner, id)?;
        for (key, value) in fields {
            // createdAt and ownerId are fixed at insert
            if key != FIELD_CREATED_AT && key != FIELD_OWNER_ID {
                doc.insert(key, value);
            }
        }
        doc.insert(FIELD_UPDATED_AT.to_string(), now.to_value());
        Ok(())
    }

    /// Delete a document of `owner`
    pub fn delete(&mut self, owner: &OwnerId, id: &str) -> Result<()> {
        self.owned_mut(owner, id)?;
        self.documents.remove(id);
        Ok(())
    }

    /// Documents whose owner field matches
    pub fn owned_by(&self, owner: &OwnerId) -> Vec<Document> {
        self.documents
            .iter()
            .map(|(id, fields)| Document {
                id: id.clone(),
                fields: fields.clone(),
            })
            .filter(|doc| doc.owner() == Some(owner.as_str()))
            .collect()
    }
}

/// Live queries registered against a collection
#[derive(Debug, Default)]
pub struct Listeners {
    entries: Vec<(OwnerId, mpsc::UnboundedSender<Vec<Document>>)>,
}

impl Listeners {
    /// Register a listener and deliver its current result set right away
    pub fn register(&mut self, owner: &OwnerId, collection: &Collection) -> DocumentFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, the send cannot fail
        let _ = tx.send(collection.owned_by(owner));
        self.entries.push((owner.clone(), tx));
        rx
    }

    /// Push fresh snapshots to every listener, forgetting closed ones
    pub fn publish(&mut self, collection: &Collection) {
        self.entries
            .retain(|(owner, tx)| tx.send(collection.owned_by(owner)).is_ok());
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|(_, tx)| !tx.is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn alice() -> OwnerId {
        OwnerId::new("alice")
    }

    fn owned(owner: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert(FIELD_OWNER_ID.to_string(), Value::from(owner));
        fields
    }

    #[test]
    fn test_insert_stamps_timestamps() {
        let mut collection = Collection::default();
        let id = collection.insert(owned("alice"), StoreTimestamp::new(10, 0));
        let doc = collection.get(&id).unwrap();
        assert_eq!(doc[FIELD_CREATED_AT], StoreTimestamp::new(10, 0).to_value());
        assert_eq!(doc[FIELD_UPDATED_AT], StoreTimestamp::new(10, 0).to_value());
    }

    #[test]
    fn test_merge_refreshes_updated_at_and_keeps_created_at() {
        let mut collection = Collection::default();
        let id = collection.insert(owned("alice"), StoreTimestamp::new(10, 0));

        let mut patch = Fields::new();
        patch.insert("title".to_string(), Value::from("new"));
        patch.insert(FIELD_CREATED_AT.to_string(), StoreTimestamp::new(0, 0).to_value());
        collection.merge(&alice(), &id, patch, StoreTimestamp::new(20, 0)).unwrap();

        let doc = collection.get(&id).unwrap();
        assert_eq!(doc["title"], "new");
        assert_eq!(doc[FIELD_CREATED_AT], StoreTimestamp::new(10, 0).to_value());
        assert_eq!(doc[FIELD_UPDATED_AT], StoreTimestamp::new(20, 0).to_value());
    }

    #[test]
    fn test_merge_and_delete_missing() {
        let mut collection = Collection::default();
        assert!(matches!(
            collection.merge(&alice(), "nope", Fields::new(), StoreTimestamp::new(0, 0)),
            Err(TaskError::NotFound(_))
        ));
        assert!(matches!(collection.delete(&alice(), "nope"), Err(TaskError::NotFound(_))));
    }

    #[test]
    fn test_foreign_documents_cannot_be_changed() {
        let mut collection = Collection::default();
        let id = collection.insert(owned("bob"), StoreTimestamp::new(1, 0));

        let mut patch = Fields::new();
        patch.insert("title".to_string(), Value::from("hijacked"));
        patch.insert(FIELD_OWNER_ID.to_string(), Value::from("alice"));
        assert!(matches!(
            collection.merge(&alice(), &id, patch.clone(), StoreTimestamp::new(2, 0)),
            Err(TaskError::NotFound(_))
        ));
        assert!(matches!(collection.delete(&alice(), &id), Err(TaskError::NotFound(_))));

        // The owner cannot hand the document over either
        let bob = OwnerId::new("bob");
        collection.merge(&bob, &id, patch, StoreTimestamp::new(3, 0)).unwrap();
        let doc = collection.get(&id).unwrap();
        assert_eq!(doc[FIELD_OWNER_ID], "bob");
        assert_eq!(doc["title"], "hijacked");
        collection.delete(&bob, &id).unwrap();
        assert!(collection.is_empty());
    }

    #[test]
    fn test_owned_by_filters() {
        let mut collection = Collection::default();
        collection.insert(owned("alice"), StoreTimestamp::new(1, 0));
        collection.insert(owned("bob"), StoreTimestamp::new(2, 0));
        collection.insert(owned("alice"), StoreTimestamp::new(3, 0));

        assert_eq!(collection.owned_by(&OwnerId::new("alice")).len(), 2);
        assert_eq!(collection.owned_by(&OwnerId::new("bob")).len(), 1);
        assert!(collection.owned_by(&OwnerId::new("eve")).is_empty());
    }

    #[test]
    fn test_listeners_receive_initial_and_published_snapshots() {
        let mut collection = Collection::default();
        collection.insert(owned("alice"), StoreTimestamp::new(1, 0));
        let mut listeners = Listeners::default();

        let mut feed = listeners.register(&OwnerId::new("alice"), &collection);
        assert_eq!(feed.try_recv().unwrap().len(), 1);

        collection.insert(owned("alice"), StoreTimestamp::new(2, 0));
        listeners.publish(&collection);
        assert_eq!(feed.try_recv().unwrap().len(), 2);
    }

    #[test]
    fn test_closed_listeners_are_dropped() {
        let collection = Collection::default();
        let mut listeners = Listeners::default();
        let feed = listeners.register(&OwnerId::new("alice"), &collection);
        assert_eq!(listeners.len(), 1);

        drop(feed);
        listeners.publish(&collection);
        assert!(listeners.is_empty());
    }
}
