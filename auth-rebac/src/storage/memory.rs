//! DashMap-backed repositories for testing, development and single-node use.
//!
//! Scans stand in for the secondary indexes a database deployment would
//! carry; the natural keys (definition name, computed tuple, entity+subject)
//! are the only hard invariants.

use ahash::RandomState;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{RebacError, Result};
use crate::models::*;
use crate::storage::{DefinitionRepository, IndexRepository, RelationshipRepository};

/// In-memory resource definition store keyed by type name.
pub struct MemoryDefinitionRepository {
    definitions: DashMap<String, ResourceDefinition, RandomState>,
}

impl MemoryDefinitionRepository {
    pub fn new() -> Self {
        Self {
            definitions: DashMap::with_hasher(RandomState::new()),
        }
    }
}

impl Default for MemoryDefinitionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DefinitionRepository for MemoryDefinitionRepository {
    async fn insert(&self, definition: ResourceDefinition) -> Result<ResourceDefinition> {
        match self.definitions.entry(definition.name.clone()) {
            Entry::Occupied(_) => Err(RebacError::AlreadyExists(format!(
                "resource definition '{}'",
                definition.name
            ))),
            Entry::Vacant(slot) => {
                slot.insert(definition.clone());
                Ok(definition)
            }
        }
    }

    async fn replace(&self, definition: ResourceDefinition) -> Result<ResourceDefinition> {
        match self.definitions.entry(definition.name.clone()) {
            Entry::Occupied(mut slot) => {
                slot.insert(definition.clone());
                Ok(definition)
            }
            Entry::Vacant(_) => Err(RebacError::NotFound(format!(
                "resource definition '{}'",
                definition.name
            ))),
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ResourceDefinition>> {
        Ok(self.definitions.get(name).map(|entry| entry.value().clone()))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ResourceDefinition>> {
        Ok(self
            .definitions
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| entry.value().clone()))
    }

    async fn find_by_names(&self, names: &[String]) -> Result<Vec<ResourceDefinition>> {
        Ok(self
            .definitions
            .iter()
            .filter(|entry| names.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete_by_name(&self, name: &str) -> Result<bool> {
        Ok(self.definitions.remove(name).is_some())
    }
}

/// In-memory relation tuple store keyed by computed tuple.
pub struct MemoryRelationshipRepository {
    relationships: DashMap<String, Relationship, RandomState>,
    // Serializes multi-key writes so batches stay all-or-nothing.
    write_lock: Mutex<()>,
}

impl MemoryRelationshipRepository {
    pub fn new() -> Self {
        Self {
            relationships: DashMap::with_hasher(RandomState::new()),
            write_lock: Mutex::new(()),
        }
    }
}

impl Default for MemoryRelationshipRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationshipRepository for MemoryRelationshipRepository {
    async fn insert(&self, relationship: Relationship) -> Result<Relationship> {
        let key = relationship.computed_tuple.clone();
        Ok(self.relationships.entry(key).or_insert(relationship).clone())
    }

    async fn insert_many(&self, relationships: Vec<Relationship>) -> Result<Vec<Relationship>> {
        let _guard = self.write_lock.lock().await;
        let mut seen = HashSet::new();
        for relationship in &relationships {
            if !seen.insert(relationship.computed_tuple.clone())
                || self.relationships.contains_key(&relationship.computed_tuple)
            {
                return Err(RebacError::AlreadyExists(format!(
                    "relation tuple '{}'",
                    relationship.computed_tuple
                )));
            }
        }
        for relationship in &relationships {
            self.relationships
                .insert(relationship.computed_tuple.clone(), relationship.clone());
        }
        Ok(relationships)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Relationship>> {
        Ok(self
            .relationships
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| entry.value().clone()))
    }

    async fn find_by_tuple(&self, computed_tuple: &str) -> Result<Option<Relationship>> {
        Ok(self
            .relationships
            .get(computed_tuple)
            .map(|entry| entry.value().clone()))
    }

    async fn find_by_tuples(&self, computed_tuples: &[String]) -> Result<Vec<Relationship>> {
        Ok(computed_tuples
            .iter()
            .filter_map(|tuple| self.relationships.get(tuple).map(|entry| entry.value().clone()))
            .collect())
    }

    async fn find(&self, filter: &RelationFilter) -> Result<Vec<Relationship>> {
        Ok(self
            .relationships
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_page(
        &self,
        filter: &RelationFilter,
        skip: u64,
        limit: Option<u64>,
        order: Option<RelationOrder>,
    ) -> Result<Vec<Relationship>> {
        let mut matching = self.find(filter).await?;
        matching.sort_by(|a, b| {
            let ascending = a
                .created_at
                .cmp(&b.created_at)
                .then_with(|| a.computed_tuple.cmp(&b.computed_tuple));
            match order {
                Some(RelationOrder::CreatedDesc) => ascending.reverse(),
                _ => ascending,
            }
        });
        let page = matching.into_iter().skip(skip as usize);
        Ok(match limit {
            Some(limit) => page.take(limit as usize).collect(),
            None => page.collect(),
        })
    }

    async fn count(&self, filter: &RelationFilter) -> Result<u64> {
        Ok(self
            .relationships
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .count() as u64)
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<bool> {
        let key = self
            .relationships
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| entry.key().clone());
        Ok(match key {
            Some(key) => self.relationships.remove(&key).is_some(),
            None => false,
        })
    }

    async fn delete_by_tuple(&self, computed_tuple: &str) -> Result<bool> {
        Ok(self.relationships.remove(computed_tuple).is_some())
    }

    async fn delete_matching(&self, filter: &RelationFilter) -> Result<u64> {
        let keys: Vec<String> = self
            .relationships
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.relationships.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_by_type(&self, type_name: &str) -> Result<Vec<Relationship>> {
        let keys: Vec<String> = self
            .relationships
            .iter()
            .filter(|entry| {
                entry.value().subject_type == type_name || entry.value().resource_type == type_name
            })
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, relationship)) = self.relationships.remove(&key) {
                removed.push(relationship);
            }
        }
        Ok(removed)
    }

    async fn find_unstructured(&self, limit: u64) -> Result<Vec<Relationship>> {
        let mut rows: Vec<Relationship> = self
            .relationships
            .iter()
            .filter(|entry| {
                let r = entry.value();
                r.subject_type.is_empty()
                    || r.subject_id.is_empty()
                    || r.resource_type.is_empty()
                    || r.resource_id.is_empty()
            })
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.computed_tuple.cmp(&b.computed_tuple));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn update(&self, relationship: Relationship) -> Result<Relationship> {
        let _guard = self.write_lock.lock().await;
        let old_key = self
            .relationships
            .iter()
            .find(|entry| entry.value().id == relationship.id)
            .map(|entry| entry.key().clone());
        let Some(old_key) = old_key else {
            return Err(RebacError::NotFound(format!(
                "relation '{}'",
                relationship.id
            )));
        };
        self.relationships.remove(&old_key);
        self.relationships
            .insert(relationship.computed_tuple.clone(), relationship.clone());
        Ok(relationship)
    }
}

/// In-memory actor index keyed by the `(entity, subject)` pair.
pub struct MemoryIndexRepository {
    entries: DashMap<(String, String), ActorIndexEntry, RandomState>,
}

impl MemoryIndexRepository {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(RandomState::new()),
        }
    }

    fn remove_where<F>(&self, predicate: F) -> u64
    where
        F: Fn(&ActorIndexEntry) -> bool,
    {
        let keys: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }
}

impl Default for MemoryIndexRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IndexRepository for MemoryIndexRepository {
    async fn insert(&self, entry: ActorIndexEntry) -> Result<bool> {
        match self.entries.entry(entry.key()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(true)
            }
        }
    }

    async fn find_by_entity(&self, entity: &str) -> Result<Vec<ActorIndexEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.value().entity == entity)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn exists(&self, entity: &str, subject_type: &str, subject_id: &str) -> Result<bool> {
        Ok(self.entries.iter().any(|entry| {
            let row = entry.value();
            row.entity == entity && row.subject_type == subject_type && row.subject_id == subject_id
        }))
    }

    async fn find(&self, filter: &IndexFilter) -> Result<Vec<ActorIndexEntry>> {
        let mut rows: Vec<ActorIndexEntry> = self
            .entries
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| {
            (a.entity.as_str(), a.subject.as_str()).cmp(&(b.entity.as_str(), b.subject.as_str()))
        });
        Ok(rows)
    }

    async fn delete_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<u64> {
        Ok(self.remove_where(|row| row.entity_type == entity_type && row.entity_id == entity_id))
    }

    async fn delete_by_entity_type(&self, type_name: &str) -> Result<u64> {
        Ok(self.remove_where(|row| row.entity_type == type_name))
    }

    async fn delete_by_type(&self, type_name: &str) -> Result<u64> {
        Ok(self.remove_where(|row| {
            row.entity_type == type_name || row.subject_type == type_name
        }))
    }

    async fn find_unstructured(&self, limit: u64) -> Result<Vec<ActorIndexEntry>> {
        let mut rows: Vec<ActorIndexEntry> = self
            .entries
            .iter()
            .filter(|entry| {
                let row = entry.value();
                row.entity_type.is_empty()
                    || row.entity_id.is_empty()
                    || row.subject_type.is_empty()
                    || row.subject_id.is_empty()
                    || row.relation.is_empty()
            })
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| {
            (a.entity.as_str(), a.subject.as_str()).cmp(&(b.entity.as_str(), b.subject.as_str()))
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn update(&self, entry: ActorIndexEntry) -> Result<ActorIndexEntry> {
        let old_key = self
            .entries
            .iter()
            .find(|candidate| candidate.value().id == entry.id)
            .map(|candidate| candidate.key().clone());
        let Some(old_key) = old_key else {
            return Err(RebacError::NotFound(format!("actor index row '{}'", entry.id)));
        };
        self.entries.remove(&old_key);
        self.entries.insert(entry.key(), entry.clone());
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str) -> ResourceDefinition {
        ResourceDefinition::from_request(ResourceDefinitionRequest::new(name))
    }

    fn relationship(subject: &str, relation: &str, resource: &str) -> Relationship {
        Relationship::new(
            &EntityRef::parse(subject).unwrap(),
            relation,
            &EntityRef::parse(resource).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_definition_round_trip() {
        let repo = MemoryDefinitionRepository::new();
        let stored = repo.insert(definition("document")).await.unwrap();

        assert!(repo.insert(definition("document")).await.is_err());
        assert_eq!(
            repo.find_by_name("document").await.unwrap().unwrap().id,
            stored.id
        );
        assert_eq!(
            repo.find_by_id(stored.id).await.unwrap().unwrap().name,
            "document"
        );

        assert!(repo.delete_by_name("document").await.unwrap());
        assert!(!repo.delete_by_name("document").await.unwrap());
    }

    #[tokio::test]
    async fn test_relationship_insert_is_idempotent_by_tuple() {
        let repo = MemoryRelationshipRepository::new();
        let first = repo
            .insert(relationship("user:5", "editor", "document:1"))
            .await
            .unwrap();
        let second = repo
            .insert(relationship("user:5", "editor", "document:1"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(repo.count(&RelationFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_insert_is_all_or_nothing() {
        let repo = MemoryRelationshipRepository::new();
        repo.insert(relationship("user:5", "editor", "document:1"))
            .await
            .unwrap();

        let result = repo
            .insert_many(vec![
                relationship("user:5", "editor", "document:2"),
                relationship("user:5", "editor", "document:1"),
            ])
            .await;
        assert!(matches!(result, Err(RebacError::AlreadyExists(_))));
        assert_eq!(repo.count(&RelationFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pages_are_stable_and_ordered() {
        let repo = MemoryRelationshipRepository::new();
        for id in ["a", "b", "c", "d"] {
            repo.insert(relationship("user:5", "editor", &format!("document:{id}")))
                .await
                .unwrap();
        }

        let filter = RelationFilter::for_subject("user:5");
        let page = repo
            .find_page(&filter, 1, Some(2), Some(RelationOrder::CreatedAsc))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let all_desc = repo
            .find_page(&filter, 0, None, Some(RelationOrder::CreatedDesc))
            .await
            .unwrap();
        let all_asc = repo
            .find_page(&filter, 0, None, Some(RelationOrder::CreatedAsc))
            .await
            .unwrap();
        let mut reversed = all_desc.clone();
        reversed.reverse();
        assert_eq!(all_asc, reversed);
    }

    #[tokio::test]
    async fn test_delete_by_type_matches_both_sides() {
        let repo = MemoryRelationshipRepository::new();
        repo.insert(relationship("user:5", "editor", "document:1"))
            .await
            .unwrap();
        repo.insert(relationship("document:1", "parent", "folder:1"))
            .await
            .unwrap();
        repo.insert(relationship("user:5", "member", "group:1"))
            .await
            .unwrap();

        let removed = repo.delete_by_type("document").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(repo.count(&RelationFilter::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_index_rows_deduplicate_on_entity_and_subject() {
        let repo = MemoryIndexRepository::new();
        let row = ActorIndexEntry::new(
            &EntityRef::new("document", "1"),
            "edit",
            &EntityRef::new("user", "5"),
            "owner",
        );

        assert!(repo.insert(row.clone()).await.unwrap());
        assert!(!repo.insert(row.clone()).await.unwrap());
        assert!(repo
            .exists("document:1#edit", "user", "5")
            .await
            .unwrap());
        assert!(!repo
            .exists("document:1#view", "user", "5")
            .await
            .unwrap());

        assert_eq!(repo.delete_for_entity("document", "1").await.unwrap(), 1);
        assert!(!repo
            .exists("document:1#edit", "user", "5")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_index_type_deletes_cover_both_sides() {
        let repo = MemoryIndexRepository::new();
        repo.insert(ActorIndexEntry::new(
            &EntityRef::new("document", "1"),
            "edit",
            &EntityRef::new("user", "5"),
            "owner",
        ))
        .await
        .unwrap();
        repo.insert(ActorIndexEntry::new(
            &EntityRef::new("folder", "1"),
            "view",
            &EntityRef::new("document", "2"),
            "parent",
        ))
        .await
        .unwrap();

        assert_eq!(repo.delete_by_entity_type("document").await.unwrap(), 1);
        assert_eq!(repo.delete_by_type("document").await.unwrap(), 1);
        assert!(repo.find(&IndexFilter::default()).await.unwrap().is_empty());
    }
}
