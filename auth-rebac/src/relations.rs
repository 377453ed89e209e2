//! Relation tuple lifecycle: schema validation, persistence, index upkeep
//! and event publication.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{RebacError, Result};
use crate::events::{emit, EventPublisher, TOPIC_RELATION_CREATED};
use crate::index::IndexController;
use crate::models::*;
use crate::queue::IngestionQueue;
use crate::resources::DefinitionLocks;
use crate::storage::{DefinitionRepository, RelationshipRepository};

/// Write and read path for relation tuples. Single-tuple mutations keep the
/// actor index aligned before returning; batch writes hand the index work to
/// the ingestion queue under the requested consistency. Tuple creation holds
/// the shared definition locks of the referenced types, so it never
/// interleaves with a deletion cascade on those types.
pub struct RelationsService {
    definitions: Arc<dyn DefinitionRepository>,
    relationships: Arc<dyn RelationshipRepository>,
    index: Arc<IndexController>,
    queue: Arc<IngestionQueue>,
    events: Arc<dyn EventPublisher>,
    locks: Arc<DefinitionLocks>,
}

impl RelationsService {
    pub fn new(
        definitions: Arc<dyn DefinitionRepository>,
        relationships: Arc<dyn RelationshipRepository>,
        index: Arc<IndexController>,
        queue: Arc<IngestionQueue>,
        events: Arc<dyn EventPublisher>,
        locks: Arc<DefinitionLocks>,
    ) -> Self {
        Self {
            definitions,
            relationships,
            index,
            queue,
            events,
            locks,
        }
    }

    /// Creates one tuple and indexes it synchronously. Returns the existing
    /// row unchanged when the tuple is already stored.
    pub async fn create_relation(
        &self,
        subject: &str,
        relation: &str,
        object: &str,
    ) -> Result<Relationship> {
        let subject_ref = EntityRef::parse(subject)?;
        let object_ref = EntityRef::parse(object)?;
        ensure_token(relation, "relation")?;
        let _guards = self
            .locks
            .lock_all(vec![
                subject_ref.entity_type.clone(),
                object_ref.entity_type.clone(),
            ])
            .await;

        let computed = compute_relation_tuple(&subject_ref, relation, &object_ref);
        if let Some(existing) = self.relationships.find_by_tuple(&computed).await? {
            debug!(tuple = computed.as_str(), "relation tuple already stored");
            return Ok(existing);
        }

        self.require_definition(&subject_ref.entity_type, "subject resource definition")
            .await?;
        let object_def = self
            .require_definition(&object_ref.entity_type, "resource definition")
            .await?;
        relation_allowed(&object_def, relation, &subject_ref.entity_type)?;

        let stored = self
            .relationships
            .insert(Relationship::new(&subject_ref, relation, &object_ref))
            .await?;
        self.index
            .construct_relation_index(subject, relation, object)
            .await?;
        emit(self.events.as_ref(), TOPIC_RELATION_CREATED, &stored).await;
        info!(subject, relation, object, "created relation tuple");
        Ok(stored)
    }

    /// Creates one tuple per resource for a shared subject and relation.
    /// The batch is all-or-nothing: any stored duplicate or failed
    /// validation rejects it whole.
    pub async fn create_relations(
        &self,
        subject: &str,
        relation: &str,
        resources: &[String],
        consistency: Consistency,
    ) -> Result<Vec<Relationship>> {
        if resources.is_empty() {
            return Err(RebacError::InvalidArgument(
                "resources must not be empty".to_string(),
            ));
        }
        let subject_ref = EntityRef::parse(subject)?;
        ensure_token(relation, "relation")?;
        let mut object_refs = Vec::with_capacity(resources.len());
        for resource in resources {
            object_refs.push(EntityRef::parse(resource)?);
        }
        let mut types: Vec<String> = object_refs
            .iter()
            .map(|object_ref| object_ref.entity_type.clone())
            .collect();
        types.push(subject_ref.entity_type.clone());
        let _guards = self.locks.lock_all(types).await;

        let tuples: Vec<String> = object_refs
            .iter()
            .map(|object_ref| compute_relation_tuple(&subject_ref, relation, object_ref))
            .collect();
        let existing = self.relationships.find_by_tuples(&tuples).await?;
        if !existing.is_empty() {
            return Err(RebacError::AlreadyExists(format!(
                "{} of the requested relation tuples already exist",
                existing.len()
            )));
        }

        self.require_definition(&subject_ref.entity_type, "subject resource definition")
            .await?;
        let wanted: BTreeSet<String> = object_refs
            .iter()
            .map(|object_ref| object_ref.entity_type.clone())
            .collect();
        let names: Vec<String> = wanted.into_iter().collect();
        let found = self.definitions.find_by_names(&names).await?;
        for object_ref in &object_refs {
            let definition = found
                .iter()
                .find(|definition| definition.name == object_ref.entity_type)
                .ok_or_else(|| {
                    RebacError::NotFound(format!(
                        "resource definition '{}'",
                        object_ref.entity_type
                    ))
                })?;
            relation_allowed(definition, relation, &subject_ref.entity_type)?;
        }

        let rows: Vec<Relationship> = object_refs
            .iter()
            .map(|object_ref| Relationship::new(&subject_ref, relation, object_ref))
            .collect();
        let stored = self.relationships.insert_many(rows).await?;

        let entries: Vec<RelationEntry> = stored.iter().map(RelationEntry::from).collect();
        match consistency {
            Consistency::Eventual => self.queue.add_relation_index_job(entries).await?,
            Consistency::Strong => {
                let done = self.queue.add_relation_index_job_acked(entries).await?;
                done.await.map_err(|_| {
                    RebacError::Internal(anyhow!("index worker dropped the batch acknowledgement"))
                })?;
            }
        }

        for relationship in &stored {
            emit(self.events.as_ref(), TOPIC_RELATION_CREATED, relationship).await;
        }
        info!(
            subject,
            relation,
            count = stored.len(),
            ?consistency,
            "created relation batch"
        );
        Ok(stored)
    }

    pub async fn get_relation(&self, id: Uuid) -> Result<Relationship> {
        self.relationships
            .find_by_id(id)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("relation '{id}'")))
    }

    pub async fn get_relation_by_key(
        &self,
        subject: &str,
        relation: &str,
        object: &str,
    ) -> Result<Option<Relationship>> {
        let subject_ref = EntityRef::parse(subject)?;
        let object_ref = EntityRef::parse(object)?;
        ensure_token(relation, "relation")?;
        self.relationships
            .find_by_tuple(&compute_relation_tuple(&subject_ref, relation, &object_ref))
            .await
    }

    /// Lists tuples with the total match count. An exact subject or resource
    /// in the query shadows its type-level counterpart.
    pub async fn find_relations(
        &self,
        query: &RelationFilter,
        skip: u64,
        limit: Option<u64>,
        order: Option<RelationOrder>,
    ) -> Result<RelationsPage> {
        let filter = effective_filter(query);
        let relations = self
            .relationships
            .find_page(&filter, skip, limit, order)
            .await?;
        let count = self.relationships.count(&filter).await?;
        Ok(RelationsPage { relations, count })
    }

    pub async fn delete_relation(
        &self,
        subject: &str,
        relation: &str,
        object: &str,
    ) -> Result<()> {
        let subject_ref = EntityRef::parse(subject)?;
        let object_ref = EntityRef::parse(object)?;
        ensure_token(relation, "relation")?;

        let computed = compute_relation_tuple(&subject_ref, relation, &object_ref);
        if !self.relationships.delete_by_tuple(&computed).await? {
            return Err(RebacError::NotFound(format!("relation tuple '{computed}'")));
        }
        self.index.remove_relation(subject, relation, object).await?;
        info!(subject, relation, object, "deleted relation tuple");
        Ok(())
    }

    pub async fn delete_relation_by_id(&self, id: Uuid) -> Result<()> {
        let relationship = self.get_relation(id).await?;
        self.relationships.delete_by_id(id).await?;
        self.index
            .remove_relation(
                &relationship.subject,
                &relationship.relation,
                &relationship.resource,
            )
            .await?;
        info!(%id, "deleted relation tuple by id");
        Ok(())
    }

    /// Deletes every tuple matching the filter, unwinding each one from the
    /// index. Fails `NotFound` when nothing matches.
    pub async fn delete_all_relations(&self, query: &RelationFilter) -> Result<u64> {
        let filter = effective_filter(query);
        let matching = self.relationships.find(&filter).await?;
        if matching.is_empty() {
            return Err(RebacError::NotFound(
                "no relation tuples match the filter".to_string(),
            ));
        }

        self.relationships.delete_matching(&filter).await?;
        for relationship in &matching {
            self.index
                .remove_relation(
                    &relationship.subject,
                    &relationship.relation,
                    &relationship.resource,
                )
                .await?;
        }
        info!(removed = matching.len(), "deleted relation tuples by filter");
        Ok(matching.len() as u64)
    }

    /// Removes every tuple referencing the type on either side and unwinds
    /// each from the index. Part of the definition deletion cascade.
    pub async fn remove_resource(&self, type_name: &str) -> Result<Vec<Relationship>> {
        let removed = self.relationships.delete_by_type(type_name).await?;
        for relationship in &removed {
            self.index
                .remove_relation(
                    &relationship.subject,
                    &relationship.relation,
                    &relationship.resource,
                )
                .await?;
        }
        if !removed.is_empty() {
            info!(
                resource = type_name,
                removed = removed.len(),
                "removed relation tuples for resource type"
            );
        }
        Ok(removed)
    }

    async fn require_definition(
        &self,
        type_name: &str,
        what: &str,
    ) -> Result<ResourceDefinition> {
        self.definitions
            .find_by_name(type_name)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("{what} '{type_name}'")))
    }
}

/// A subject type is accepted when the relation declares it or declares the
/// wildcard.
pub(crate) fn relation_allowed(
    definition: &ResourceDefinition,
    relation: &str,
    subject_type: &str,
) -> Result<()> {
    let Some(allowed) = definition.relations.get(relation) else {
        return Err(RebacError::RelationNotAllowed(format!(
            "relation '{relation}' is not declared on resource '{}'",
            definition.name
        )));
    };
    if allowed
        .iter()
        .any(|candidate| candidate == WILDCARD_SUBJECT || candidate == subject_type)
    {
        return Ok(());
    }
    Err(RebacError::RelationNotAllowed(format!(
        "subject type '{subject_type}' is not allowed for relation '{relation}' on resource '{}'",
        definition.name
    )))
}

fn effective_filter(query: &RelationFilter) -> RelationFilter {
    let mut filter = RelationFilter::default();
    if query.subject.is_some() {
        filter.subject = query.subject.clone();
    } else {
        filter.subject_type = query.subject_type.clone();
    }
    filter.relation = query.relation.clone();
    if query.resource.is_some() {
        filter.resource = query.resource.clone();
    } else {
        filter.resource_type = query.resource_type.clone();
    }
    filter
}
