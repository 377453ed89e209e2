//! Incremental maintenance of the actor index.
//!
//! Every mutation keeps one invariant: the stored rows equal what a
//! from-scratch derivation over all tuples and definitions would produce.
//! Inserts run a monotone closure (new rows are pushed across outbound
//! edges until nothing new appears), so the result does not depend on the
//! order tuples arrive in. Removals purge the affected downstream region
//! and re-derive it from the tuples that remain.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{RebacError, Result};
use crate::models::*;
use crate::storage::{DefinitionRepository, IndexRepository, RelationshipRepository};

/// Definitions fetched once per mutation; `None` records a known miss.
type DefinitionCache = HashMap<String, Option<ResourceDefinition>>;

/// Maintains the actor index rows that back O(1)-shaped permission checks:
/// - Direct relation rows for every tuple
/// - Bare-term permission rows (`edit = [owner]`)
/// - Arrow-term propagation across relation edges (`parent->edit`)
/// - Scoped recomputation after tuple removal
pub struct IndexController {
    definitions: Arc<dyn DefinitionRepository>,
    relationships: Arc<dyn RelationshipRepository>,
    index: Arc<dyn IndexRepository>,
    // All index mutations run under this lock; permission checks do not.
    write_lock: Mutex<()>,
}

impl IndexController {
    pub fn new(
        definitions: Arc<dyn DefinitionRepository>,
        relationships: Arc<dyn RelationshipRepository>,
        index: Arc<dyn IndexRepository>,
    ) -> Self {
        Self {
            definitions,
            relationships,
            index,
            write_lock: Mutex::new(()),
        }
    }

    /// Materializes every row implied by one relation tuple. The tuple must
    /// already be stored so the closure can traverse it.
    pub async fn construct_relation_index(
        &self,
        subject: &str,
        relation: &str,
        object: &str,
    ) -> Result<()> {
        let subject_ref = EntityRef::parse(subject)?;
        let object_ref = EntityRef::parse(object)?;
        let _guard = self.write_lock.lock().await;
        let mut cache = DefinitionCache::new();

        if self
            .definition_for(&mut cache, &object_ref.entity_type)
            .await?
            .is_none()
        {
            return Err(RebacError::NotFound(format!(
                "resource definition '{}'",
                object_ref.entity_type
            )));
        }

        let inserted = self
            .index_tuple(&subject_ref, relation, &object_ref, &mut cache)
            .await?;
        debug!(subject, relation, object, inserted, "indexed relation tuple");
        Ok(())
    }

    /// Unwinds one removed tuple: purge everything reachable from the object
    /// and re-derive that region from the tuples that remain.
    pub async fn remove_relation(&self, subject: &str, relation: &str, object: &str) -> Result<()> {
        EntityRef::parse(subject)?;
        let object_ref = EntityRef::parse(object)?;
        let _guard = self.write_lock.lock().await;
        let mut cache = DefinitionCache::new();

        // 1. Rows anywhere downstream of the object may have traveled over
        //    the removed edge.
        let affected = self.downstream_of(&object_ref).await?;
        for entity in &affected {
            self.index
                .delete_for_entity(&entity.entity_type, &entity.entity_id)
                .await?;
        }

        // 2. Re-derive the purged region. Derivations entering from outside
        //    the region are pulled back in by the arrow terms; derivations
        //    inside it converge through the closure.
        let mut restored = 0;
        for entity in &affected {
            let entity_key = entity.to_string();
            let inbound = self
                .relationships
                .find(&RelationFilter::for_resource(&entity_key))
                .await?;
            for tuple in inbound {
                let tuple_subject = EntityRef::parse(&tuple.subject)?;
                let tuple_object = EntityRef::parse(&tuple.resource)?;
                restored += self
                    .index_tuple(&tuple_subject, &tuple.relation, &tuple_object, &mut cache)
                    .await?;
            }
        }

        debug!(
            subject,
            relation,
            object,
            affected = affected.len(),
            restored,
            "recomputed index after tuple removal"
        );
        Ok(())
    }

    /// Drops and rebuilds every row whose entity side belongs to the type,
    /// after its definition changed.
    pub async fn reindex_resource(&self, type_name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut cache = DefinitionCache::new();

        let purged = self.index.delete_by_entity_type(type_name).await?;
        let tuples = self
            .relationships
            .find(&RelationFilter::for_resource_type(type_name))
            .await?;
        let total = tuples.len();

        let mut inserted = 0;
        for tuple in tuples {
            let subject_ref = EntityRef::parse(&tuple.subject)?;
            let object_ref = EntityRef::parse(&tuple.resource)?;
            inserted += self
                .index_tuple(&subject_ref, &tuple.relation, &object_ref, &mut cache)
                .await?;
        }

        info!(
            resource = type_name,
            purged,
            tuples = total,
            inserted,
            "reindexed resource type"
        );
        Ok(())
    }

    /// Purges every row referencing the type on either side, part of the
    /// definition deletion cascade.
    pub async fn remove_resource(&self, type_name: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let removed = self.index.delete_by_type(type_name).await?;
        info!(resource = type_name, removed, "purged actor index rows for resource type");
        Ok(removed)
    }

    /// Single-row lookup: no graph traversal happens here.
    pub async fn check_permission(
        &self,
        subject: &str,
        permission: &str,
        resource: &str,
    ) -> Result<bool> {
        let subject_ref = EntityRef::parse(subject)?;
        let resource_ref = EntityRef::parse(resource)?;
        ensure_token(permission, "permission")?;

        let entity = format!("{resource_ref}#{permission}");
        self.index
            .exists(&entity, &subject_ref.entity_type, &subject_ref.entity_id)
            .await
    }

    /// Raw row access for introspection and tooling.
    pub async fn find_entries(&self, filter: &IndexFilter) -> Result<Vec<ActorIndexEntry>> {
        self.index.find(filter).await
    }

    /// Seeds the rows implied by one tuple, then closes over outbound edges.
    /// A missing object definition contributes nothing; removal paths hit
    /// this for tuples whose type was already unregistered.
    async fn index_tuple(
        &self,
        subject_ref: &EntityRef,
        relation: &str,
        object_ref: &EntityRef,
        cache: &mut DefinitionCache,
    ) -> Result<u64> {
        let Some(object_def) = self
            .definition_for(cache, &object_ref.entity_type)
            .await?
        else {
            return Ok(0);
        };

        // 1. The direct relation row.
        let mut seed = vec![ActorIndexEntry::new(object_ref, relation, subject_ref, relation)];

        // 2. Permission rows on the object itself. Bare terms match the new
        //    relation directly; arrow terms pull grants already held on the
        //    subject-side entity across the new edge.
        for (permission, terms) in &object_def.permissions {
            for raw in terms {
                match PermissionTerm::parse(raw) {
                    Ok(PermissionTerm::Relation(term_relation)) if term_relation == relation => {
                        seed.push(ActorIndexEntry::new(
                            object_ref, permission, subject_ref, relation,
                        ));
                    }
                    Ok(PermissionTerm::Arrow {
                        relation: term_relation,
                        permission: source_permission,
                    }) if term_relation == relation => {
                        let source = format!("{subject_ref}#{source_permission}");
                        for held in self.index.find_by_entity(&source).await? {
                            seed.push(ActorIndexEntry::carried(object_ref, permission, &held));
                        }
                    }
                    Ok(_) => {}
                    Err(err) => debug!(
                        resource = %object_def.name,
                        term = raw.as_str(),
                        "skipping malformed permission term: {err}"
                    ),
                }
            }
        }

        self.close_over(seed, cache).await
    }

    /// Inserts the seed rows, then pushes every newly materialized grant
    /// across outbound edges until a fixpoint. Dedup on the `(entity,
    /// subject)` key bounds the loop by the size of the derived set.
    async fn close_over(
        &self,
        seed: Vec<ActorIndexEntry>,
        cache: &mut DefinitionCache,
    ) -> Result<u64> {
        let mut inserted = 0;
        let mut work: VecDeque<ActorIndexEntry> = VecDeque::new();

        for row in seed {
            if self.index.insert(row.clone()).await? {
                inserted += 1;
                work.push_back(row);
            }
        }

        while let Some(row) = work.pop_front() {
            let (entity_ref, grant) = split_grant(&row.entity)?;
            let edges = self
                .relationships
                .find(&RelationFilter::for_subject(&entity_ref.to_string()))
                .await?;
            for edge in edges {
                let target_ref = EntityRef::parse(&edge.resource)?;
                let Some(target_def) = self
                    .definition_for(cache, &target_ref.entity_type)
                    .await?
                else {
                    continue;
                };
                for (permission, terms) in &target_def.permissions {
                    for raw in terms {
                        let Ok(PermissionTerm::Arrow {
                            relation,
                            permission: source_permission,
                        }) = PermissionTerm::parse(raw)
                        else {
                            continue;
                        };
                        if relation == edge.relation && source_permission == grant {
                            let carried =
                                ActorIndexEntry::carried(&target_ref, permission, &row);
                            if self.index.insert(carried.clone()).await? {
                                inserted += 1;
                                work.push_back(carried);
                            }
                        }
                    }
                }
            }
        }

        Ok(inserted)
    }

    /// Entities reachable from `start` over stored tuples, `start` first.
    /// The visited set makes cycles terminate.
    async fn downstream_of(&self, start: &EntityRef) -> Result<Vec<EntityRef>> {
        let mut seen = HashSet::from([start.to_string()]);
        let mut order = vec![start.clone()];
        let mut work = VecDeque::from([start.clone()]);

        while let Some(entity) = work.pop_front() {
            let outbound = self
                .relationships
                .find(&RelationFilter::for_subject(&entity.to_string()))
                .await?;
            for edge in outbound {
                if seen.insert(edge.resource.clone()) {
                    let target = EntityRef::parse(&edge.resource)?;
                    order.push(target.clone());
                    work.push_back(target);
                }
            }
        }

        Ok(order)
    }

    async fn definition_for(
        &self,
        cache: &mut DefinitionCache,
        name: &str,
    ) -> Result<Option<ResourceDefinition>> {
        if !cache.contains_key(name) {
            let definition = self.definitions.find_by_name(name).await?;
            cache.insert(name.to_string(), definition);
        }
        Ok(cache.get(name).cloned().flatten())
    }
}

fn split_grant(entity: &str) -> Result<(EntityRef, String)> {
    match parse_composite(entity)? {
        (entity_ref, Some(grant)) => Ok((entity_ref, grant)),
        (entity_ref, None) => Err(RebacError::Internal(anyhow!(
            "actor index entity '{entity_ref}' is missing its grant suffix"
        ))),
    }
}
