//! Resource definition lifecycle: validation, version-gated updates,
//! reindexing and the deletion cascade.

use ahash::RandomState;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{RebacError, Result};
use crate::events::{emit, EventPublisher, TOPIC_RESOURCE_CREATED, TOPIC_RESOURCE_UPDATED};
use crate::index::IndexController;
use crate::models::*;
use crate::relations::RelationsService;
use crate::storage::DefinitionRepository;

/// Per-name write locks shared by the definition and relation services.
///
/// Registration, version-gated updates and the deletion cascade hold the
/// lock of the definition they touch. Relation creation holds the locks of
/// every type the new tuples reference, so a deletion cascade cannot run
/// between a tuple's validation and its persistence and leave rows behind
/// that point at a type which no longer exists.
pub struct DefinitionLocks {
    locks: DashMap<String, Arc<Mutex<()>>, RandomState>,
}

impl DefinitionLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub(crate) fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires the lock of every distinct name. Names are sorted first so
    /// concurrent multi-lock holders take them in one global order and
    /// cannot deadlock each other.
    pub(crate) async fn lock_all(&self, mut names: Vec<String>) -> Vec<OwnedMutexGuard<()>> {
        names.sort();
        names.dedup();
        let mut guards = Vec::with_capacity(names.len());
        for name in &names {
            guards.push(self.lock_for(name).lock_owned().await);
        }
        guards
    }
}

impl Default for DefinitionLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Write and read path for resource definitions.
///
/// Writes to one definition serialize on its per-name lock, which makes the
/// version gate atomic: of two racing updates carrying the same version one
/// wins and the other settles as acknowledged or conflicting. The locks are
/// shared with [`RelationsService`], so the deletion cascade and a relation
/// write referencing the type never interleave.
pub struct ResourceService {
    definitions: Arc<dyn DefinitionRepository>,
    relations: Arc<RelationsService>,
    index: Arc<IndexController>,
    events: Arc<dyn EventPublisher>,
    locks: Arc<DefinitionLocks>,
}

impl ResourceService {
    pub fn new(
        definitions: Arc<dyn DefinitionRepository>,
        relations: Arc<RelationsService>,
        index: Arc<IndexController>,
        events: Arc<dyn EventPublisher>,
        locks: Arc<DefinitionLocks>,
    ) -> Self {
        Self {
            definitions,
            relations,
            index,
            events,
            locks,
        }
    }

    /// Registers a definition. When the name is already taken the call turns
    /// into a version-gated update of the existing definition.
    pub async fn create_resource(
        &self,
        request: ResourceDefinitionRequest,
    ) -> Result<DefinitionOutcome> {
        ensure_token(&request.name, "resource name")?;
        let lock = self.locks.lock_for(&request.name);
        let _guard = lock.lock().await;

        if self.definitions.find_by_name(&request.name).await?.is_some() {
            let name = request.name.clone();
            return self.update_locked(&name, request).await;
        }

        self.validate_relations(&request).await?;
        self.validate_permissions(&request).await?;

        let stored = self
            .definitions
            .insert(ResourceDefinition::from_request(request))
            .await?;
        emit(self.events.as_ref(), TOPIC_RESOURCE_CREATED, &stored).await;
        info!(
            resource = stored.name.as_str(),
            version = stored.version,
            "registered resource definition"
        );
        Ok(DefinitionOutcome {
            resource_definition: stored,
            status: UpdateStatus::Processed,
        })
    }

    /// Applies a definition update through the version gate.
    pub async fn update_resource_definition(
        &self,
        selector: DefinitionSelector,
        request: ResourceDefinitionRequest,
    ) -> Result<DefinitionOutcome> {
        let current = match &selector {
            DefinitionSelector::Name(name) => self.definitions.find_by_name(name).await?,
            DefinitionSelector::Id(id) => self.definitions.find_by_id(*id).await?,
        }
        .ok_or_else(|| RebacError::NotFound(format!("resource definition with {selector}")))?;

        let lock = self.locks.lock_for(&current.name);
        let _guard = lock.lock().await;
        self.update_locked(&current.name, request).await
    }

    /// Unregisters a definition: first every tuple referencing the type goes,
    /// each unwound from the index, then any remaining index rows for the
    /// type, then the definition itself.
    pub async fn delete_resource(&self, name: &str) -> Result<()> {
        let lock = self.locks.lock_for(name);
        let _guard = lock.lock().await;

        if self.definitions.find_by_name(name).await?.is_none() {
            return Err(RebacError::NotFound(format!(
                "resource definition '{name}'"
            )));
        }

        let removed = self.relations.remove_resource(name).await?;
        self.index.remove_resource(name).await?;
        self.definitions.delete_by_name(name).await?;
        info!(
            resource = name,
            relations_removed = removed.len(),
            "deleted resource definition"
        );
        Ok(())
    }

    pub async fn find_resource_definition(&self, name: &str) -> Result<ResourceDefinition> {
        self.definitions
            .find_by_name(name)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("resource definition '{name}'")))
    }

    pub async fn find_resource_definition_by_id(&self, id: Uuid) -> Result<ResourceDefinition> {
        self.definitions
            .find_by_id(id)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("resource definition with id '{id}'")))
    }

    /// Version gate plus persistence, called with the per-name lock held.
    async fn update_locked(
        &self,
        name: &str,
        request: ResourceDefinitionRequest,
    ) -> Result<DefinitionOutcome> {
        // Re-read under the lock so racing writers serialize cleanly.
        let current = self
            .definitions
            .find_by_name(name)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("resource definition '{name}'")))?;

        if request.name != current.name {
            return Err(RebacError::InvalidArgument(format!(
                "resource definition names are immutable ('{}' cannot become '{}')",
                current.name, request.name
            )));
        }

        if request.version < current.version {
            debug!(
                resource = name,
                incoming = request.version,
                current = current.version,
                "ignored stale definition update"
            );
            return Ok(DefinitionOutcome {
                resource_definition: current,
                status: UpdateStatus::Ignored,
            });
        }

        if request.version == current.version {
            if current.body_matches(&request) {
                return Ok(DefinitionOutcome {
                    resource_definition: current,
                    status: UpdateStatus::Acknowledged,
                });
            }
            return Err(RebacError::Conflict(format!(
                "a divergent definition of '{name}' is already registered at version {}",
                current.version
            )));
        }

        self.validate_relations(&request).await?;
        self.validate_permissions(&request).await?;

        let stored = self.definitions.replace(current.apply(request)).await?;
        self.index.reindex_resource(&stored.name).await?;
        emit(self.events.as_ref(), TOPIC_RESOURCE_UPDATED, &stored).await;
        info!(
            resource = stored.name.as_str(),
            version = stored.version,
            "updated resource definition"
        );
        Ok(DefinitionOutcome {
            resource_definition: stored,
            status: UpdateStatus::Processed,
        })
    }

    /// Every non-wildcard subject type must be registered. The type under
    /// validation may reference itself, including on first registration.
    async fn validate_relations(&self, request: &ResourceDefinitionRequest) -> Result<()> {
        let mut referenced: BTreeSet<String> = BTreeSet::new();
        for (relation, allowed) in &request.relations {
            ensure_token(relation, "relation name")?;
            for subject_type in allowed {
                if subject_type.as_str() == WILDCARD_SUBJECT || subject_type == &request.name {
                    continue;
                }
                ensure_token(subject_type, "allowed subject type")?;
                referenced.insert(subject_type.clone());
            }
        }
        if referenced.is_empty() {
            return Ok(());
        }

        let names: Vec<String> = referenced.iter().cloned().collect();
        let found = self.definitions.find_by_names(&names).await?;
        let missing: Vec<String> = referenced
            .into_iter()
            .filter(|name| !found.iter().any(|definition| &definition.name == name))
            .collect();
        if !missing.is_empty() {
            return Err(RebacError::NotFound(format!(
                "related resource definitions not registered: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Bare terms must name a declared relation. Arrow terms must name a
    /// declared relation whose non-wildcard target types all define the
    /// target permission; self-targets resolve against the payload itself.
    async fn validate_permissions(&self, request: &ResourceDefinitionRequest) -> Result<()> {
        for (permission, terms) in &request.permissions {
            ensure_token(permission, "permission name")?;
            for raw in terms {
                match PermissionTerm::parse(raw)? {
                    PermissionTerm::Relation(relation) => {
                        if !request.relations.contains_key(&relation) {
                            return Err(RebacError::InvalidArgument(format!(
                                "permission term '{raw}' references undeclared relation '{relation}'"
                            )));
                        }
                    }
                    PermissionTerm::Arrow {
                        relation,
                        permission: target,
                    } => {
                        let Some(allowed) = request.relations.get(&relation) else {
                            return Err(RebacError::InvalidArgument(format!(
                                "permission term '{raw}' references undeclared relation '{relation}'"
                            )));
                        };
                        let targets: Vec<String> = allowed
                            .iter()
                            .filter(|subject_type| subject_type.as_str() != WILDCARD_SUBJECT)
                            .cloned()
                            .collect();
                        let lookup: Vec<String> = targets
                            .iter()
                            .filter(|subject_type| **subject_type != request.name)
                            .cloned()
                            .collect();
                        let found = self.definitions.find_by_names(&lookup).await?;
                        for subject_type in &targets {
                            let grants = if *subject_type == request.name {
                                request.permissions.contains_key(&target)
                            } else {
                                found
                                    .iter()
                                    .find(|definition| &definition.name == subject_type)
                                    .map(|definition| definition.permissions.contains_key(&target))
                                    .unwrap_or(false)
                            };
                            if !grants {
                                return Err(RebacError::RelationNotAllowed(format!(
                                    "permission term '{raw}': resource '{subject_type}' does not define permission '{target}'"
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

}
