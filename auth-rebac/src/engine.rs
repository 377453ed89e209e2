//! Engine facade wiring storage, the index controller, the ingestion queue,
//! and the relation/definition services behind one handle.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::RebacConfig;
use crate::error::Result;
use crate::events::{EventPublisher, NullEventBus};
use crate::index::IndexController;
use crate::migrations::{MigrationReport, MigrationRunner};
use crate::models::{
    ActorIndexEntry, Consistency, DefinitionOutcome, DefinitionSelector, IndexFilter,
    RelationFilter, RelationOrder, RelationsPage, Relationship, ResourceDefinition,
    ResourceDefinitionRequest,
};
use crate::queue::{IngestionQueue, QueueStats};
use crate::relations::RelationsService;
use crate::resources::{DefinitionLocks, ResourceService};
use crate::storage::memory::{
    MemoryDefinitionRepository, MemoryIndexRepository, MemoryRelationshipRepository,
};
use crate::storage::{DefinitionRepository, IndexRepository, RelationshipRepository};

/// Relationship-based access control engine.
///
/// Owns the full wiring: repositories, the actor index controller, the batch
/// ingestion queue, and the services on top. Cheap to share behind an `Arc`;
/// every operation takes `&self`.
pub struct RebacEngine {
    relations: Arc<RelationsService>,
    resources: Arc<ResourceService>,
    index: Arc<IndexController>,
    queue: Arc<IngestionQueue>,
    migrations: MigrationRunner,
}

impl RebacEngine {
    pub fn new(
        definitions: Arc<dyn DefinitionRepository>,
        relationships: Arc<dyn RelationshipRepository>,
        index_store: Arc<dyn IndexRepository>,
        events: Arc<dyn EventPublisher>,
        config: RebacConfig,
    ) -> Self {
        let index = Arc::new(IndexController::new(
            definitions.clone(),
            relationships.clone(),
            index_store.clone(),
        ));
        let queue = Arc::new(IngestionQueue::new(index.clone(), &config));
        let locks = Arc::new(DefinitionLocks::new());
        let relations = Arc::new(RelationsService::new(
            definitions.clone(),
            relationships.clone(),
            index.clone(),
            queue.clone(),
            events.clone(),
            locks.clone(),
        ));
        let resources = Arc::new(ResourceService::new(
            definitions,
            relations.clone(),
            index.clone(),
            events,
            locks,
        ));
        let migrations = MigrationRunner::new(relationships, index_store, &config);

        Self {
            relations,
            resources,
            index,
            queue,
            migrations,
        }
    }

    /// Fully in-memory engine with default configuration and no event bus.
    /// The storage backend for tests, examples, and single-process embeds.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryDefinitionRepository::new()),
            Arc::new(MemoryRelationshipRepository::new()),
            Arc::new(MemoryIndexRepository::new()),
            Arc::new(NullEventBus),
            RebacConfig::default(),
        )
    }

    // =========================================================================
    // Relation tuples
    // =========================================================================

    /// Creates one relation tuple and indexes it before returning.
    pub async fn create_relation(
        &self,
        subject: &str,
        relation: &str,
        object: &str,
    ) -> Result<Relationship> {
        self.relations.create_relation(subject, relation, object).await
    }

    /// Creates one tuple per resource, all-or-nothing. Index maintenance goes
    /// through the ingestion queue; `Consistency::Strong` waits for it.
    pub async fn create_relations(
        &self,
        subject: &str,
        relation: &str,
        resources: &[String],
        consistency: Consistency,
    ) -> Result<Vec<Relationship>> {
        self.relations
            .create_relations(subject, relation, resources, consistency)
            .await
    }

    pub async fn get_relation(&self, id: Uuid) -> Result<Relationship> {
        self.relations.get_relation(id).await
    }

    pub async fn get_relation_by_key(
        &self,
        subject: &str,
        relation: &str,
        object: &str,
    ) -> Result<Option<Relationship>> {
        self.relations
            .get_relation_by_key(subject, relation, object)
            .await
    }

    /// Lists tuples matching the query with the total match count.
    pub async fn get_relations(
        &self,
        query: &RelationFilter,
        skip: u64,
        limit: Option<u64>,
        order: Option<RelationOrder>,
    ) -> Result<RelationsPage> {
        self.relations.find_relations(query, skip, limit, order).await
    }

    pub async fn delete_relation(
        &self,
        subject: &str,
        relation: &str,
        object: &str,
    ) -> Result<()> {
        self.relations.delete_relation(subject, relation, object).await
    }

    pub async fn delete_relation_by_id(&self, id: Uuid) -> Result<()> {
        self.relations.delete_relation_by_id(id).await
    }

    /// Deletes every tuple matching the filter; errors when nothing matches.
    pub async fn delete_all_relations(&self, query: &RelationFilter) -> Result<u64> {
        self.relations.delete_all_relations(query).await
    }

    // =========================================================================
    // Resource definitions
    // =========================================================================

    /// Registers a definition, or version-gates an update when the name is
    /// already taken.
    pub async fn create_resource(
        &self,
        request: ResourceDefinitionRequest,
    ) -> Result<DefinitionOutcome> {
        self.resources.create_resource(request).await
    }

    pub async fn update_resource_definition(
        &self,
        selector: DefinitionSelector,
        request: ResourceDefinitionRequest,
    ) -> Result<DefinitionOutcome> {
        self.resources
            .update_resource_definition(selector, request)
            .await
    }

    /// Unregisters a definition together with its tuples and index rows.
    pub async fn delete_resource(&self, name: &str) -> Result<()> {
        self.resources.delete_resource(name).await
    }

    pub async fn get_resource(&self, name: &str) -> Result<ResourceDefinition> {
        self.resources.find_resource_definition(name).await
    }

    pub async fn get_resource_by_id(&self, id: Uuid) -> Result<ResourceDefinition> {
        self.resources.find_resource_definition_by_id(id).await
    }

    // =========================================================================
    // Permission checks and index access
    // =========================================================================

    /// True when the subject holds the permission (or relation) on the
    /// resource. A single index lookup, no graph traversal.
    pub async fn check_permission(
        &self,
        subject: &str,
        permission: &str,
        resource: &str,
    ) -> Result<bool> {
        self.index.check_permission(subject, permission, resource).await
    }

    /// Raw actor index rows for introspection and tooling.
    pub async fn find_index_entries(&self, filter: &IndexFilter) -> Result<Vec<ActorIndexEntry>> {
        self.index.find_entries(filter).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Backfills structured fields on legacy records. Run at startup before
    /// serving traffic; re-running is a no-op.
    pub async fn run_migrations(&self) -> Result<MigrationReport> {
        self.migrations.run().await
    }

    /// Waits until every batch queued so far has been indexed.
    pub async fn flush_index(&self) -> Result<()> {
        self.queue.flush().await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Stops the ingestion worker after draining queued batches. Batch writes
    /// fail once shutdown begins; the rest of the engine stays usable.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.shutdown().await
    }
}
