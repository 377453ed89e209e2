use crate::{error::Result, models::*};
use async_trait::async_trait;
use uuid::Uuid;

pub mod memory;

/// Storage interface for resource definitions.
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Insert a new definition. Fails with `AlreadyExists` when the name is
    /// already registered.
    async fn insert(&self, definition: ResourceDefinition) -> Result<ResourceDefinition>;

    /// Replace the stored definition carrying the same name.
    async fn replace(&self, definition: ResourceDefinition) -> Result<ResourceDefinition>;

    async fn find_by_name(&self, name: &str) -> Result<Option<ResourceDefinition>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ResourceDefinition>>;

    /// Fetch every registered definition whose name appears in `names`.
    /// Missing names are simply absent from the result.
    async fn find_by_names(&self, names: &[String]) -> Result<Vec<ResourceDefinition>>;

    /// Returns true when a definition was removed.
    async fn delete_by_name(&self, name: &str) -> Result<bool>;
}

/// Storage interface for relation tuples.
///
/// `computed_tuple` is the natural key: implementations must never hold two
/// rows with the same computed tuple.
#[async_trait]
pub trait RelationshipRepository: Send + Sync {
    /// Idempotent write keyed by the computed tuple. When a row with the same
    /// tuple already exists it is returned unchanged.
    async fn insert(&self, relationship: Relationship) -> Result<Relationship>;

    /// All-or-nothing batch write. Fails with `AlreadyExists` when any tuple
    /// is already stored or appears twice in the batch, writing nothing.
    async fn insert_many(&self, relationships: Vec<Relationship>) -> Result<Vec<Relationship>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Relationship>>;

    async fn find_by_tuple(&self, computed_tuple: &str) -> Result<Option<Relationship>>;

    async fn find_by_tuples(&self, computed_tuples: &[String]) -> Result<Vec<Relationship>>;

    async fn find(&self, filter: &RelationFilter) -> Result<Vec<Relationship>>;

    /// Page through matches in a stable order. `limit` of `None` returns the
    /// remainder.
    async fn find_page(
        &self,
        filter: &RelationFilter,
        skip: u64,
        limit: Option<u64>,
        order: Option<RelationOrder>,
    ) -> Result<Vec<Relationship>>;

    async fn count(&self, filter: &RelationFilter) -> Result<u64>;

    /// Returns true when a row was removed.
    async fn delete_by_id(&self, id: Uuid) -> Result<bool>;

    /// Returns true when a row was removed.
    async fn delete_by_tuple(&self, computed_tuple: &str) -> Result<bool>;

    /// Removes every match and reports how many rows went away.
    async fn delete_matching(&self, filter: &RelationFilter) -> Result<u64>;

    /// Removes every tuple where the type appears on either side and returns
    /// the removed rows so callers can unwind dependent state.
    async fn delete_by_type(&self, type_name: &str) -> Result<Vec<Relationship>>;

    /// Rows whose structured fields were never backfilled, in a stable order.
    async fn find_unstructured(&self, limit: u64) -> Result<Vec<Relationship>>;

    /// Replace a stored row by id, used by backfill migrations.
    async fn update(&self, relationship: Relationship) -> Result<Relationship>;
}

/// Storage interface for materialized actor index rows.
///
/// Rows are keyed by the `(entity, subject)` pair; inserting a duplicate is a
/// no-op rather than an error so derivations can be replayed freely.
#[async_trait]
pub trait IndexRepository: Send + Sync {
    /// Returns true when the row is new, false when the key was present.
    async fn insert(&self, entry: ActorIndexEntry) -> Result<bool>;

    /// Every row granting on the given `type:id#grant` composite.
    async fn find_by_entity(&self, entity: &str) -> Result<Vec<ActorIndexEntry>>;

    /// The O(1)-shaped permission check: does any row connect the subject to
    /// the `type:id#grant` composite?
    async fn exists(&self, entity: &str, subject_type: &str, subject_id: &str) -> Result<bool>;

    async fn find(&self, filter: &IndexFilter) -> Result<Vec<ActorIndexEntry>>;

    /// Drops every grant row of one concrete entity.
    async fn delete_for_entity(&self, entity_type: &str, entity_id: &str) -> Result<u64>;

    /// Drops every row whose entity side belongs to the type.
    async fn delete_by_entity_type(&self, type_name: &str) -> Result<u64>;

    /// Drops every row referencing the type on either side.
    async fn delete_by_type(&self, type_name: &str) -> Result<u64>;

    /// Rows whose structured fields were never backfilled, in a stable order.
    async fn find_unstructured(&self, limit: u64) -> Result<Vec<ActorIndexEntry>>;

    /// Replace a stored row by id, used by backfill migrations.
    async fn update(&self, entry: ActorIndexEntry) -> Result<ActorIndexEntry>;
}
