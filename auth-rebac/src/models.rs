use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{RebacError, Result};

/// Characters that delimit composite keys and must not appear in names.
const RESERVED_CHARS: [char; 3] = [':', '#', '@'];

/// Validates a bare name (entity type, entity id, relation or permission).
pub(crate) fn ensure_token(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        return Err(RebacError::InvalidArgument(format!(
            "{field} must not be empty"
        )));
    }
    if value.contains(&RESERVED_CHARS[..]) || value.contains("->") {
        return Err(RebacError::InvalidArgument(format!(
            "{field} '{value}' contains reserved characters"
        )));
    }
    Ok(())
}

/// A parsed `type:id` reference to a concrete entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Parses a `type:id` string. Both halves must be non-empty and free of
    /// reserved characters.
    pub fn parse(raw: &str) -> Result<Self> {
        let Some((entity_type, entity_id)) = raw.split_once(':') else {
            return Err(RebacError::InvalidArgument(format!(
                "'{raw}' is not a 'type:id' entity reference"
            )));
        };
        ensure_token(entity_type, "entity type")?;
        ensure_token(entity_id, "entity id")?;
        Ok(Self::new(entity_type, entity_id))
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Splits a composite such as `document:1#read` into its entity reference and
/// optional `#` suffix. Legacy records use this encoding for both index sides.
pub fn parse_composite(raw: &str) -> Result<(EntityRef, Option<String>)> {
    match raw.split_once('#') {
        Some((base, suffix)) => {
            ensure_token(suffix, "composite suffix")?;
            Ok((EntityRef::parse(base)?, Some(suffix.to_string())))
        }
        None => Ok((EntityRef::parse(raw)?, None)),
    }
}

/// Canonical dedup key for a relation tuple: `subject#relation@resource`.
pub fn compute_relation_tuple(subject: &EntityRef, relation: &str, resource: &EntityRef) -> String {
    format!("{subject}#{relation}@{resource}")
}

/// One term of a permission declaration: either a bare relation name or a
/// `relation->permission` indirection through related entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionTerm {
    Relation(String),
    Arrow { relation: String, permission: String },
}

impl PermissionTerm {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.split_once("->") {
            Some((relation, permission)) => {
                if permission.contains("->") {
                    return Err(RebacError::InvalidArgument(format!(
                        "permission term '{raw}' chains more than one indirection"
                    )));
                }
                ensure_token(relation, "permission term relation")?;
                ensure_token(permission, "permission term target")?;
                Ok(Self::Arrow {
                    relation: relation.to_string(),
                    permission: permission.to_string(),
                })
            }
            None => {
                ensure_token(raw, "permission term")?;
                Ok(Self::Relation(raw.to_string()))
            }
        }
    }
}

/// Subject types allowed on any relation, regardless of registration.
pub const WILDCARD_SUBJECT: &str = "*";

/// Declared schema for one resource type: which subject types each relation
/// accepts, and which terms grant each permission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub id: Uuid,
    /// Unique, immutable type name (e.g. `document`).
    pub name: String,
    /// Relation name to allowed subject type names (`*` allows any).
    pub relations: BTreeMap<String, Vec<String>>,
    /// Permission name to its granting terms.
    pub permissions: BTreeMap<String, Vec<String>>,
    /// Monotonically increasing schema version, gate for updates.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceDefinition {
    pub fn from_request(request: ResourceDefinitionRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            relations: request.relations,
            permissions: request.permissions,
            version: request.version,
            created_at: now,
            updated_at: now,
        }
    }

    /// Structural equality with a payload, ignoring generated fields.
    pub fn body_matches(&self, request: &ResourceDefinitionRequest) -> bool {
        self.name == request.name
            && self.relations == request.relations
            && self.permissions == request.permissions
    }

    /// Produces the successor revision, keeping identity and creation time.
    pub fn apply(&self, request: ResourceDefinitionRequest) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            relations: request.relations,
            permissions: request.permissions,
            version: request.version,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

/// Caller-supplied definition payload. Identifiers and timestamps are
/// generated by the engine; a missing version means version zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinitionRequest {
    pub name: String,
    #[serde(default)]
    pub relations: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub permissions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub version: u64,
}

impl ResourceDefinitionRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relations: BTreeMap::new(),
            permissions: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn relation(mut self, name: &str, allowed: &[&str]) -> Self {
        self.relations
            .insert(name.to_string(), allowed.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn permission(mut self, name: &str, terms: &[&str]) -> Self {
        self.permissions
            .insert(name.to_string(), terms.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
}

/// One stored relation tuple: `subject` holds `relation` on `resource`.
///
/// The composite `subject`/`resource` strings are the canonical `type:id`
/// forms; the structured fields back typed filtering. `computed_tuple` is the
/// natural key used for idempotent writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Uuid,
    pub subject: String,
    pub subject_type: String,
    pub subject_id: String,
    pub relation: String,
    pub resource: String,
    pub resource_type: String,
    pub resource_id: String,
    pub computed_tuple: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(subject: &EntityRef, relation: &str, resource: &EntityRef) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            subject: subject.to_string(),
            subject_type: subject.entity_type.clone(),
            subject_id: subject.entity_id.clone(),
            relation: relation.to_string(),
            resource: resource.to_string(),
            resource_type: resource.entity_type.clone(),
            resource_id: resource.entity_id.clone(),
            computed_tuple: compute_relation_tuple(subject, relation, resource),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One materialized reachability fact: the subject can exercise the grant
/// encoded in `entity` (`type:id#grant`). `subject` records where the grant
/// entered the graph (`type:id#relation`). Rows are pure derived state and
/// can always be rebuilt from relationships plus resource definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorIndexEntry {
    pub id: Uuid,
    pub entity: String,
    pub entity_type: String,
    pub entity_id: String,
    pub subject: String,
    pub subject_type: String,
    pub subject_id: String,
    pub relation: String,
    pub created_at: DateTime<Utc>,
}

impl ActorIndexEntry {
    pub fn new(entity: &EntityRef, grant: &str, subject: &EntityRef, relation: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity: format!("{entity}#{grant}"),
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            subject: format!("{subject}#{relation}"),
            subject_type: subject.entity_type.clone(),
            subject_id: subject.entity_id.clone(),
            relation: relation.to_string(),
            created_at: Utc::now(),
        }
    }

    /// A row carrying an existing subject onto another entity, produced when
    /// a grant propagates across a relation edge.
    pub fn carried(entity: &EntityRef, grant: &str, source: &ActorIndexEntry) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity: format!("{entity}#{grant}"),
            entity_type: entity.entity_type.clone(),
            entity_id: entity.entity_id.clone(),
            subject: source.subject.clone(),
            subject_type: source.subject_type.clone(),
            subject_id: source.subject_id.clone(),
            relation: source.relation.clone(),
            created_at: Utc::now(),
        }
    }

    /// Natural key: one row per `(entity, subject)` pair.
    pub fn key(&self) -> (String, String) {
        (self.entity.clone(), self.subject.clone())
    }
}

/// One unit of pending index work: a relation tuple awaiting materialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEntry {
    pub subject: String,
    pub relation: String,
    pub resource: String,
}

impl From<&Relationship> for RelationEntry {
    fn from(relationship: &Relationship) -> Self {
        Self {
            subject: relationship.subject.clone(),
            relation: relationship.relation.clone(),
            resource: relationship.resource.clone(),
        }
    }
}

/// Exact-match filter over stored relation tuples. Unset fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationFilter {
    pub subject: Option<String>,
    pub subject_type: Option<String>,
    pub relation: Option<String>,
    pub resource: Option<String>,
    pub resource_type: Option<String>,
}

impl RelationFilter {
    pub fn for_subject(subject: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            ..Self::default()
        }
    }

    pub fn for_resource(resource: &str) -> Self {
        Self {
            resource: Some(resource.to_string()),
            ..Self::default()
        }
    }

    pub fn for_resource_type(resource_type: &str) -> Self {
        Self {
            resource_type: Some(resource_type.to_string()),
            ..Self::default()
        }
    }

    pub fn matches(&self, relationship: &Relationship) -> bool {
        field_matches(&self.subject, &relationship.subject)
            && field_matches(&self.subject_type, &relationship.subject_type)
            && field_matches(&self.relation, &relationship.relation)
            && field_matches(&self.resource, &relationship.resource)
            && field_matches(&self.resource_type, &relationship.resource_type)
    }
}

/// Exact-match filter over actor index rows, for introspection and debugging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexFilter {
    pub entity: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    pub relation: Option<String>,
}

impl IndexFilter {
    pub fn matches(&self, entry: &ActorIndexEntry) -> bool {
        field_matches(&self.entity, &entry.entity)
            && field_matches(&self.entity_type, &entry.entity_type)
            && field_matches(&self.entity_id, &entry.entity_id)
            && field_matches(&self.subject_type, &entry.subject_type)
            && field_matches(&self.subject_id, &entry.subject_id)
            && field_matches(&self.relation, &entry.relation)
    }
}

fn field_matches(filter: &Option<String>, value: &str) -> bool {
    filter.as_deref().map_or(true, |wanted| wanted == value)
}

/// Sort order for relation listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationOrder {
    CreatedAsc,
    CreatedDesc,
}

/// How a definition write was settled by the version gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    /// The payload was validated, persisted and reindexed.
    Processed,
    /// Same version, structurally identical payload; stored state untouched.
    Acknowledged,
    /// Stale version; the write was dropped.
    Ignored,
}

/// Indexing guarantee requested for a bulk relation write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// The call returns only once every tuple is visible to permission checks.
    Strong,
    /// Tuples are durable on return; index rows follow asynchronously.
    Eventual,
}

/// Addresses a resource definition by name or by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionSelector {
    Name(String),
    Id(Uuid),
}

impl fmt::Display for DefinitionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name '{name}'"),
            Self::Id(id) => write!(f, "id '{id}'"),
        }
    }
}

/// Result of a definition write: the stored revision plus how the version
/// gate settled the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionOutcome {
    pub resource_definition: ResourceDefinition,
    pub status: UpdateStatus,
}

/// One page of relation tuples plus the total match count for the filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationsPage {
    pub relations: Vec<Relationship>,
    pub count: u64,
}
