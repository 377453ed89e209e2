//! One-shot backfill of structured fields on legacy records.
//!
//! Early deployments stored only the composite strings (`type:id`,
//! `type:id#relation`); typed filtering needs the split-out fields. The
//! runner pages through whatever is still unmigrated until nothing remains,
//! so it is safe to run on every startup.

use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RebacConfig;
use crate::error::{RebacError, Result};
use crate::models::parse_composite;
use crate::storage::{IndexRepository, RelationshipRepository};

/// Totals reported by one migration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub relationships_migrated: u64,
    pub index_entries_migrated: u64,
}

/// Backfills structured fields on relationships and actor index rows.
///
/// Run it before serving traffic. Malformed legacy composites abort the run
/// with an error naming the row; silently skipping them would leave the
/// unmigrated set non-empty forever.
pub struct MigrationRunner {
    relationships: Arc<dyn RelationshipRepository>,
    index: Arc<dyn IndexRepository>,
    page_size: u64,
}

impl MigrationRunner {
    pub fn new(
        relationships: Arc<dyn RelationshipRepository>,
        index: Arc<dyn IndexRepository>,
        config: &RebacConfig,
    ) -> Self {
        Self {
            relationships,
            index,
            page_size: config.migration_page_size.max(1),
        }
    }

    pub async fn run(&self) -> Result<MigrationReport> {
        let relationships_migrated = self.migrate_relationships().await?;
        let index_entries_migrated = self.migrate_index_entries().await?;
        let report = MigrationReport {
            relationships_migrated,
            index_entries_migrated,
        };
        if relationships_migrated > 0 || index_entries_migrated > 0 {
            info!(
                relationships = relationships_migrated,
                index_entries = index_entries_migrated,
                "backfilled structured fields on legacy records"
            );
        }
        Ok(report)
    }

    /// Always re-queries the first page: every update shrinks the unmigrated
    /// set, so the loop ends exactly when it is empty.
    async fn migrate_relationships(&self) -> Result<u64> {
        let mut migrated = 0;
        loop {
            let page = self.relationships.find_unstructured(self.page_size).await?;
            if page.is_empty() {
                break;
            }
            for mut row in page {
                let (subject_ref, _) = parse_composite(&row.subject).map_err(|err| {
                    RebacError::Internal(anyhow!(
                        "relationship {} has a malformed subject '{}': {err}",
                        row.id,
                        row.subject
                    ))
                })?;
                let (resource_ref, _) = parse_composite(&row.resource).map_err(|err| {
                    RebacError::Internal(anyhow!(
                        "relationship {} has a malformed resource '{}': {err}",
                        row.id,
                        row.resource
                    ))
                })?;
                row.subject_type = subject_ref.entity_type;
                row.subject_id = subject_ref.entity_id;
                row.resource_type = resource_ref.entity_type;
                row.resource_id = resource_ref.entity_id;
                row.updated_at = chrono::Utc::now();
                self.relationships.update(row).await?;
                migrated += 1;
            }
        }
        Ok(migrated)
    }

    async fn migrate_index_entries(&self) -> Result<u64> {
        let mut migrated = 0;
        loop {
            let page = self.index.find_unstructured(self.page_size).await?;
            if page.is_empty() {
                break;
            }
            for mut row in page {
                let (entity_ref, _) = parse_composite(&row.entity).map_err(|err| {
                    RebacError::Internal(anyhow!(
                        "actor index row {} has a malformed entity '{}': {err}",
                        row.id,
                        row.entity
                    ))
                })?;
                let (subject_ref, suffix) = parse_composite(&row.subject).map_err(|err| {
                    RebacError::Internal(anyhow!(
                        "actor index row {} has a malformed subject '{}': {err}",
                        row.id,
                        row.subject
                    ))
                })?;
                let Some(relation) = suffix else {
                    return Err(RebacError::Internal(anyhow!(
                        "actor index row {} is missing the relation suffix in '{}'",
                        row.id,
                        row.subject
                    )));
                };
                row.entity_type = entity_ref.entity_type;
                row.entity_id = entity_ref.entity_id;
                row.subject_type = subject_ref.entity_type;
                row.subject_id = subject_ref.entity_id;
                row.relation = relation;
                self.index.update(row).await?;
                migrated += 1;
            }
        }
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActorIndexEntry, EntityRef, Relationship};
    use crate::storage::memory::{MemoryIndexRepository, MemoryRelationshipRepository};
    use chrono::Utc;
    use uuid::Uuid;

    fn legacy_relationship(subject: &str, relation: &str, resource: &str) -> Relationship {
        let now = Utc::now();
        Relationship {
            id: Uuid::new_v4(),
            subject: subject.to_string(),
            subject_type: String::new(),
            subject_id: String::new(),
            relation: relation.to_string(),
            resource: resource.to_string(),
            resource_type: String::new(),
            resource_id: String::new(),
            computed_tuple: format!("{subject}#{relation}@{resource}"),
            created_at: now,
            updated_at: now,
        }
    }

    fn legacy_entry(entity: &str, subject: &str) -> ActorIndexEntry {
        ActorIndexEntry {
            id: Uuid::new_v4(),
            entity: entity.to_string(),
            entity_type: String::new(),
            entity_id: String::new(),
            subject: subject.to_string(),
            subject_type: String::new(),
            subject_id: String::new(),
            relation: String::new(),
            created_at: Utc::now(),
        }
    }

    fn runner_with_page_size(
        relationships: Arc<MemoryRelationshipRepository>,
        index: Arc<MemoryIndexRepository>,
        page_size: u64,
    ) -> MigrationRunner {
        let config = RebacConfig {
            migration_page_size: page_size,
            ..RebacConfig::default()
        };
        MigrationRunner::new(relationships, index, &config)
    }

    #[tokio::test]
    async fn test_backfills_legacy_rows_and_is_idempotent() {
        let relationships = Arc::new(MemoryRelationshipRepository::new());
        let index = Arc::new(MemoryIndexRepository::new());
        for resource in ["document:1", "document:2", "document:3"] {
            relationships
                .insert(legacy_relationship("user:5", "owner", resource))
                .await
                .unwrap();
        }
        index
            .insert(legacy_entry("document:1#edit", "user:5#owner"))
            .await
            .unwrap();
        index
            .insert(legacy_entry("document:2#edit", "user:5#owner"))
            .await
            .unwrap();

        // A page size below the row count exercises the paging loop.
        let runner = runner_with_page_size(relationships.clone(), index.clone(), 2);
        let report = runner.run().await.unwrap();
        assert_eq!(
            report,
            MigrationReport {
                relationships_migrated: 3,
                index_entries_migrated: 2,
            }
        );

        let migrated = relationships
            .find_by_tuple("user:5#owner@document:1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(migrated.subject_type, "user");
        assert_eq!(migrated.subject_id, "5");
        assert_eq!(migrated.resource_type, "document");
        assert_eq!(migrated.resource_id, "1");

        assert!(index.exists("document:1#edit", "user", "5").await.unwrap());

        let second = runner.run().await.unwrap();
        assert_eq!(second, MigrationReport::default());
    }

    #[tokio::test]
    async fn test_structured_rows_are_left_untouched() {
        let relationships = Arc::new(MemoryRelationshipRepository::new());
        let index = Arc::new(MemoryIndexRepository::new());
        let structured = relationships
            .insert(Relationship::new(
                &EntityRef::new("user", "5"),
                "owner",
                &EntityRef::new("document", "1"),
            ))
            .await
            .unwrap();
        relationships
            .insert(legacy_relationship("user:6", "owner", "document:2"))
            .await
            .unwrap();

        let runner = runner_with_page_size(relationships.clone(), index, 100);
        let report = runner.run().await.unwrap();
        assert_eq!(report.relationships_migrated, 1);

        let untouched = relationships
            .find_by_id(structured.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.updated_at, structured.updated_at);
    }

    #[tokio::test]
    async fn test_malformed_legacy_rows_abort_the_run() {
        let relationships = Arc::new(MemoryRelationshipRepository::new());
        let index = Arc::new(MemoryIndexRepository::new());
        relationships
            .insert(legacy_relationship("nonsense", "owner", "document:1"))
            .await
            .unwrap();

        let runner = runner_with_page_size(relationships, index, 100);
        assert!(matches!(
            runner.run().await,
            Err(RebacError::Internal(_))
        ));
    }
}
