//! Property tests for actor index maintenance.
//!
//! The invariant under test: after any interleaving of tuple writes and
//! removals, the incrementally maintained index holds exactly the rows a
//! fresh engine derives from the surviving tuples alone.

use std::collections::BTreeSet;

use auth_rebac::*;
use proptest::prelude::*;

/// Schema shared by both engines: folders grant `edit` to their owner and
/// inherit it from their parent folder; documents inherit it from folders.
async fn schema_engine() -> RebacEngine {
    let engine = RebacEngine::in_memory();
    engine
        .create_resource(ResourceDefinitionRequest::new("user"))
        .await
        .unwrap();
    engine
        .create_resource(
            ResourceDefinitionRequest::new("folder")
                .relation("owner", &["user"])
                .relation("parent", &["folder"])
                .permission("edit", &["owner", "parent->edit"]),
        )
        .await
        .unwrap();
    engine
        .create_resource(
            ResourceDefinitionRequest::new("document")
                .relation("parent", &["folder"])
                .permission("edit", &["parent->edit"]),
        )
        .await
        .unwrap();
    engine
}

/// A schema-legal tuple drawn from a small entity universe. Folder-to-folder
/// parents may form cycles and self-loops on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TupleKind {
    Owner { user: u8, folder: u8 },
    FolderParent { parent: u8, child: u8 },
    DocumentParent { folder: u8, document: u8 },
}

impl TupleKind {
    fn parts(&self) -> (String, &'static str, String) {
        match self {
            Self::Owner { user, folder } => {
                (format!("user:{user}"), "owner", format!("folder:{folder}"))
            }
            Self::FolderParent { parent, child } => (
                format!("folder:{parent}"),
                "parent",
                format!("folder:{child}"),
            ),
            Self::DocumentParent { folder, document } => (
                format!("folder:{folder}"),
                "parent",
                format!("document:{document}"),
            ),
        }
    }
}

fn tuple_kind() -> impl Strategy<Value = TupleKind> {
    prop_oneof![
        (0..3u8, 0..3u8).prop_map(|(user, folder)| TupleKind::Owner { user, folder }),
        (0..3u8, 0..3u8).prop_map(|(parent, child)| TupleKind::FolderParent { parent, child }),
        (0..3u8, 0..2u8)
            .prop_map(|(folder, document)| TupleKind::DocumentParent { folder, document }),
    ]
}

/// One scripted step: `true` removes the tuple, `false` writes it. Removals
/// are rarer so most scripts keep a live graph worth comparing.
fn op() -> impl Strategy<Value = (bool, TupleKind)> {
    (prop::bool::weighted(0.3), tuple_kind())
}

async fn index_rows(engine: &RebacEngine) -> Vec<(String, String)> {
    let mut rows: Vec<(String, String)> = engine
        .find_index_entries(&IndexFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|entry| (entry.entity, entry.subject))
        .collect();
    rows.sort();
    rows
}

proptest! {
    #[test]
    fn prop_incremental_index_matches_rebuild(script in prop::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let engine = schema_engine().await;
            let mut live: BTreeSet<TupleKind> = BTreeSet::new();

            for (remove, kind) in &script {
                let (subject, relation, object) = kind.parts();
                if *remove {
                    match engine.delete_relation(&subject, relation, &object).await {
                        Ok(()) => {
                            live.remove(kind);
                        }
                        Err(RebacError::NotFound(_)) => {
                            // The engine and the model must agree on absence.
                            prop_assert!(!live.contains(kind));
                        }
                        Err(other) => {
                            prop_assert!(false, "unexpected delete failure: {other}");
                        }
                    }
                } else {
                    engine.create_relation(&subject, relation, &object).await.unwrap();
                    live.insert(*kind);
                }
            }

            let page = engine
                .get_relations(&RelationFilter::default(), 0, None, None)
                .await
                .unwrap();
            prop_assert_eq!(page.count, live.len() as u64);

            // Replay only the surviving tuples into a fresh engine.
            let rebuilt = schema_engine().await;
            for kind in &live {
                let (subject, relation, object) = kind.parts();
                rebuilt.create_relation(&subject, relation, &object).await.unwrap();
            }

            prop_assert_eq!(index_rows(&engine).await, index_rows(&rebuilt).await);

            // Row equality must also be observable through the check API.
            for user in 0..3u8 {
                let subject = format!("user:{user}");
                for resource in [
                    "folder:0", "folder:1", "folder:2", "document:0", "document:1",
                ] {
                    let incremental = engine
                        .check_permission(&subject, "edit", resource)
                        .await
                        .unwrap();
                    let fresh = rebuilt
                        .check_permission(&subject, "edit", resource)
                        .await
                        .unwrap();
                    prop_assert_eq!(
                        incremental,
                        fresh,
                        "check mismatch for {} on {}",
                        subject,
                        resource
                    );
                }
            }
            Ok(())
        })?;
    }
}
