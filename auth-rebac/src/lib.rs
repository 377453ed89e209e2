//! Relationship-based access control engine with a materialized actor index
//!
//! This crate implements a Zanzibar-style authorization model providing:
//! - Relation tuples ("subject has relation to resource") as the source of truth
//! - Resource definitions declaring relations and derived permissions
//! - A materialized actor index answering permission checks with one lookup
//! - Batch ingestion with strong or eventual index consistency
//! - Startup migrations that backfill structured fields on legacy records
//!
//! # Core Concepts
//!
//! - **Entity reference**: a `type:id` string naming a subject or a resource
//! - **Relation tuple**: one stored relationship, `subject#relation@resource`
//! - **Resource definition**: the schema for a type, declaring which relations
//!   it accepts, from which subject types, and which permissions derive from them
//! - **Actor index**: precomputed `(resource#grant, subject#relation)` rows;
//!   a permission check is one indexed lookup, never a graph walk
//!
//! # Example
//!
//! ```rust
//! use auth_rebac::{RebacEngine, ResourceDefinitionRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = RebacEngine::in_memory();
//!
//!     // Register the schema
//!     engine.create_resource(ResourceDefinitionRequest::new("user")).await?;
//!     engine
//!         .create_resource(
//!             ResourceDefinitionRequest::new("document")
//!                 .relation("owner", &["user"])
//!                 .permission("edit", &["owner"]),
//!         )
//!         .await?;
//!
//!     // Store a relationship
//!     engine.create_relation("user:alice", "owner", "document:readme").await?;
//!
//!     // Check the derived permission
//!     let allowed = engine.check_permission("user:alice", "edit", "document:readme").await?;
//!     assert!(allowed);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod index;
pub mod migrations;
pub mod models;
pub mod queue;
pub mod relations;
pub mod resources;
pub mod storage;

pub use config::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use migrations::*;
pub use models::*;
pub use queue::*;
