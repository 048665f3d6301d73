//! modb: an embedded, single-process document database.
//!
//! Named collections of schema-validated records persist to one binary file.
//! The engine provides primary-key lookups through an in-memory B-tree,
//! secondary indexes with unique constraints and range scans, declarative
//! relations with delete policies, joins, and a debounced auto-commit that
//! rewrites the container after a quiet window.

pub mod btree;
pub mod codec;
pub mod collection;
pub mod container;
pub mod error;
pub mod id;
pub mod index;
pub mod relation;
pub mod schema;
pub mod store;
pub mod validation;
pub mod value;

pub use collection::{ChangeEvent, Collection, CollectionStats, ListenerId};
pub use error::{ModbError, Result};
pub use index::IndexSpec;
pub use relation::{JoinRow, Relation, RelationSpec};
pub use schema::{
    parse_schemas_str, Cardinality, CollectionSchema, DeletePolicy, FieldDefinition,
    RelationTarget,
};
pub use store::{Store, StoreOptions};
pub use value::{FieldKind, Fields, Record, Value};
