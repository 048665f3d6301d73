mod parser;
mod types;

pub use parser::parse_schemas_str;
pub use types::{Cardinality, CollectionSchema, DeletePolicy, FieldDefinition, RelationTarget};
