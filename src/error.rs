use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModbError {
    #[error("Schema error on field '{field}': {reason}")]
    Schema { field: String, reason: String },

    #[error("Unique constraint violated on index '{index}' for value {value}")]
    UniqueViolation { index: String, value: String },

    #[error("No index covers field '{field}'")]
    MissingIndex { field: String },

    #[error("Not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Referential integrity violation: {count} referencing record(s)")]
    Integrity { count: usize },

    #[error("Format error: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ModbError>;
