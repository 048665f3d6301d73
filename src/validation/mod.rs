use crate::error::{ModbError, Result};
use crate::schema::CollectionSchema;
use crate::value::{Fields, Value};

/// Validate a candidate field assignment against its schema.
///
/// Required fields must be present and non-null; present values must match
/// their declared kind (null is allowed for optional fields); fields the
/// schema does not declare are rejected, as is the implicit `id`.
pub fn validate(schema: &CollectionSchema, fields: &Fields) -> Result<()> {
    for (name, def) in &schema.fields {
        let value = fields.get(name);
        if def.required && value.map_or(true, Value::is_null) {
            return Err(ModbError::Schema {
                field: name.clone(),
                reason: "required field is missing".into(),
            });
        }
        if let Some(value) = value {
            if !value.is_null() && value.kind() != Some(def.kind) {
                return Err(ModbError::Schema {
                    field: name.clone(),
                    reason: format!("expected {}, got {}", def.kind, value.type_name()),
                });
            }
        }
    }

    for name in fields.keys() {
        if name == "id" {
            return Err(ModbError::Schema {
                field: name.clone(),
                reason: "the implicit id field cannot be assigned".into(),
            });
        }
        if !schema.fields.contains_key(name) {
            return Err(ModbError::Schema {
                field: name.clone(),
                reason: "not declared by the schema".into(),
            });
        }
    }

    Ok(())
}

/// Fill absent (or null) fields that declare a default value.
pub fn apply_defaults(schema: &CollectionSchema, fields: &mut Fields) {
    for (name, def) in &schema.fields {
        if let Some(default) = &def.default {
            let has_value = fields.get(name).map(|v| !v.is_null()).unwrap_or(false);
            if !has_value {
                fields.insert(name.clone(), default.clone());
            }
        }
    }
}

/// Apply defaults then validate. Used by the insert path; update merges onto
/// an existing record and validates without re-applying defaults.
pub fn validate_and_prepare(schema: &CollectionSchema, fields: &mut Fields) -> Result<()> {
    apply_defaults(schema, fields);
    validate(schema, fields)
}
