use std::collections::BTreeMap;

use super::types::CollectionSchema;
use crate::error::Result;

/// Parse a YAML schema set into collection schemas, e.g.
///
/// ```yaml
/// users:
///   fields:
///     name: { kind: text, required: true }
///     email: { kind: text, unique: true, indexed: true }
/// ```
pub fn parse_schemas_str(content: &str) -> Result<BTreeMap<String, CollectionSchema>> {
    let schemas: BTreeMap<String, CollectionSchema> = serde_yaml::from_str(content)?;
    Ok(schemas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldKind;

    #[test]
    fn test_parse_schema_set() {
        let schemas = parse_schemas_str(
            r#"
users:
  fields:
    name: { kind: text, required: true }
    email: { kind: text, unique: true, indexed: true }
    age: { kind: real, indexed: true }
posts:
  fields:
    title: { kind: text, required: true }
    user_id:
      kind: text
      indexed: true
      relation: { collection: users, cardinality: many-to-one, on_delete: cascade }
"#,
        )
        .unwrap();

        assert_eq!(schemas.len(), 2);
        let users = &schemas["users"];
        assert_eq!(users.fields["name"].kind, FieldKind::Text);
        assert!(users.fields["name"].required);
        assert!(users.fields["email"].unique);
        let rel = schemas["posts"].fields["user_id"].relation.as_ref().unwrap();
        assert_eq!(rel.collection, "users");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_schemas_str("users: [not, a, mapping]").is_err());
    }
}
