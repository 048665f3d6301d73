use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::index::IndexSpec;
use crate::relation::RelationSpec;
use crate::value::{FieldKind, Value};

/// Definition of a single field in a collection schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub kind: FieldKind,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub relation: Option<RelationTarget>,
}

impl FieldDefinition {
    pub fn new(kind: FieldKind) -> Self {
        FieldDefinition {
            kind,
            indexed: false,
            unique: false,
            required: false,
            default: None,
            hidden: false,
            relation: None,
        }
    }

}

/// A declared reference from one collection's field to another collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationTarget {
    pub collection: String,
    pub cardinality: Cardinality,
    #[serde(default)]
    pub on_delete: DeletePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// What happens to referencing records when their target is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletePolicy {
    Cascade,
    SetNull,
    #[default]
    Restrict,
}

/// The declared structure of a collection's records: field name to
/// definition. Every record additionally carries an implicit `id` field of
/// kind text, which is never declared here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDefinition>,
}

impl CollectionSchema {
    pub fn new(fields: BTreeMap<String, FieldDefinition>) -> Self {
        CollectionSchema { fields }
    }

    /// Rebuild a schema from the kind-only form stored on disk.
    pub fn from_kinds(kinds: &BTreeMap<String, FieldKind>) -> Self {
        let fields = kinds
            .iter()
            .map(|(name, kind)| (name.clone(), FieldDefinition::new(*kind)))
            .collect();
        CollectionSchema { fields }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.get(name)
    }

    /// The kind-only projection persisted by the codec.
    pub fn kinds(&self) -> BTreeMap<String, FieldKind> {
        self.fields
            .iter()
            .map(|(name, def)| (name.clone(), def.kind))
            .collect()
    }

    pub fn hidden_fields(&self) -> BTreeSet<String> {
        self.fields
            .iter()
            .filter(|(_, def)| def.hidden)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Indexes to auto-create: one per field marked indexed or unique, named
    /// `<field>_idx` and carrying the unique flag.
    pub fn derived_indexes(&self) -> Vec<IndexSpec> {
        self.fields
            .iter()
            .filter(|(_, def)| def.indexed || def.unique)
            .map(|(name, def)| IndexSpec {
                name: format!("{name}_idx"),
                field: name.clone(),
                unique: def.unique,
            })
            .collect()
    }

    /// Outgoing relations: one per field carrying a relation, named
    /// `<collection>_<field>_<target>`, joining the field to the target's id.
    pub fn derived_relations(&self, collection: &str) -> Vec<RelationSpec> {
        self.fields
            .iter()
            .filter_map(|(name, def)| {
                def.relation.as_ref().map(|rel| RelationSpec {
                    name: format!("{collection}_{name}_{}", rel.collection),
                    source_collection: collection.to_string(),
                    target_collection: rel.collection.clone(),
                    source_field: name.clone(),
                    target_field: "id".to_string(),
                    cardinality: rel.cardinality,
                    on_delete: rel.on_delete,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schemas_str;

    fn users_schema() -> CollectionSchema {
        parse_schemas_str(
            r#"
users:
  fields:
    name: { kind: text, required: true }
    email: { kind: text, unique: true, indexed: true }
    age: { kind: real, indexed: true }
    password: { kind: text, hidden: true }
"#,
        )
        .unwrap()
        .remove("users")
        .unwrap()
    }

    #[test]
    fn test_derived_indexes() {
        let schema = users_schema();
        let indexes = schema.derived_indexes();
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes[0].name, "age_idx");
        assert!(!indexes[0].unique);
        assert_eq!(indexes[1].name, "email_idx");
        assert!(indexes[1].unique);
    }

    #[test]
    fn test_derived_relations() {
        let schemas = parse_schemas_str(
            r#"
posts:
  fields:
    title: { kind: text }
    user_id:
      kind: text
      indexed: true
      relation: { collection: users, cardinality: many-to-one, on_delete: cascade }
"#,
        )
        .unwrap();
        let relations = schemas["posts"].derived_relations("posts");
        assert_eq!(relations.len(), 1);
        let rel = &relations[0];
        assert_eq!(rel.name, "posts_user_id_users");
        assert_eq!(rel.source_field, "user_id");
        assert_eq!(rel.target_field, "id");
        assert_eq!(rel.on_delete, DeletePolicy::Cascade);
    }

    #[test]
    fn test_delete_policy_defaults_to_restrict() {
        let schemas = parse_schemas_str(
            r#"
posts:
  fields:
    user_id:
      kind: text
      relation: { collection: users, cardinality: many-to-one }
"#,
        )
        .unwrap();
        let rel = schemas["posts"].fields["user_id"].relation.as_ref().unwrap();
        assert_eq!(rel.on_delete, DeletePolicy::Restrict);
    }

    #[test]
    fn test_hidden_fields_and_kinds() {
        let schema = users_schema();
        let hidden = schema.hidden_fields();
        assert!(hidden.contains("password"));
        assert_eq!(hidden.len(), 1);
        let kinds = schema.kinds();
        assert_eq!(kinds.len(), 4);
        let rebuilt = CollectionSchema::from_kinds(&kinds);
        assert_eq!(rebuilt.fields["age"].kind, crate::value::FieldKind::Real);
        assert!(!rebuilt.fields["password"].hidden);
    }
}
