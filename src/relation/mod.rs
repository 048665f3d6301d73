use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::collection::Collection;
use crate::error::{ModbError, Result};
use crate::schema::{Cardinality, DeletePolicy};
use crate::value::{Record, Value};

/// Declarative description of a relation between two collections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationSpec {
    pub name: String,
    pub source_collection: String,
    pub target_collection: String,
    /// The foreign-key field on source records.
    pub source_field: String,
    /// The joined field on the target; `id` for schema-derived relations.
    pub target_field: String,
    pub cardinality: Cardinality,
    pub on_delete: DeletePolicy,
}

/// One row of a join result: a driving record plus its matched counterpart.
#[derive(Debug, Clone)]
pub struct JoinRow {
    pub record: Record,
    pub joined: Option<Record>,
}

/// A source record whose foreign key resolves to nothing.
#[derive(Debug, Clone)]
pub struct Orphan {
    pub id: String,
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub ok: bool,
    pub orphans: Vec<Orphan>,
}

/// A live relation bound to its two collection engines. Joins acquire each
/// collection's lock independently and never hold both at once, so a join
/// sees each side at its own linearization point.
#[derive(Debug)]
pub struct Relation {
    spec: RelationSpec,
    source: Arc<Collection>,
    target: Arc<Collection>,
}

impl Relation {
    pub fn new(spec: RelationSpec, source: Arc<Collection>, target: Arc<Collection>) -> Self {
        if source.list_indexes().iter().all(|ix| ix.field != spec.source_field) {
            log::warn!(
                "relation '{}': field '{}.{}' has no index, reverse lookups will scan",
                spec.name,
                spec.source_collection,
                spec.source_field
            );
        }
        Relation {
            spec,
            source,
            target,
        }
    }

    pub fn spec(&self) -> &RelationSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    fn lookup_target(&self, value: &Value) -> Option<Record> {
        if value.is_null() {
            return None;
        }
        if self.spec.target_field == "id" {
            return value.as_text().and_then(|id| self.target.get(id));
        }
        self.target.find_by_field(&self.spec.target_field, value)
    }

    fn sources_matching(&self, target_value: &Value) -> Vec<Record> {
        self.source
            .find_all_by_field(&self.spec.source_field, target_value)
    }

    // ── Joins ───────────────────────────────────────────────────

    /// Source records with a resolvable foreign key, paired with their
    /// target. Unmatched sources are omitted.
    pub fn inner_join(&self) -> Vec<JoinRow> {
        self.source
            .all()
            .into_iter()
            .filter_map(|record| {
                let joined = record
                    .fields
                    .get(&self.spec.source_field)
                    .and_then(|fk| self.lookup_target(fk))?;
                Some(JoinRow {
                    record,
                    joined: Some(joined),
                })
            })
            .collect()
    }

    /// Every source record, paired with its target when one resolves.
    pub fn left_join(&self) -> Vec<JoinRow> {
        self.source
            .all()
            .into_iter()
            .map(|record| {
                let joined = record
                    .fields
                    .get(&self.spec.source_field)
                    .and_then(|fk| self.lookup_target(fk));
                JoinRow { record, joined }
            })
            .collect()
    }

    /// Every target record; a target matched by several sources emits one
    /// row per source, an unmatched target emits a single row with no
    /// source.
    pub fn right_join(&self) -> Vec<JoinRow> {
        let mut rows = Vec::new();
        for target in self.target.all() {
            let key: Value = if self.spec.target_field == "id" {
                Value::Text(target.id.clone())
            } else {
                match target.fields.get(&self.spec.target_field) {
                    Some(v) => v.clone(),
                    None => Value::Null,
                }
            };
            let sources = if key.is_null() {
                Vec::new()
            } else {
                self.sources_matching(&key)
            };
            if sources.is_empty() {
                rows.push(JoinRow {
                    record: target,
                    joined: None,
                });
            } else {
                for source in sources {
                    rows.push(JoinRow {
                        record: target.clone(),
                        joined: Some(source),
                    });
                }
            }
        }
        rows
    }

    /// Targets related to the given source record: at most one for a
    /// one-to-one relation, all matches otherwise.
    pub fn get_related(&self, record: &Record) -> Vec<Record> {
        let fk = match record.fields.get(&self.spec.source_field) {
            Some(v) if !v.is_null() => v,
            _ => return Vec::new(),
        };
        let mut related = if self.spec.target_field == "id" {
            self.lookup_target(fk).into_iter().collect::<Vec<_>>()
        } else {
            self.target.find_all_by_field(&self.spec.target_field, fk)
        };
        if self.spec.cardinality == Cardinality::OneToOne {
            related.truncate(1);
        }
        related
    }

    // ── Integrity ───────────────────────────────────────────────

    /// Check that every non-null foreign key resolves to a target.
    pub fn validate_integrity(&self) -> IntegrityReport {
        let mut orphans = Vec::new();
        for record in self.source.all_internal() {
            let fk = match record.fields.get(&self.spec.source_field) {
                Some(v) if !v.is_null() => v,
                _ => continue,
            };
            if self.lookup_target(fk).is_none() {
                orphans.push(Orphan {
                    id: record.id.clone(),
                    field: self.spec.source_field.clone(),
                    value: fk.clone(),
                });
            }
        }
        IntegrityReport {
            ok: orphans.is_empty(),
            orphans,
        }
    }

    /// Fail when this relation restricts deletion of a target value that is
    /// still referenced.
    pub(crate) fn check_restrict(&self, target_value: &Value) -> Result<()> {
        if self.spec.on_delete != DeletePolicy::Restrict {
            return Ok(());
        }
        let count = self.sources_matching(target_value).len();
        if count > 0 {
            return Err(ModbError::Integrity { count });
        }
        Ok(())
    }

    /// Apply cascade or set-null for a target value about to be deleted.
    /// Restrict is handled by `check_restrict` so every restriction is
    /// verified before any side effect.
    pub(crate) fn apply_on_delete(&self, target_value: &Value) -> Result<()> {
        match self.spec.on_delete {
            DeletePolicy::Restrict => Ok(()),
            DeletePolicy::Cascade => {
                for record in self.sources_matching(target_value) {
                    self.source.remove(&record.id)?;
                }
                Ok(())
            }
            DeletePolicy::SetNull => {
                for record in self.sources_matching(target_value) {
                    let mut partial = crate::value::Fields::new();
                    partial.insert(self.spec.source_field.clone(), Value::Null);
                    self.source.update(&record.id, partial)?;
                }
                Ok(())
            }
        }
    }

    /// Apply this relation's delete policy for a target value, before the
    /// target itself is removed.
    pub fn handle_delete(&self, target_value: &Value) -> Result<()> {
        self.check_restrict(target_value)?;
        self.apply_on_delete(target_value)
    }
}
