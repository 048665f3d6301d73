use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::btree::BTree;
use crate::error::{ModbError, Result};
use crate::value::{Record, Value};

/// Declarative description of one index: `{name, field, unique}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub field: String,
    pub unique: bool,
}

/// Index key: a field value under the engine's total order.
#[derive(Debug, Clone)]
pub struct IndexKey(pub Value);

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Boolean(_) => 1,
        Value::Real(_) | Value::Instant(_) => 8,
        Value::Text(s) => s.len() + 24,
    }
}

/// One secondary index: an ordered multimap from a field's values to the ids
/// of the records assigning them. Buckets keep insertion order; a unique
/// index is the bucket-size-one case, enforced at add time. Null and absent
/// values are never indexed.
pub struct Index {
    spec: IndexSpec,
    map: BTree<IndexKey, Vec<String>>,
    entries: usize,
}

impl Index {
    pub fn new(spec: IndexSpec) -> Self {
        Index {
            spec,
            map: BTree::new(),
            entries: 0,
        }
    }

    pub fn spec(&self) -> &IndexSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn field(&self) -> &str {
        &self.spec.field
    }

    pub fn is_unique(&self) -> bool {
        self.spec.unique
    }

    /// Index the record's value for this field. No-op when the field is
    /// null or absent.
    pub fn add(&mut self, record: &Record) -> Result<()> {
        let value = match record.fields.get(&self.spec.field) {
            Some(v) if !v.is_null() => v,
            _ => return Ok(()),
        };
        let key = IndexKey(value.clone());
        if let Some(bucket) = self.map.search_mut(&key) {
            if self.spec.unique {
                return Err(ModbError::UniqueViolation {
                    index: self.spec.name.clone(),
                    value: value.to_string(),
                });
            }
            bucket.push(record.id.clone());
        } else {
            self.map.insert(key, vec![record.id.clone()]);
        }
        self.entries += 1;
        Ok(())
    }

    /// Inverse of `add`: drop the record's entry, removing the key outright
    /// once its bucket empties.
    pub fn remove(&mut self, record: &Record) {
        let value = match record.fields.get(&self.spec.field) {
            Some(v) if !v.is_null() => v,
            _ => return,
        };
        let key = IndexKey(value.clone());
        let emptied = match self.map.search_mut(&key) {
            Some(bucket) => {
                if let Some(pos) = bucket.iter().rposition(|id| id == &record.id) {
                    bucket.remove(pos);
                    self.entries -= 1;
                }
                bucket.is_empty()
            }
            None => return,
        };
        if emptied {
            self.map.delete(&key);
        }
    }

    /// At most one id for the value: the most recent inserter. For unique
    /// indexes this is the only holder; for non-unique indexes use
    /// `search_all` or a range scan to see every match.
    pub fn search(&self, value: &Value) -> Option<&str> {
        self.map
            .search(&IndexKey(value.clone()))
            .and_then(|bucket| bucket.last())
            .map(String::as_str)
    }

    pub fn search_all(&self, value: &Value) -> Vec<String> {
        self.map
            .search(&IndexKey(value.clone()))
            .map(|bucket| bucket.clone())
            .unwrap_or_default()
    }

    /// Ids of records whose value lies in `[min, max]`, ascending by key.
    pub fn range_search(&self, min: &Value, max: &Value) -> Vec<String> {
        let lo = IndexKey(min.clone());
        let hi = IndexKey(max.clone());
        self.map
            .range(&lo, &hi)
            .into_iter()
            .flat_map(|(_, bucket)| bucket.iter().cloned())
            .collect()
    }

    /// Number of indexed (value, id) entries.
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.map.len()
    }

    /// Rough estimate of the index's in-memory footprint.
    pub fn memory_bytes(&self) -> usize {
        self.map
            .iter()
            .map(|(key, bucket)| {
                value_size(&key.0) + bucket.iter().map(|id| id.len() + 24).sum::<usize>()
            })
            .sum()
    }
}

/// All indexes of one collection, keyed by name.
#[derive(Default)]
pub struct IndexManager {
    indexes: BTreeMap<String, Index>,
}

impl IndexManager {
    pub fn new() -> Self {
        IndexManager::default()
    }

    /// Register a new empty index. The name must be unused.
    pub fn create(&mut self, spec: IndexSpec) -> Result<()> {
        if self.indexes.contains_key(&spec.name) {
            return Err(ModbError::Other(format!(
                "Index '{}' already exists",
                spec.name
            )));
        }
        self.indexes.insert(spec.name.clone(), Index::new(spec));
        Ok(())
    }

    pub fn drop_index(&mut self, name: &str) -> bool {
        self.indexes.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Index> {
        self.indexes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Index> {
        self.indexes.get_mut(name)
    }

    /// Any index covering the field (first by name order when several do).
    pub fn index_for_field(&self, field: &str) -> Option<&Index> {
        self.indexes.values().find(|ix| ix.field() == field)
    }

    pub fn specs(&self) -> Vec<IndexSpec> {
        self.indexes.values().map(|ix| ix.spec().clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Index> {
        self.indexes.values()
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Add the record to every index. If any index rejects it, every add
    /// already applied for this record is rolled back before the error
    /// surfaces.
    pub fn add_to_all(&mut self, record: &Record) -> Result<()> {
        let names: Vec<String> = self.indexes.keys().cloned().collect();
        let mut applied = 0;
        for name in &names {
            let outcome = match self.indexes.get_mut(name) {
                Some(index) => index.add(record),
                None => continue,
            };
            match outcome {
                Ok(()) => applied += 1,
                Err(err) => {
                    for done in &names[..applied] {
                        if let Some(index) = self.indexes.get_mut(done) {
                            index.remove(record);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub fn remove_from_all(&mut self, record: &Record) {
        for index in self.indexes.values_mut() {
            index.remove(record);
        }
    }

    /// Move a record's entries from its old to its new values on every index
    /// covering one of the changed fields. On a unique violation, every move
    /// already made is undone before the error surfaces.
    pub fn reindex(&mut self, old: &Record, new: &Record, changed: &[String]) -> Result<()> {
        let names: Vec<String> = self
            .indexes
            .values()
            .filter(|ix| changed.iter().any(|field| field == ix.field()))
            .map(|ix| ix.name().to_string())
            .collect();
        for (i, name) in names.iter().enumerate() {
            if let Some(index) = self.indexes.get_mut(name) {
                index.remove(old);
                if let Err(err) = index.add(new) {
                    let _ = index.add(old);
                    for prior in &names[..i] {
                        if let Some(prior_index) = self.indexes.get_mut(prior) {
                            prior_index.remove(new);
                            let _ = prior_index.add(old);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Fields;

    fn record(id: &str, yaml: &str) -> Record {
        let fields: Fields = serde_yaml::from_str(yaml).unwrap();
        Record::new(id, fields)
    }

    fn email_index(unique: bool) -> Index {
        Index::new(IndexSpec {
            name: "email_idx".into(),
            field: "email".into(),
            unique,
        })
    }

    #[test]
    fn test_add_and_search() {
        let mut ix = email_index(true);
        ix.add(&record("aaa111", "email: a@x")).unwrap();
        ix.add(&record("bbb222", "email: b@x")).unwrap();
        assert_eq!(ix.search(&Value::from("a@x")), Some("aaa111"));
        assert_eq!(ix.search(&Value::from("c@x")), None);
        assert_eq!(ix.entry_count(), 2);
    }

    #[test]
    fn test_unique_violation() {
        let mut ix = email_index(true);
        ix.add(&record("aaa111", "email: a@x")).unwrap();
        let err = ix.add(&record("bbb222", "email: a@x")).unwrap_err();
        match err {
            ModbError::UniqueViolation { index, value } => {
                assert_eq!(index, "email_idx");
                assert!(value.contains("a@x"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_null_and_absent_not_indexed() {
        let mut ix = email_index(true);
        ix.add(&record("aaa111", "email: null")).unwrap();
        ix.add(&record("bbb222", "name: Bob")).unwrap();
        assert_eq!(ix.entry_count(), 0);
        assert_eq!(ix.search(&Value::Null), None);
    }

    #[test]
    fn test_non_unique_keeps_every_match() {
        let mut ix = Index::new(IndexSpec {
            name: "age_idx".into(),
            field: "age".into(),
            unique: false,
        });
        ix.add(&record("aaa111", "age: 30")).unwrap();
        ix.add(&record("bbb222", "age: 30")).unwrap();
        // Latest inserter wins the single-result lookup.
        assert_eq!(ix.search(&Value::from(30.0)), Some("bbb222"));
        assert_eq!(ix.search_all(&Value::from(30.0)), vec!["aaa111", "bbb222"]);

        ix.remove(&record("bbb222", "age: 30"));
        assert_eq!(ix.search(&Value::from(30.0)), Some("aaa111"));
        ix.remove(&record("aaa111", "age: 30"));
        assert_eq!(ix.search(&Value::from(30.0)), None);
        assert_eq!(ix.key_count(), 0);
    }

    #[test]
    fn test_range_search_ascending() {
        let mut ix = Index::new(IndexSpec {
            name: "age_idx".into(),
            field: "age".into(),
            unique: false,
        });
        for (id, age) in [("a", 35), ("b", 18), ("c", 28), ("d", 50)] {
            ix.add(&record(id, &format!("age: {age}"))).unwrap();
        }
        let ids = ix.range_search(&Value::from(18.0), &Value::from(35.0));
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!(ix
            .range_search(&Value::from(60.0), &Value::from(90.0))
            .is_empty());
    }

    #[test]
    fn test_manager_rollback_on_violation() {
        let mut mgr = IndexManager::new();
        mgr.create(IndexSpec {
            name: "age_idx".into(),
            field: "age".into(),
            unique: false,
        })
        .unwrap();
        mgr.create(IndexSpec {
            name: "email_idx".into(),
            field: "email".into(),
            unique: true,
        })
        .unwrap();

        mgr.add_to_all(&record("aaa111", "email: a@x\nage: 30"))
            .unwrap();
        // Same email: the unique index rejects, and the age entry that was
        // applied first must be rolled back.
        let err = mgr
            .add_to_all(&record("bbb222", "email: a@x\nage: 41"))
            .unwrap_err();
        assert!(matches!(err, ModbError::UniqueViolation { .. }));
        let age_idx = mgr.get("age_idx").unwrap();
        assert_eq!(age_idx.entry_count(), 1);
        assert_eq!(age_idx.search(&Value::from(41.0)), None);
    }

    #[test]
    fn test_manager_duplicate_name_rejected() {
        let mut mgr = IndexManager::new();
        let spec = IndexSpec {
            name: "x".into(),
            field: "a".into(),
            unique: false,
        };
        mgr.create(spec.clone()).unwrap();
        assert!(mgr.create(spec).is_err());
    }

    #[test]
    fn test_remove_from_all() {
        let mut mgr = IndexManager::new();
        mgr.create(IndexSpec {
            name: "email_idx".into(),
            field: "email".into(),
            unique: true,
        })
        .unwrap();
        let rec = record("aaa111", "email: a@x");
        mgr.add_to_all(&rec).unwrap();
        mgr.remove_from_all(&rec);
        assert_eq!(mgr.get("email_idx").unwrap().entry_count(), 0);
    }
}
