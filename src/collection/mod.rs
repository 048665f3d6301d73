use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

use crate::btree::BTree;
use crate::error::Result;
use crate::id;
use crate::index::{IndexManager, IndexSpec};
use crate::relation::Relation;
use crate::schema::CollectionSchema;
use crate::validation;
use crate::value::{Fields, Record, Value};

/// An event describing one completed modification of a collection.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Inserted { id: String },
    Updated { id: String },
    Removed { id: String },
    Filtered { removed: Vec<String> },
}

/// Unique modification-listener identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&ChangeEvent) + Send>;

/// Aggregate statistics for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    pub record_count: usize,
    pub index_count: usize,
    pub index_memory_bytes: usize,
}

/// Per-index statistics.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub name: String,
    pub field: String,
    pub unique: bool,
    pub entry_count: usize,
    pub key_count: usize,
    pub memory_bytes: usize,
}

struct Inner {
    records: BTree<String, Fields>,
    indexes: IndexManager,
    listeners: Vec<(u64, Listener)>,
}

impl Inner {
    fn notify(&self, event: &ChangeEvent) {
        // Fired while the collection lock is held; listeners must not call
        // back into mutating operations.
        for (_, listener) in &self.listeners {
            listener(event);
        }
    }
}

/// A named, schema-typed set of records with secondary indexes.
///
/// One mutex guards the records map, the index manager and the listener
/// list; every public operation acquires it on entry and releases it on
/// every exit path, making operations linearizable per collection. Views
/// handed out are independent snapshots of the stored record.
pub struct Collection {
    name: String,
    schema: CollectionSchema,
    hidden: BTreeSet<String>,
    next_listener: AtomicU64,
    /// Relations that target this collection; their delete policies run
    /// before a record is removed. Weak so relation tables and collections
    /// never form ownership cycles.
    delete_guards: Mutex<Vec<Weak<Relation>>>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("hidden", &self.hidden)
            .finish_non_exhaustive()
    }
}

impl Collection {
    pub fn new(name: impl Into<String>, schema: CollectionSchema) -> Self {
        let hidden = schema.hidden_fields();
        Collection {
            name: name.into(),
            schema,
            hidden,
            next_listener: AtomicU64::new(1),
            delete_guards: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                records: BTree::new(),
                indexes: IndexManager::new(),
                listeners: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    /// The caller-visible projection: hidden fields omitted.
    fn view(&self, id: &str, fields: &Fields) -> Record {
        let visible = fields
            .iter()
            .filter(|(name, _)| !self.hidden.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Record::new(id, visible)
    }

    // ── CRUD ────────────────────────────────────────────────────

    /// Validate and store a new record under a freshly generated id.
    /// Returns the visible projection.
    pub fn insert(&self, mut fields: Fields) -> Result<Record> {
        validation::validate_and_prepare(&self.schema, &mut fields)?;

        let mut inner = self.inner.lock().unwrap();
        let mut record_id = id::generate_id();
        while inner.records.contains_key(&record_id) {
            record_id = id::generate_id();
        }

        let record = Record::new(record_id.clone(), fields);
        // Indexes first: a unique violation must leave the primary map
        // untouched.
        inner.indexes.add_to_all(&record)?;
        inner.records.insert(record_id.clone(), record.fields);

        let view = match inner.records.search(&record_id) {
            Some(fields) => self.view(&record_id, fields),
            None => Record::new(record_id.clone(), Fields::new()),
        };
        inner.notify(&ChangeEvent::Inserted { id: record_id });
        Ok(view)
    }

    pub fn get(&self, record_id: &str) -> Option<Record> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .search(&record_id.to_string())
            .map(|fields| self.view(record_id, fields))
    }

    /// Merge `partial` over the stored record and re-validate. Explicit
    /// nulls overwrite (clearing a field); changed fields are moved across
    /// their indexes atomically. Returns the updated view, or `None` when
    /// the id is absent.
    pub fn update(&self, record_id: &str, partial: Fields) -> Result<Option<Record>> {
        let key = record_id.to_string();
        let mut inner = self.inner.lock().unwrap();

        let stored = match inner.records.search(&key) {
            Some(fields) => fields.clone(),
            None => return Ok(None),
        };

        let mut merged = stored.clone();
        for (name, value) in partial {
            merged.insert(name, value);
        }
        validation::validate(&self.schema, &merged)?;

        let changed: Vec<String> = self
            .schema
            .fields
            .keys()
            .filter(|name| stored.get(*name) != merged.get(*name))
            .cloned()
            .collect();

        let old_record = Record::new(record_id, stored);
        let new_record = Record::new(record_id, merged);
        inner.indexes.reindex(&old_record, &new_record, &changed)?;
        inner.records.insert(key, new_record.fields.clone());

        let view = self.view(record_id, &new_record.fields);
        inner.notify(&ChangeEvent::Updated {
            id: record_id.to_string(),
        });
        Ok(Some(view))
    }

    /// Remove a record. Relations targeting this collection apply their
    /// delete policies first: every restrict check runs before any cascade
    /// or set-null takes effect. Returns false when the id is absent.
    pub fn remove(&self, record_id: &str) -> Result<bool> {
        let key = record_id.to_string();
        {
            let inner = self.inner.lock().unwrap();
            if !inner.records.contains_key(&key) {
                return Ok(false);
            }
        }

        // Policies run without holding our lock: cascades and set-nulls
        // re-enter this or other collections.
        let guards: Vec<_> = {
            let guards = self.delete_guards.lock().unwrap();
            guards.iter().filter_map(Weak::upgrade).collect()
        };
        let target_value = Value::Text(record_id.to_string());
        for relation in &guards {
            relation.check_restrict(&target_value)?;
        }
        for relation in &guards {
            relation.apply_on_delete(&target_value)?;
        }

        let mut inner = self.inner.lock().unwrap();
        let removed = match inner.records.delete(&key) {
            Some(fields) => {
                let record = Record::new(record_id, fields);
                inner.indexes.remove_from_all(&record);
                true
            }
            // A self-referential cascade may have removed it already.
            None => false,
        };
        if removed {
            inner.notify(&ChangeEvent::Removed {
                id: record_id.to_string(),
            });
        }
        Ok(removed)
    }

    // ── Queries ─────────────────────────────────────────────────

    /// All records in ascending id order.
    pub fn all(&self) -> Vec<Record> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .map(|(record_id, fields)| self.view(record_id, fields))
            .collect()
    }

    /// Full scan in id order over visible projections.
    pub fn find(&self, predicate: impl Fn(&Record) -> bool) -> Vec<Record> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .map(|(record_id, fields)| self.view(record_id, fields))
            .filter(|view| predicate(view))
            .collect()
    }

    /// First match in id order, short-circuiting.
    pub fn first(&self, predicate: impl Fn(&Record) -> bool) -> Option<Record> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .map(|(record_id, fields)| self.view(record_id, fields))
            .find(|view| predicate(view))
    }

    /// Look up one record by field value, through the field's index when one
    /// exists and by scan otherwise. Null never matches: nulls are not
    /// indexed.
    pub fn find_by_field(&self, field: &str, value: &Value) -> Option<Record> {
        if value.is_null() {
            return None;
        }
        let inner = self.inner.lock().unwrap();
        if let Some(index) = inner.indexes.index_for_field(field) {
            let record_id = index.search(value)?.to_string();
            return inner
                .records
                .search(&record_id)
                .map(|fields| self.view(&record_id, fields));
        }
        inner
            .records
            .iter()
            .find(|(_, fields)| {
                fields
                    .get(field)
                    .is_some_and(|v| v.total_cmp(value) == std::cmp::Ordering::Equal)
            })
            .map(|(record_id, fields)| self.view(record_id, fields))
    }

    /// Every record whose field equals the value, in index order when an
    /// index exists and id order otherwise.
    pub fn find_all_by_field(&self, field: &str, value: &Value) -> Vec<Record> {
        if value.is_null() {
            return Vec::new();
        }
        let inner = self.inner.lock().unwrap();
        if let Some(index) = inner.indexes.index_for_field(field) {
            return index
                .search_all(value)
                .into_iter()
                .filter_map(|record_id| {
                    inner
                        .records
                        .search(&record_id)
                        .map(|fields| self.view(&record_id, fields))
                })
                .collect();
        }
        inner
            .records
            .iter()
            .filter(|(_, fields)| {
                fields
                    .get(field)
                    .is_some_and(|v| v.total_cmp(value) == std::cmp::Ordering::Equal)
            })
            .map(|(record_id, fields)| self.view(record_id, fields))
            .collect()
    }

    /// Records whose field lies in `[min, max]`, ascending by field value.
    /// Requires an index on the field.
    pub fn find_by_range(&self, field: &str, min: &Value, max: &Value) -> Result<Vec<Record>> {
        let inner = self.inner.lock().unwrap();
        let index = inner
            .indexes
            .index_for_field(field)
            .ok_or_else(|| crate::error::ModbError::MissingIndex {
                field: field.to_string(),
            })?;
        Ok(index
            .range_search(min, max)
            .into_iter()
            .filter_map(|record_id| {
                inner
                    .records
                    .search(&record_id)
                    .map(|fields| self.view(&record_id, fields))
            })
            .collect())
    }

    // ── Index management ────────────────────────────────────────

    /// Create an index and build it from existing records. If the unique
    /// flag is set and existing records already violate it, the index is
    /// discarded and the error surfaces.
    pub fn create_index(&self, spec: IndexSpec) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            records, indexes, ..
        } = &mut *inner;
        indexes.create(spec.clone())?;
        for (record_id, fields) in records.iter() {
            let record = Record::new(record_id.clone(), fields.clone());
            let outcome = match indexes.get_mut(&spec.name) {
                Some(index) => index.add(&record),
                None => break,
            };
            if let Err(err) = outcome {
                indexes.drop_index(&spec.name);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.indexes.drop_index(name)
    }

    pub fn list_indexes(&self) -> Vec<IndexSpec> {
        let inner = self.inner.lock().unwrap();
        inner.indexes.specs()
    }

    pub fn index_stats(&self) -> Vec<IndexStats> {
        let inner = self.inner.lock().unwrap();
        inner
            .indexes
            .iter()
            .map(|index| IndexStats {
                name: index.name().to_string(),
                field: index.field().to_string(),
                unique: index.is_unique(),
                entry_count: index.entry_count(),
                key_count: index.key_count(),
                memory_bytes: index.memory_bytes(),
            })
            .collect()
    }

    pub fn stats(&self) -> CollectionStats {
        let inner = self.inner.lock().unwrap();
        CollectionStats {
            record_count: inner.records.len(),
            index_count: inner.indexes.len(),
            index_memory_bytes: inner.indexes.iter().map(|ix| ix.memory_bytes()).sum(),
        }
    }

    // ── Bulk retention ──────────────────────────────────────────

    /// Keep records satisfying the predicate, dropping the rest with index
    /// synchrony. Fires a single event for the whole sweep.
    pub fn filter(&self, predicate: impl Fn(&Record) -> bool) {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<String> = inner
            .records
            .iter()
            .map(|(record_id, fields)| self.view(record_id, fields))
            .filter(|view| !predicate(view))
            .map(|view| view.id)
            .collect();
        if doomed.is_empty() {
            return;
        }
        for record_id in &doomed {
            if let Some(fields) = inner.records.delete(record_id) {
                let record = Record::new(record_id.clone(), fields);
                inner.indexes.remove_from_all(&record);
            }
        }
        inner.notify(&ChangeEvent::Filtered { removed: doomed });
    }

    // ── Modification listeners ──────────────────────────────────

    pub fn on_modify(&self, listener: impl Fn(&ChangeEvent) + Send + 'static) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.push((id, Box::new(listener)));
        ListenerId(id)
    }

    pub fn off_modify(&self, listener: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.listeners.len();
        inner.listeners.retain(|(id, _)| *id != listener.0);
        inner.listeners.len() != before
    }

    // ── Persistence hooks ───────────────────────────────────────

    /// Internal projection with hidden fields retained; persistence only.
    pub(crate) fn all_internal(&self) -> Vec<Record> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .map(|(record_id, fields)| Record::new(record_id.clone(), fields.clone()))
            .collect()
    }

    /// Seed records and indexes previously loaded from disk. Bypasses id
    /// generation and validation and fires no events.
    pub(crate) fn replay(&self, records: Vec<Record>, index_specs: Vec<IndexSpec>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for spec in index_specs {
            if inner.indexes.get(&spec.name).is_none() {
                inner.indexes.create(spec)?;
            }
        }
        for record in records {
            inner.indexes.add_to_all(&record)?;
            inner.records.insert(record.id.clone(), record.fields);
        }
        Ok(())
    }

    /// Register a relation whose delete policy must run before removals
    /// from this collection.
    pub(crate) fn add_delete_guard(&self, relation: Weak<Relation>) {
        let mut guards = self.delete_guards.lock().unwrap();
        guards.push(relation);
    }
}
