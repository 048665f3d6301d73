use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::collection::Collection;
use crate::container::{self, Container, StoredCollection};
use crate::error::{ModbError, Result};
use crate::relation::{IntegrityReport, Relation, RelationSpec};
use crate::schema::CollectionSchema;

/// Quiet window after the last modification before a coalesced rewrite.
pub const AUTO_COMMIT_QUIET_MS: u64 = 100;

/// Persistence options for a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub persist: bool,
    pub auto_commit: bool,
    pub filepath: Option<PathBuf>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            persist: false,
            auto_commit: true,
            filepath: None,
        }
    }
}

/// Snapshot of the store's footprint.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub path: PathBuf,
    pub file_size_bytes: u64,
    pub record_counts: BTreeMap<String, usize>,
}

struct Core {
    options: StoreOptions,
    schemas: Mutex<BTreeMap<String, CollectionSchema>>,
    collections: Mutex<BTreeMap<String, Arc<Collection>>>,
    relations: Mutex<BTreeMap<String, Arc<Relation>>>,
    /// Last-known stored state; the mutex also serializes rewrites, so a
    /// new commit cycle cannot start until the previous one finished.
    container: Mutex<Container>,
    initialized: AtomicBool,
    commit_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Core {
    fn path(&self) -> PathBuf {
        self.container.lock().unwrap().path().to_path_buf()
    }

    fn snapshot(collection: &Collection) -> StoredCollection {
        StoredCollection {
            kinds: collection.schema().kinds(),
            indexes: collection.list_indexes(),
            records: collection.all_internal(),
        }
    }

    fn commit_all(&self) -> Result<()> {
        let live: Vec<(String, Arc<Collection>)> = {
            let collections = self.collections.lock().unwrap();
            collections
                .iter()
                .map(|(name, collection)| (name.clone(), Arc::clone(collection)))
                .collect()
        };
        let mut container = self.container.lock().unwrap();
        for (name, collection) in live {
            container.set_collection(name, Self::snapshot(&collection));
        }
        container.save()
    }
}

/// The storage manager: owns the schema registry, instantiates collection
/// engines lazily, wires auto-commit, and keeps the relation table.
///
/// One store instance owns its database file exclusively; two managers over
/// the same path are undefined behavior.
pub struct Store {
    core: Arc<Core>,
    /// Committer thread handle; exits once every modification sender and
    /// the core itself are gone.
    _committer: Option<thread::JoinHandle<()>>,
}

impl Store {
    /// Register a schema set and open a store over it. Nothing touches disk
    /// until `initialize` or the first commit.
    pub fn open(schemas: BTreeMap<String, CollectionSchema>, options: StoreOptions) -> Store {
        let path = container::resolve_path(options.filepath.as_deref());
        let core = Arc::new(Core {
            options: options.clone(),
            schemas: Mutex::new(schemas),
            collections: Mutex::new(BTreeMap::new()),
            relations: Mutex::new(BTreeMap::new()),
            container: Mutex::new(Container::new(path)),
            initialized: AtomicBool::new(false),
            commit_tx: Mutex::new(None),
        });

        let committer = if options.persist && options.auto_commit {
            let (tx, rx) = mpsc::channel::<()>();
            *core.commit_tx.lock().unwrap() = Some(tx);
            Some(spawn_committer(Arc::downgrade(&core), rx))
        } else {
            None
        };

        Store {
            core,
            _committer: committer,
        }
    }

    /// Load the container and instantiate every stored collection, merging
    /// kind-only schemas into the registry where absent. Idempotent. On a
    /// malformed file the error surfaces and the store stays empty; a later
    /// commit overwrites the bad file.
    pub fn initialize(&self) -> Result<()> {
        if self.core.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.core.options.persist {
            return Ok(());
        }

        let path = self.core.path();
        let loaded = Container::load(&path)?;
        let names: Vec<String> = loaded.names().iter().map(|s| s.to_string()).collect();
        let kind_schemas: Vec<(String, CollectionSchema)> = names
            .iter()
            .filter_map(|name| {
                loaded
                    .get(name)
                    .map(|stored| (name.clone(), CollectionSchema::from_kinds(&stored.kinds)))
            })
            .collect();
        *self.core.container.lock().unwrap() = loaded;

        {
            let mut schemas = self.core.schemas.lock().unwrap();
            for (name, schema) in kind_schemas {
                schemas.entry(name).or_insert(schema);
            }
        }
        for name in names {
            self.collection(&name)?;
        }
        Ok(())
    }

    /// Get (lazily instantiating) the engine for a named collection. The
    /// name must be present in the schema registry.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        if let Some(existing) = self.core.collections.lock().unwrap().get(name) {
            return Ok(Arc::clone(existing));
        }

        let schema = self
            .core
            .schemas
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                ModbError::Other(format!("Collection '{name}' not found in schema registry"))
            })?;

        let collection = Arc::new(Collection::new(name, schema.clone()));
        for spec in schema.derived_indexes() {
            collection.create_index(spec)?;
        }
        if let Some(tx) = self.core.commit_tx.lock().unwrap().clone() {
            collection.on_modify(move |_| {
                let _ = tx.send(());
            });
        }

        // Insert before wiring relations so self- and mutual references
        // terminate instead of re-instantiating.
        self.core
            .collections
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&collection));

        let wired = (|| -> Result<()> {
            if self.core.options.persist && self.core.initialized.load(Ordering::SeqCst) {
                let stored = {
                    let container = self.core.container.lock().unwrap();
                    container
                        .get(name)
                        .map(|s| (s.records.clone(), s.indexes.clone()))
                };
                if let Some((records, indexes)) = stored {
                    collection.replay(records, indexes)?;
                }
            }
            for spec in schema.derived_relations(name) {
                self.define_relation(spec)?;
            }
            Ok(())
        })();
        if let Err(err) = wired {
            self.core.collections.lock().unwrap().remove(name);
            return Err(err);
        }

        Ok(collection)
    }

    // ── Commits ─────────────────────────────────────────────────

    /// Rewrite the file with the current state of one live collection.
    pub fn commit(&self, name: &str) -> Result<()> {
        let collection = self
            .core
            .collections
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ModbError::Other(format!("Collection '{name}' is not live")))?;
        let mut container = self.core.container.lock().unwrap();
        container.set_collection(name, Core::snapshot(&collection));
        container.save()
    }

    /// Pull every live collection into the container and rewrite the file.
    /// Required at shutdown to flush the last auto-commit window.
    pub fn commit_all(&self) -> Result<()> {
        self.core.commit_all()
    }

    // ── Relations ───────────────────────────────────────────────

    /// Register a relation. Both referenced collections must exist in the
    /// schema registry; registering an already-known name returns the
    /// existing relation.
    pub fn define_relation(&self, spec: RelationSpec) -> Result<Arc<Relation>> {
        if let Some(existing) = self.core.relations.lock().unwrap().get(&spec.name) {
            return Ok(Arc::clone(existing));
        }
        {
            let schemas = self.core.schemas.lock().unwrap();
            for collection in [&spec.source_collection, &spec.target_collection] {
                if !schemas.contains_key(collection.as_str()) {
                    return Err(ModbError::Other(format!(
                        "Relation '{}' references unknown collection '{collection}'",
                        spec.name
                    )));
                }
            }
        }
        let source = self.collection(&spec.source_collection)?;
        let target = self.collection(&spec.target_collection)?;
        let relation = Arc::new(Relation::new(spec.clone(), source, Arc::clone(&target)));
        target.add_delete_guard(Arc::downgrade(&relation));
        self.core
            .relations
            .lock()
            .unwrap()
            .insert(spec.name, Arc::clone(&relation));
        Ok(relation)
    }

    pub fn list_relations(&self) -> Vec<String> {
        self.core.relations.lock().unwrap().keys().cloned().collect()
    }

    pub fn get_relation(&self, name: &str) -> Option<Arc<Relation>> {
        self.core.relations.lock().unwrap().get(name).cloned()
    }

    pub fn relation_metadata(&self, name: &str) -> Option<RelationSpec> {
        self.get_relation(name).map(|rel| rel.spec().clone())
    }

    /// Run the integrity check of every registered relation.
    pub fn validate_relations(&self) -> BTreeMap<String, IntegrityReport> {
        let relations: Vec<Arc<Relation>> = {
            let map = self.core.relations.lock().unwrap();
            map.values().cloned().collect()
        };
        relations
            .into_iter()
            .map(|rel| (rel.name().to_string(), rel.validate_integrity()))
            .collect()
    }

    // ── Introspection ───────────────────────────────────────────

    pub fn health(&self) -> HealthReport {
        let path = self.core.path();
        let file_size_bytes = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
        let record_counts = {
            let collections = self.core.collections.lock().unwrap();
            collections
                .iter()
                .map(|(name, collection)| (name.clone(), collection.stats().record_count))
                .collect()
        };
        HealthReport {
            path,
            file_size_bytes,
            record_counts,
        }
    }
}

/// Background committer: any modification re-arms the quiet window; when it
/// expires with changes pending, one coalesced rewrite runs. Commit cycles
/// are serialized by this single thread plus the container lock. Failures
/// are logged and clear the pending flag; the next modification re-arms.
fn spawn_committer(core: Weak<Core>, rx: mpsc::Receiver<()>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let quiet = Duration::from_millis(AUTO_COMMIT_QUIET_MS);
        let mut pending = false;
        loop {
            match rx.recv_timeout(quiet) {
                Ok(()) => {
                    pending = true;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let core = match core.upgrade() {
                        Some(core) => core,
                        None => break,
                    };
                    if pending {
                        pending = false;
                        if let Err(err) = core.commit_all() {
                            log::warn!("auto-commit failed: {err}");
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schemas_str;
    use crate::value::{Fields, Value};
    use std::path::Path;
    use tempfile::TempDir;

    fn schemas() -> BTreeMap<String, CollectionSchema> {
        parse_schemas_str(
            r#"
users:
  fields:
    name: { kind: text, required: true }
    email: { kind: text, unique: true, indexed: true }
    age: { kind: real, indexed: true }
posts:
  fields:
    user_id:
      kind: text
      indexed: true
      relation: { collection: users, cardinality: many-to-one, on_delete: cascade }
    title: { kind: text }
"#,
        )
        .unwrap()
    }

    fn persistent(path: &Path, auto_commit: bool) -> Store {
        Store::open(
            schemas(),
            StoreOptions {
                persist: true,
                auto_commit,
                filepath: Some(path.to_path_buf()),
            },
        )
    }

    fn fields(yaml: &str) -> Fields {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_unknown_collection_rejected() {
        let store = Store::open(schemas(), StoreOptions::default());
        assert!(store.collection("nonexistent").is_err());
    }

    #[test]
    fn test_lookup_and_range_scenario() {
        let store = Store::open(schemas(), StoreOptions::default());
        let users = store.collection("users").unwrap();
        let alice = users
            .insert(fields("name: Alice\nemail: a@x\nage: 28"))
            .unwrap();
        users
            .insert(fields("name: Bob\nemail: b@x\nage: 32"))
            .unwrap();

        let hit = users.find_by_field("email", &Value::from("a@x")).unwrap();
        assert_eq!(hit.id, alice.id);

        let young = users
            .find_by_range("age", &Value::from(18.0), &Value::from(30.0))
            .unwrap();
        assert_eq!(young.len(), 1);
        assert_eq!(young[0].fields["name"], Value::from("Alice"));

        let err = users
            .insert(fields("name: Eve\nemail: a@x\nage: 40"))
            .unwrap_err();
        assert!(matches!(err, ModbError::UniqueViolation { .. }));
        assert_eq!(users.stats().record_count, 2);
    }

    #[test]
    fn test_cascade_scenario() {
        let store = Store::open(schemas(), StoreOptions::default());
        let users = store.collection("users").unwrap();
        let posts = store.collection("posts").unwrap();

        let alice = users
            .insert(fields("name: Alice\nemail: a@x\nage: 28"))
            .unwrap();
        let bob = users
            .insert(fields("name: Bob\nemail: b@x\nage: 32"))
            .unwrap();
        for (user, title) in [(&alice, "p1"), (&alice, "p2"), (&bob, "p3")] {
            posts
                .insert(fields(&format!("user_id: {}\ntitle: {title}", user.id)))
                .unwrap();
        }

        let relation = store.get_relation("posts_user_id_users").unwrap();
        assert_eq!(relation.inner_join().len(), 3);

        assert!(users.remove(&alice.id).unwrap());
        let remaining = posts.all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].fields["title"], Value::from("p3"));
    }

    #[test]
    fn test_restrict_scenario() {
        let mut schemas = schemas();
        // Flip the posts relation to restrict.
        let field = schemas
            .get_mut("posts")
            .unwrap()
            .fields
            .get_mut("user_id")
            .unwrap();
        field.relation.as_mut().unwrap().on_delete = crate::schema::DeletePolicy::Restrict;

        let store = Store::open(schemas, StoreOptions::default());
        let users = store.collection("users").unwrap();
        let posts = store.collection("posts").unwrap();
        let alice = users
            .insert(fields("name: Alice\nemail: a@x"))
            .unwrap();
        posts
            .insert(fields(&format!("user_id: {}\ntitle: p1", alice.id)))
            .unwrap();

        let err = users.remove(&alice.id).unwrap_err();
        assert!(matches!(err, ModbError::Integrity { count: 1 }));
        assert_eq!(users.stats().record_count, 1);
        assert_eq!(posts.stats().record_count, 1);
    }

    #[test]
    fn test_set_null_scenario() {
        let mut schemas = schemas();
        let field = schemas
            .get_mut("posts")
            .unwrap()
            .fields
            .get_mut("user_id")
            .unwrap();
        field.relation.as_mut().unwrap().on_delete = crate::schema::DeletePolicy::SetNull;

        let store = Store::open(schemas, StoreOptions::default());
        let users = store.collection("users").unwrap();
        let posts = store.collection("posts").unwrap();
        let alice = users
            .insert(fields("name: Alice\nemail: a@x"))
            .unwrap();
        posts
            .insert(fields(&format!("user_id: {}\ntitle: p1", alice.id)))
            .unwrap();

        assert!(users.remove(&alice.id).unwrap());
        let post = &posts.all()[0];
        assert_eq!(post.fields.get("user_id"), Some(&Value::Null));
    }

    #[test]
    fn test_commit_reopen_scenario() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.mdb");

        let store = persistent(&path, false);
        let users = store.collection("users").unwrap();
        let posts = store.collection("posts").unwrap();
        let alice = users
            .insert(fields("name: Alice\nemail: a@x\nage: 28"))
            .unwrap();
        posts
            .insert(fields(&format!("user_id: {}\ntitle: p1", alice.id)))
            .unwrap();
        store.commit_all().unwrap();

        let reopened = persistent(&path, false);
        reopened.initialize().unwrap();
        let users2 = reopened.collection("users").unwrap();
        let posts2 = reopened.collection("posts").unwrap();
        assert_eq!(users2.all(), users.all());
        assert_eq!(posts2.all(), posts.all());
        // The index directory came back too.
        assert_eq!(users2.list_indexes(), users.list_indexes());
        assert_eq!(
            users2.find_by_field("email", &Value::from("a@x")).unwrap().id,
            alice.id
        );
    }

    #[test]
    fn test_recommit_is_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.mdb");

        let store = persistent(&path, false);
        let users = store.collection("users").unwrap();
        users
            .insert(fields("name: Alice\nemail: a@x\nage: 28"))
            .unwrap();
        users
            .insert(fields("name: Bob\nemail: b@x\nage: 32"))
            .unwrap();
        store.commit_all().unwrap();
        let first = fs::read(&path).unwrap();

        let reopened = persistent(&path, false);
        reopened.initialize().unwrap();
        reopened.commit_all().unwrap();
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_commit_single_collection() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.mdb");

        let store = persistent(&path, false);
        let users = store.collection("users").unwrap();
        users
            .insert(fields("name: Alice\nemail: a@x"))
            .unwrap();
        store.commit("users").unwrap();

        let reopened = persistent(&path, false);
        reopened.initialize().unwrap();
        assert_eq!(
            reopened.collection("users").unwrap().stats().record_count,
            1
        );
        assert!(store.commit("never-instantiated").is_err());
    }

    #[test]
    fn test_auto_commit_coalesces() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.mdb");

        let store = persistent(&path, true);
        let users = store.collection("users").unwrap();
        for i in 0..3 {
            users
                .insert(fields(&format!("name: U{i}\nemail: u{i}@x")))
                .unwrap();
        }
        // Nothing on disk inside the quiet window.
        assert!(!path.exists());
        thread::sleep(Duration::from_millis(300));
        assert!(path.exists());

        let reopened = persistent(&path, false);
        reopened.initialize().unwrap();
        assert_eq!(
            reopened.collection("users").unwrap().stats().record_count,
            3
        );
    }

    #[test]
    fn test_corrupted_file_recovery() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.mdb");

        let store = persistent(&path, false);
        store
            .collection("users")
            .unwrap()
            .insert(fields("name: Alice\nemail: a@x"))
            .unwrap();
        store.commit_all().unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let broken = persistent(&path, false);
        let err = broken.initialize().unwrap_err();
        assert!(matches!(err, ModbError::Format(_)));

        // The store stays usable and a later commit overwrites the bad file.
        let users = broken.collection("users").unwrap();
        assert_eq!(users.stats().record_count, 0);
        users
            .insert(fields("name: Carol\nemail: c@x"))
            .unwrap();
        broken.commit_all().unwrap();

        let healed = persistent(&path, false);
        healed.initialize().unwrap();
        assert_eq!(
            healed.collection("users").unwrap().stats().record_count,
            1
        );
    }

    #[test]
    fn test_initialize_merges_unknown_schema() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.mdb");

        let store = persistent(&path, false);
        store
            .collection("users")
            .unwrap()
            .insert(fields("name: Alice\nemail: a@x"))
            .unwrap();
        store.commit_all().unwrap();

        // Reopen with an empty registry: the stored schema is merged in.
        let reopened = Store::open(
            BTreeMap::new(),
            StoreOptions {
                persist: true,
                auto_commit: false,
                filepath: Some(path.clone()),
            },
        );
        reopened.initialize().unwrap();
        let users = reopened.collection("users").unwrap();
        assert_eq!(users.stats().record_count, 1);
        assert_eq!(
            users.find_by_field("email", &Value::from("a@x")).unwrap().fields["name"],
            Value::from("Alice")
        );
    }

    #[test]
    fn test_define_relation_validates_collections() {
        let store = Store::open(schemas(), StoreOptions::default());
        let err = store
            .define_relation(RelationSpec {
                name: "bad".into(),
                source_collection: "posts".into(),
                target_collection: "ghosts".into(),
                source_field: "user_id".into(),
                target_field: "id".into(),
                cardinality: crate::schema::Cardinality::ManyToOne,
                on_delete: crate::schema::DeletePolicy::Restrict,
            })
            .unwrap_err();
        assert!(matches!(err, ModbError::Other(_)));
    }

    #[test]
    fn test_relation_registry_and_validation() {
        let store = Store::open(schemas(), StoreOptions::default());
        let users = store.collection("users").unwrap();
        let posts = store.collection("posts").unwrap();

        assert_eq!(store.list_relations(), vec!["posts_user_id_users"]);
        let meta = store.relation_metadata("posts_user_id_users").unwrap();
        assert_eq!(meta.source_field, "user_id");

        let alice = users
            .insert(fields("name: Alice\nemail: a@x"))
            .unwrap();
        posts
            .insert(fields(&format!("user_id: {}\ntitle: ok", alice.id)))
            .unwrap();
        posts
            .insert(fields("user_id: zzzzzz\ntitle: dangling"))
            .unwrap();

        let reports = store.validate_relations();
        let report = &reports["posts_user_id_users"];
        assert!(!report.ok);
        assert_eq!(report.orphans.len(), 1);
    }

    #[test]
    fn test_health_report() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.mdb");
        let store = persistent(&path, false);
        store
            .collection("users")
            .unwrap()
            .insert(fields("name: Alice\nemail: a@x"))
            .unwrap();

        let before = store.health();
        assert_eq!(before.record_counts["users"], 1);
        assert_eq!(before.file_size_bytes, 0);

        store.commit_all().unwrap();
        let after = store.health();
        assert!(after.file_size_bytes > container::HEADER_LEN as u64);
        assert_eq!(after.path, path);
    }
}
