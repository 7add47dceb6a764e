//! Keyed, partitioned record store with change listeners.
//!
//! Records are addressed by `(partition, id)`. The id is extracted from the
//! record itself by the key function given at construction time, the
//! partition is chosen by the caller on every write.

use {
    parking_lot::{Mutex, RwLock},
    serde::{de::DeserializeOwned, Serialize},
    std::{collections::HashMap, sync::Arc},
    tracing::debug,
};

pub mod backend;
pub mod error;

pub use {
    backend::{FileBackend, MemoryBackend, StorageBackend},
    error::StorageError,
};

pub type Result<T> = std::result::Result<T, StorageError>;

/// Extracts the record id used for upserts and lookups.
pub type KeyFn<T> = fn(&T) -> &str;

/// Invoked after every completed mutation. Listeners re-query the store they
/// are handed; they must not mutate it.
pub type Listener<T> = Box<dyn Fn(&KeyedStore<T>) + Send + Sync>;

pub struct KeyedStore<T> {
    namespace: String,
    key: KeyFn<T>,
    backend: Arc<dyn StorageBackend>,
    partitions: RwLock<HashMap<String, Vec<T>>>,
    // Serializes mutations together with their notifications so listeners
    // observe changes in the order they were applied.
    mutation: Mutex<()>,
    listeners: RwLock<Vec<Listener<T>>>,
}

impl<T> KeyedStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Opens the store, loading whatever `backend` already holds for
    /// `namespace`.
    pub fn open(
        namespace: impl Into<String>,
        backend: Arc<dyn StorageBackend>,
        key: KeyFn<T>,
    ) -> Result<Self> {
        let namespace = namespace.into();
        let partitions = backend
            .load(&namespace)?
            .into_iter()
            .map(|(partition, bytes)| Ok((partition, rmp_serde::from_slice::<Vec<T>>(&bytes)?)))
            .collect::<Result<HashMap<_, _>>>()?;
        debug!(
            "Opened store {namespace} with {} partitions",
            partitions.len()
        );

        Ok(Self {
            namespace,
            key,
            backend,
            partitions: RwLock::new(partitions),
            mutation: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Inserts `element` into `partition`, replacing a record with the same id.
    pub fn set(&self, element: T, partition: &str) -> Result<()> {
        let key = self.key;
        self.mutate(partition, |records| {
            let id = key(&element);
            match records.iter_mut().find(|record| key(record) == id) {
                Some(existing) => *existing = element,
                None => records.push(element),
            }
            true
        })
    }

    /// Every record in every partition.
    pub fn get_all(&self) -> Vec<T> {
        self.partitions
            .read()
            .values()
            .flat_map(|records| records.iter().cloned())
            .collect()
    }

    pub fn get_all_in(&self, partition: &str) -> Vec<T> {
        self.partitions
            .read()
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    /// Looks a record up by id alone. Returns the record with the partition
    /// it lives in.
    pub fn find(&self, id: &str) -> Option<(T, String)> {
        self.partitions
            .read()
            .iter()
            .find_map(|(partition, records)| {
                records
                    .iter()
                    .find(|record| (self.key)(record) == id)
                    .map(|record| (record.clone(), partition.clone()))
            })
    }

    /// Removes one record. Deleting an absent record does nothing.
    pub fn delete(&self, id: &str, partition: &str) -> Result<()> {
        let key = self.key;
        self.mutate(partition, |records| {
            let before = records.len();
            records.retain(|record| key(record) != id);
            records.len() != before
        })
    }

    pub fn delete_all(&self, partition: &str) -> Result<()> {
        self.mutate(partition, |records| {
            records.clear();
            true
        })
    }

    /// Swaps the whole content of `partition` for `elements` in one write.
    pub fn replace(&self, elements: Vec<T>, partition: &str) -> Result<()> {
        let key = self.key;
        self.mutate(partition, move |records| {
            records.clear();
            for element in elements {
                // Later duplicates win, same as a sequence of `set` calls
                match records.iter_mut().find(|record| key(record) == key(&element)) {
                    Some(existing) => *existing = element,
                    None => records.push(element),
                }
            }
            true
        })
    }

    pub fn on_update(&self, listener: impl Fn(&KeyedStore<T>) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(listener));
    }

    /// Applies `change` to a copy of `partition`, persists the copy and only
    /// then publishes it. `change` returns false when nothing changed.
    fn mutate(&self, partition: &str, change: impl FnOnce(&mut Vec<T>) -> bool) -> Result<()> {
        let _mutation = self.mutation.lock();

        let mut records = self
            .partitions
            .read()
            .get(partition)
            .cloned()
            .unwrap_or_default();
        if !change(&mut records) {
            return Ok(());
        }

        self.persist(partition, &records)?;
        {
            let mut partitions = self.partitions.write();
            if records.is_empty() {
                partitions.remove(partition);
            } else {
                partitions.insert(partition.to_owned(), records);
            }
        }

        for listener in self.listeners.read().iter() {
            listener(self);
        }
        Ok(())
    }

    fn persist(&self, partition: &str, records: &[T]) -> Result<()> {
        if records.is_empty() {
            return self
                .backend
                .write_partition(&self.namespace, partition, None);
        }
        let bytes = rmp_serde::to_vec_named(records)?;
        self.backend
            .write_partition(&self.namespace, partition, Some(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        serde::Deserialize,
        std::sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Record {
        id: String,
        value: u32,
    }

    fn record(id: &str, value: u32) -> Record {
        Record {
            id: id.to_owned(),
            value,
        }
    }

    fn record_id(record: &Record) -> &str {
        &record.id
    }

    fn open(backend: Arc<dyn StorageBackend>) -> KeyedStore<Record> {
        KeyedStore::open("records", backend, record_id).unwrap()
    }

    fn sorted(mut records: Vec<Record>) -> Vec<Record> {
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Fails every write while `failing` is set.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: AtomicBool,
    }

    impl StorageBackend for FlakyBackend {
        fn load(&self, namespace: &str) -> Result<HashMap<String, Vec<u8>>> {
            self.inner.load(namespace)
        }

        fn write_partition(
            &self,
            namespace: &str,
            partition: &str,
            bytes: Option<&[u8]>,
        ) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Other("disk full".to_owned()));
            }
            self.inner.write_partition(namespace, partition, bytes)
        }
    }

    #[test]
    fn set_upserts_by_extracted_id() {
        let store = open(Arc::new(MemoryBackend::new()));
        store.set(record("a", 1), "p").unwrap();
        store.set(record("a", 2), "p").unwrap();
        store.set(record("b", 3), "p").unwrap();

        assert_eq!(
            sorted(store.get_all_in("p")),
            vec![record("a", 2), record("b", 3)]
        );
    }

    #[test]
    fn same_id_in_different_partitions_is_two_records() {
        let store = open(Arc::new(MemoryBackend::new()));
        store.set(record("a", 1), "p1").unwrap();
        store.set(record("a", 2), "p2").unwrap();

        assert_eq!(store.get_all().len(), 2);
        assert_eq!(store.get_all_in("p1"), vec![record("a", 1)]);
        assert_eq!(store.get_all_in("p2"), vec![record("a", 2)]);
    }

    #[test]
    fn find_returns_owning_partition() {
        let store = open(Arc::new(MemoryBackend::new()));
        store.set(record("a", 1), "p1").unwrap();
        store.set(record("b", 2), "p2").unwrap();

        assert_eq!(store.find("b"), Some((record("b", 2), "p2".to_owned())));
        assert_eq!(store.find("c"), None);
    }

    #[test]
    fn delete_absent_is_a_silent_no_op() {
        let store = open(Arc::new(MemoryBackend::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        store.on_update({
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        store.delete("missing", "p").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        store.set(record("a", 1), "p").unwrap();
        store.delete("a", "p").unwrap();
        assert!(store.get_all().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn delete_all_only_touches_one_partition() {
        let store = open(Arc::new(MemoryBackend::new()));
        store.set(record("a", 1), "p1").unwrap();
        store.set(record("b", 2), "p1").unwrap();
        store.set(record("c", 3), "p2").unwrap();

        store.delete_all("p1").unwrap();
        assert!(store.get_all_in("p1").is_empty());
        assert_eq!(store.get_all(), vec![record("c", 3)]);
    }

    #[test]
    fn replace_swaps_partition_and_notifies_once() {
        let store = open(Arc::new(MemoryBackend::new()));
        store.set(record("a", 1), "p").unwrap();
        store.set(record("b", 2), "p").unwrap();
        store.set(record("z", 9), "other").unwrap();

        let snapshots = Arc::new(Mutex::new(Vec::new()));
        store.on_update({
            let snapshots = snapshots.clone();
            move |store| snapshots.lock().push(sorted(store.get_all_in("p")))
        });

        store
            .replace(vec![record("b", 20), record("c", 30)], "p")
            .unwrap();

        assert_eq!(
            *snapshots.lock(),
            vec![vec![record("b", 20), record("c", 30)]]
        );
        assert_eq!(store.get_all_in("other"), vec![record("z", 9)]);
    }

    #[test]
    fn every_listener_is_notified() {
        let store = open(Arc::new(MemoryBackend::new()));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        for counter in [first.clone(), second.clone()] {
            store.on_update(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        store.set(record("a", 1), "p").unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let backend = Arc::new(FlakyBackend::default());
        let store = open(backend.clone());
        store.set(record("a", 1), "p").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        store.on_update({
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        backend.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            store.replace(vec![record("b", 2)], "p"),
            Err(StorageError::Other(_))
        ));
        assert!(store.set(record("c", 3), "p").is_err());
        assert!(store.delete_all("p").is_err());

        assert_eq!(store.get_all_in("p"), vec![record("a", 1)]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Durable view agrees with memory
        backend.failing.store(false, Ordering::SeqCst);
        let reopened = open(backend);
        assert_eq!(reopened.get_all_in("p"), vec![record("a", 1)]);
    }

    #[test]
    fn reopening_restores_persisted_partitions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(Arc::new(FileBackend::new(dir.path()).unwrap()));
            store.set(record("a", 1), "eip155:1:0xabc").unwrap();
            store.set(record("b", 2), "eip155:1:0xdef").unwrap();
            store.set(record("c", 3), "eip155:1:0xdef").unwrap();
            store.delete("c", "eip155:1:0xdef").unwrap();
        }

        let store = open(Arc::new(FileBackend::new(dir.path()).unwrap()));
        assert_eq!(store.get_all_in("eip155:1:0xabc"), vec![record("a", 1)]);
        assert_eq!(store.get_all_in("eip155:1:0xdef"), vec![record("b", 2)]);
    }

    #[test]
    fn emptied_partition_is_removed_from_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let store = open(backend.clone());
        store.set(record("a", 1), "p").unwrap();
        store.delete("a", "p").unwrap();
        assert!(backend.load("records").unwrap().is_empty());
    }
}
