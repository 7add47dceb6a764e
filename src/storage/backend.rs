use {
    super::error::StorageError,
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        fs::{self, OpenOptions},
        io::{ErrorKind, Write},
        path::{Path, PathBuf},
    },
    tracing::debug,
};

const PARTITION_EXTENSION: &str = "mpk";

/// Durable medium behind a [`super::KeyedStore`].
///
/// Every store owns one namespace and writes whole partitions at a time, so a
/// backend only has to guarantee that a single `write_partition` call either
/// lands completely or not at all.
pub trait StorageBackend: Send + Sync {
    /// Returns every partition currently persisted under `namespace`.
    fn load(&self, namespace: &str) -> Result<HashMap<String, Vec<u8>>, StorageError>;

    /// Replaces the persisted bytes of one partition. `None` removes the
    /// partition entirely.
    fn write_partition(
        &self,
        namespace: &str,
        partition: &str,
        bytes: Option<&[u8]>,
    ) -> Result<(), StorageError>;
}

/// Keeps partitions in process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    partitions: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self, namespace: &str) -> Result<HashMap<String, Vec<u8>>, StorageError> {
        Ok(self
            .partitions
            .lock()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, partition), bytes)| (partition.clone(), bytes.clone()))
            .collect())
    }

    fn write_partition(
        &self,
        namespace: &str,
        partition: &str,
        bytes: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        let key = (namespace.to_owned(), partition.to_owned());
        let mut partitions = self.partitions.lock();
        match bytes {
            Some(bytes) => {
                partitions.insert(key, bytes.to_vec());
            }
            None => {
                partitions.remove(&key);
            }
        }
        Ok(())
    }
}

/// One directory per namespace, one file per partition.
///
/// Partition names are hex encoded into file names since they are arbitrary
/// strings (CAIP-10 accounts and topics contain `:`).
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_path(&self, namespace: &str, partition: &str) -> PathBuf {
        self.root
            .join(namespace)
            .join(format!("{}.{PARTITION_EXTENSION}", hex::encode(partition)))
    }
}

impl StorageBackend for FileBackend {
    fn load(&self, namespace: &str) -> Result<HashMap<String, Vec<u8>>, StorageError> {
        let dir = self.root.join(namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut partitions = HashMap::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PARTITION_EXTENSION) {
                // Leftover temp files from an interrupted write
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let partition = hex::decode(stem)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or_else(|| {
                    StorageError::Other(format!("unexpected partition file: {}", path.display()))
                })?;
            partitions.insert(partition, fs::read(&path)?);
        }
        debug!(
            "Loaded {} partitions from {}",
            partitions.len(),
            dir.display()
        );
        Ok(partitions)
    }

    fn write_partition(
        &self,
        namespace: &str,
        partition: &str,
        bytes: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        let path = self.partition_path(namespace, partition);
        let Some(bytes) = bytes else {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}
