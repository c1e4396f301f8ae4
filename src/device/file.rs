//! Serialization file device: one file per reference on a filesystem
//! resource.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::codec::{PoolValue, SerializerHandle};
use crate::device::{validate_resource, DeviceId, StorageDevice};
use crate::error::{PoolError, Result};
use crate::filter::{wrap_reader, wrap_writer, FilterHandle};
use crate::resource::{FilesystemResource, ResourceHandle, StorageResource};
use crate::state::{DeviceRef, FileRef, RefId, RefState, StorageLeaf, StorageState};
use crate::task::IoPool;

/// Construction options for [`SerializationFileDevice`].
#[derive(Clone)]
pub struct FileDeviceConfig {
    /// Directory the per-reference files are created under.
    pub directory: PathBuf,
    /// Byte-stream filter chain; `filters[0]` is closest to the file.
    pub filters: Vec<FilterHandle>,
}

impl FileDeviceConfig {
    /// Options for `directory` with no filters.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            filters: Vec::new(),
        }
    }

    /// Set the filter chain.
    pub fn with_filters(mut self, filters: Vec<FilterHandle>) -> Self {
        self.filters = filters;
        self
    }
}

/// Leaf device that serializes values to uniquely named files.
///
/// Writes and materializing reads run on the I/O pool; the installed
/// placement state's readiness event is the rendezvous point, so a reader
/// or deleter that arrives mid-write blocks until the file is complete.
pub struct SerializationFileDevice {
    id: DeviceId,
    me: Weak<SerializationFileDevice>,
    resource: Arc<FilesystemResource>,
    directory: PathBuf,
    filters: Vec<FilterHandle>,
    serializer: SerializerHandle,
    pool: &'static IoPool,
}

impl SerializationFileDevice {
    /// Create the device, creating `config.directory` if needed.
    pub fn new(config: FileDeviceConfig, serializer: SerializerHandle) -> Result<Arc<Self>> {
        if config.directory.as_os_str().is_empty() {
            return Err(PoolError::InvalidConfig(
                "file device directory must not be empty".to_string(),
            ));
        }
        fs::create_dir_all(&config.directory)?;
        let resource = Arc::new(FilesystemResource::new(&config.directory));
        Ok(Arc::new_cyclic(|me| Self {
            id: DeviceId::next(),
            me: me.clone(),
            resource,
            directory: config.directory,
            filters: config.filters,
            serializer,
            pool: IoPool::global(),
        }))
    }

    /// The directory files are created under.
    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }

    fn self_ref(&self) -> DeviceRef {
        self.me.upgrade().expect("device accessed during teardown") as DeviceRef
    }

    fn unique_path(&self, id: RefId) -> PathBuf {
        self.directory.join(format!("ref-{id}-{}", Uuid::new_v4()))
    }

    /// The value for a write: resident data, or a materializing read
    /// through the first leaf holding a copy.
    fn value_for_write(&self, state: &Arc<RefState>, id: RefId) -> Result<PoolValue> {
        let snapshot = state.storage_read();
        if let Some(value) = snapshot.data() {
            return Ok(value);
        }
        let leaf = snapshot
            .leaves()
            .first()
            .ok_or(PoolError::MissingLeaf(id))?;
        leaf.device()
            .read(state, id, true)?
            .ok_or(PoolError::MissingLeaf(id))
    }
}

impl std::fmt::Debug for SerializationFileDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializationFileDevice")
            .field("id", &self.id)
            .field("directory", &self.directory)
            .field("filters", &self.filters.len())
            .finish()
    }
}

impl StorageDevice for SerializationFileDevice {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> String {
        format!("file-device:{}", self.directory.display())
    }

    fn storage_resources(&self) -> Vec<ResourceHandle> {
        vec![Arc::clone(&self.resource) as ResourceHandle]
    }

    fn capacity(&self, resource: Option<&ResourceHandle>) -> Result<u64> {
        if let Some(resource) = resource {
            validate_resource(self, resource)?;
        }
        Ok(self.resource.capacity())
    }

    fn available(&self, resource: Option<&ResourceHandle>) -> Result<u64> {
        if let Some(resource) = resource {
            validate_resource(self, resource)?;
        }
        Ok(self.resource.available())
    }

    fn write(&self, state: &Arc<RefState>, id: RefId) -> Result<()> {
        if state.storage_read().leaf_for(self.id).is_some() {
            return Ok(());
        }
        let value = self.value_for_write(state, id)?;

        let path = self.unique_path(id);
        let file_ref = FileRef {
            path: path.clone(),
            size: state.size(),
        };
        let leaf = StorageLeaf::new(self.self_ref());

        // The leaf check re-runs inside the swap loop: a concurrent write
        // that installed its leaf first wins, and this call backs out
        // without a state, a task, or a file of its own.
        let device_id = self.id;
        let (next, installed) = state.storage_try_rcu(|current| {
            if current.leaf_for(device_id).is_some() {
                return None;
            }
            let mut next = StorageState::next(current);
            next.push_leaf(leaf.clone());
            Some(next)
        });
        if !installed {
            return Ok(());
        }

        // The new state is current but not ready: anyone who reads the
        // placement now blocks until the file is fully written.
        let filters = self.filters.clone();
        let serializer = Arc::clone(&self.serializer);
        let task_state = Arc::clone(&next);
        self.pool.submit(move || {
            let outcome = (|| -> Result<()> {
                let file = File::create(&path)?;
                let mut writer = wrap_writer(&filters, Box::new(BufWriter::new(file)))?;
                serializer.encode(&value, &mut *writer)?;
                writer.flush()?;
                drop(writer);
                leaf.publish_handle(Box::new(file_ref));
                Ok(())
            })();
            task_state.ready().set();
            outcome
        });
        Ok(())
    }

    fn read(&self, state: &Arc<RefState>, id: RefId, materialize: bool) -> Result<Option<PoolValue>> {
        let snapshot = state.storage_read();
        if let Some(value) = snapshot.data() {
            return Ok(materialize.then_some(value));
        }

        let leaf = snapshot.leaf_for(self.id).ok_or(PoolError::MissingLeaf(id))?;
        let file_ref = leaf
            .handle()
            .and_then(|h| h.downcast_ref::<FileRef>())
            .cloned()
            .ok_or(PoolError::MissingLeaf(id))?;

        let next = state.storage_rcu(StorageState::next);

        let filters = self.filters.clone();
        let serializer = Arc::clone(&self.serializer);
        let task_state = Arc::clone(&next);
        self.pool.submit(move || {
            let outcome = (|| -> Result<()> {
                let file = File::open(&file_ref.path)?;
                let mut reader = wrap_reader(&filters, Box::new(BufReader::new(file)))?;
                let value = serializer.decode(&mut *reader)?;
                task_state.publish_data(value);
                Ok(())
            })();
            task_state.ready().set();
            outcome
        });

        if materialize {
            next.ready().wait();
            let value = next
                .data()
                .ok_or_else(|| PoolError::BackgroundIo(format!("materialization of ref {id} failed")))?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    fn delete(&self, state: &Arc<RefState>, _id: RefId) -> Result<()> {
        // storage_read has waited on readiness, so an in-flight write has
        // completed and its handle is published before we unlink.
        let snapshot = state.storage_read();
        let Some(leaf) = snapshot.leaf_for(self.id) else {
            return Ok(());
        };
        let retain = leaf.retain();
        let file_ref = leaf
            .handle()
            .and_then(|h| h.downcast_ref::<FileRef>())
            .cloned();

        let device_id = self.id;
        let next = state.storage_rcu(move |current| {
            let mut next = StorageState::next(current);
            next.remove_leaf(device_id);
            next
        });
        next.ready().set();

        if !retain {
            if let Some(file_ref) = file_ref {
                self.pool.submit(move || {
                    fs::remove_file(&file_ref.path)?;
                    Ok(())
                });
            }
        }
        Ok(())
    }

    fn retain(&self, state: &Arc<RefState>, _id: RefId, retain: bool, all: bool) -> Result<()> {
        // Rendezvous with any in-flight write before replacing its state.
        state.storage_read();
        let device_id = self.id;
        let next = state.storage_rcu(move |current| {
            let mut next = StorageState::next(current);
            if all {
                next.retain_all_leaves(retain);
            } else if let Some(leaf) = current.leaf_for(device_id) {
                next.replace_leaf(device_id, leaf.with_retain(retain));
            }
            next
        });
        next.ready().set();
        Ok(())
    }
}
