//! Process-wide reference table and public entrypoints.
//!
//! A [`Datastore`] maps [`RefId`]s to their [`RefState`]s under one short
//! mutex, and carries the default root device for new references. The
//! process-global instance behind [`global`] backs the free functions
//! [`put`], [`get`], [`remove`], and [`set_device`]; embedders that want
//! isolation (tests, multiple pools) construct their own `Datastore`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::trace;

use crate::codec::PoolValue;
use crate::error::{PoolError, Result};
use crate::state::{DeviceRef, RefId, RefState, StorageState};

/// Sized slot so the default-device cell can live in an atomic swap cell.
struct DeviceSlot {
    device: DeviceRef,
}

/// The id-to-state table plus the default device cell.
pub struct Datastore {
    refs: Mutex<HashMap<RefId, Arc<RefState>>>,
    default_device: ArcSwapOption<DeviceSlot>,
    next_id: AtomicU64,
}

impl Datastore {
    /// An empty datastore with no default device.
    pub fn new() -> Self {
        Self {
            refs: Mutex::new(HashMap::new()),
            default_device: ArcSwapOption::empty(),
            next_id: AtomicU64::new(1),
        }
    }

    /// An empty datastore rooted at `device`.
    pub fn with_default_device(device: DeviceRef) -> Self {
        let store = Self::new();
        store.set_default_device(device);
        store
    }

    /// Overwrite the default device used by [`put`](Self::put).
    pub fn set_default_device(&self, device: DeviceRef) {
        self.default_device
            .store(Some(Arc::new(DeviceSlot { device })));
    }

    /// The current default device.
    pub fn default_device(&self) -> Option<DeviceRef> {
        self.default_device
            .load_full()
            .map(|slot| Arc::clone(&slot.device))
    }

    /// Number of live references.
    pub fn len(&self) -> usize {
        self.refs.lock().len()
    }

    /// Whether no references are live.
    pub fn is_empty(&self) -> bool {
        self.refs.lock().is_empty()
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: RefId) -> bool {
        self.refs.lock().contains_key(&id)
    }

    fn resolve(&self, id: RefId) -> Result<Arc<RefState>> {
        self.refs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(PoolError::UnknownRef(id))
    }

    /// Store `value` (estimated at `size` bytes) on the default device.
    pub fn put(&self, value: PoolValue, size: u64) -> Result<RefId> {
        let device = self.default_device().ok_or_else(|| {
            PoolError::InvalidConfig("datastore has no default device".to_string())
        })?;
        self.put_on(value, size, device)
    }

    /// Store `value` with `device` as its root.
    pub fn put_on(&self, value: PoolValue, size: u64, device: DeviceRef) -> Result<RefId> {
        let id = RefId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(RefState::new(
            size,
            StorageState::initial(value, Arc::clone(&device)),
        ));
        self.refs.lock().insert(id, Arc::clone(&state));
        trace!(ref_id = %id, size, "put");

        match device.write(&state, id) {
            Ok(()) => Ok(id),
            Err(e) => {
                self.refs.lock().remove(&id);
                Err(e)
            }
        }
    }

    /// Materialize and return the value of `id`.
    pub fn get(&self, id: RefId) -> Result<PoolValue> {
        let state = self.resolve(id)?;
        let root = Arc::clone(state.storage_read().root());
        root.read(&state, id, true)?
            .ok_or(PoolError::MissingLeaf(id))
    }

    /// Delete `id` from its root device and drop it from the table.
    pub fn remove(&self, id: RefId) -> Result<()> {
        let state = self.resolve(id)?;
        let root = Arc::clone(state.storage_read().root());
        root.delete(&state, id)?;
        self.refs.lock().remove(&id);
        trace!(ref_id = %id, "removed");
        Ok(())
    }

    /// Re-parent `id` onto `device`.
    ///
    /// A no-op when `device` already is the root and the state still
    /// carries the value; otherwise the value is written to `device` first
    /// and the root swapped afterwards.
    pub fn set_device(&self, id: RefId, device: DeviceRef) -> Result<()> {
        let state = self.resolve(id)?;
        let snapshot = state.storage_read();
        if snapshot.root().device_id() == device.device_id()
            && (snapshot.data().is_some() || !snapshot.leaves().is_empty())
        {
            return Ok(());
        }

        device.write(&state, id)?;
        // Wait out the write's readiness before swapping the root over it.
        state.storage_read();
        let next = state.storage_rcu(|current| {
            let mut next = StorageState::next(current);
            next.set_root(Arc::clone(&device));
            next
        });
        next.ready().set();
        Ok(())
    }

    /// Set retention for `id` on its root device (or on every leaf when
    /// `all` is true).
    pub fn set_retain(&self, id: RefId, retain: bool, all: bool) -> Result<()> {
        let state = self.resolve(id)?;
        let root = Arc::clone(state.storage_read().root());
        root.retain(&state, id, retain, all)
    }
}

impl Default for Datastore {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-global datastore.
pub fn global() -> &'static Datastore {
    static GLOBAL: OnceLock<Datastore> = OnceLock::new();
    GLOBAL.get_or_init(Datastore::new)
}

/// Overwrite the global default device.
pub fn set_default_device(device: DeviceRef) {
    global().set_default_device(device);
}

/// Store a value in the global datastore.
pub fn put(value: PoolValue, size: u64) -> Result<RefId> {
    global().put(value, size)
}

/// Materialize a value from the global datastore.
pub fn get(id: RefId) -> Result<PoolValue> {
    global().get(id)
}

/// Remove a value from the global datastore.
pub fn remove(id: RefId) -> Result<()> {
    global().remove(id)
}

/// Re-parent a global reference onto a new root device.
pub fn set_device(id: RefId, device: DeviceRef) -> Result<()> {
    global().set_device(id, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuRamDevice;

    fn memory_store() -> Datastore {
        Datastore::with_default_device(Arc::new(CpuRamDevice::new()))
    }

    #[test]
    fn test_put_get_roundtrip() {
        let store = memory_store();
        let id = store.put(Arc::new(vec![1u8, 2, 3]), 3).unwrap();
        let value = store.get(id).unwrap();
        assert_eq!(value.downcast_ref::<Vec<u8>>().unwrap(), &vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_forgets_the_ref() {
        let store = memory_store();
        let id = store.put(Arc::new(7u64), 8).unwrap();
        store.remove(id).unwrap();

        assert!(!store.contains(id));
        assert!(matches!(store.get(id), Err(PoolError::UnknownRef(_))));
        assert!(matches!(store.remove(id), Err(PoolError::UnknownRef(_))));
    }

    #[test]
    fn test_put_without_default_device_fails() {
        let store = Datastore::new();
        let err = store.put(Arc::new(1u8), 1).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[test]
    fn test_ids_are_unique() {
        let store = memory_store();
        let a = store.put(Arc::new(1u64), 8).unwrap();
        let b = store.put(Arc::new(2u64), 8).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_set_device_same_root_is_noop() {
        let store = memory_store();
        let device = store.default_device().unwrap();
        let id = store.put(Arc::new(5u64), 8).unwrap();

        store.set_device(id, Arc::clone(&device)).unwrap();
        store.set_device(id, device).unwrap();
        assert_eq!(*store.get(id).unwrap().downcast_ref::<u64>().unwrap(), 5);
    }

    #[test]
    fn test_default_device_cell_is_overwritable() {
        let store = memory_store();
        let first = store.default_device().unwrap();
        let second: DeviceRef = Arc::new(CpuRamDevice::new());
        store.set_default_device(Arc::clone(&second));
        let current = store.default_device().unwrap();
        assert_ne!(first.device_id(), current.device_id());
        assert_eq!(second.device_id(), current.device_id());
    }
}
