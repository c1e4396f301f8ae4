//! In-memory leaf device.

use std::sync::Arc;

use crate::codec::PoolValue;
use crate::device::{validate_resource, DeviceId, StorageDevice};
use crate::error::{PoolError, Result};
use crate::resource::{CpuRamResource, ResourceHandle, StorageResource};
use crate::state::{RefId, RefState, StorageState};

/// Leaf device that keeps the value live in process memory.
///
/// Presence on this device is the `data` slot of the placement state; the
/// device never appends leaves. A write on an evicted reference pulls the
/// bytes back through the first leaf that still holds a copy.
#[derive(Debug)]
pub struct CpuRamDevice {
    id: DeviceId,
    resource: Arc<CpuRamResource>,
}

impl CpuRamDevice {
    /// Create a memory device over the process RAM resource.
    pub fn new() -> Self {
        Self {
            id: DeviceId::next(),
            resource: CpuRamResource::global(),
        }
    }
}

impl Default for CpuRamDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageDevice for CpuRamDevice {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> String {
        "cpu-ram-device".to_string()
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
        let snapshot = state.storage_read();
        if snapshot.data().is_some() {
            return Ok(());
        }

        // Evicted: pull the bytes back through the first leaf holding a
        // copy.
        let leaf = snapshot
            .leaves()
            .first()
            .ok_or(PoolError::MissingLeaf(id))?;
        let value = leaf
            .device()
            .read(state, id, true)?
            .ok_or(PoolError::MissingLeaf(id))?;

        let next = state.storage_rcu(|current| {
            let mut next = StorageState::next(current);
            next.set_data(Arc::clone(&value));
            next
        });
        next.ready().set();
        Ok(())
    }

    fn read(&self, state: &Arc<RefState>, id: RefId, materialize: bool) -> Result<Option<PoolValue>> {
        let snapshot = state.storage_read();
        if let Some(value) = snapshot.data() {
            return Ok(materialize.then_some(value));
        }
        match snapshot.leaves().first() {
            Some(leaf) => leaf.device().read(state, id, materialize),
            None => Err(PoolError::MissingLeaf(id)),
        }
    }

    fn delete(&self, state: &Arc<RefState>, _id: RefId) -> Result<()> {
        // Rendezvous with any in-flight write: the bytes must be on some
        // leaf before the in-memory copy goes away.
        state.storage_read();
        let next = state.storage_rcu(|current| {
            let mut next = StorageState::next(current);
            next.clear_data();
            next
        });
        next.ready().set();
        Ok(())
    }

    fn retain(&self, state: &Arc<RefState>, _id: RefId, retain: bool, all: bool) -> Result<()> {
        // Retention in memory is not expressible; only an all-leaves
        // request from the root has an effect here.
        if all {
            state.storage_read();
            let next = state.storage_rcu(|current| {
                let mut next = StorageState::next(current);
                next.retain_all_leaves(retain);
                next
            });
            next.ready().set();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeviceRef;

    fn value_of(n: u64) -> PoolValue {
        Arc::new(n)
    }

    #[test]
    fn test_read_returns_resident_value() {
        let device: DeviceRef = Arc::new(CpuRamDevice::new());
        let state = Arc::new(RefState::new(8, StorageState::initial(value_of(11), Arc::clone(&device))));

        let value = device.read(&state, RefId(1), true).unwrap().unwrap();
        assert_eq!(*value.downcast_ref::<u64>().unwrap(), 11);

        // Accounting-only read materializes nothing.
        assert!(device.read(&state, RefId(1), false).unwrap().is_none());
    }

    #[test]
    fn test_delete_clears_data() {
        let device: DeviceRef = Arc::new(CpuRamDevice::new());
        let state = Arc::new(RefState::new(8, StorageState::initial(value_of(2), Arc::clone(&device))));

        device.delete(&state, RefId(1)).unwrap();
        let snapshot = state.storage_read();
        assert!(snapshot.data().is_none());
    }

    #[test]
    fn test_read_after_delete_without_leaf_is_missing() {
        let device: DeviceRef = Arc::new(CpuRamDevice::new());
        let state = Arc::new(RefState::new(8, StorageState::initial(value_of(2), Arc::clone(&device))));

        device.delete(&state, RefId(1)).unwrap();
        let err = device.read(&state, RefId(1), true).unwrap_err();
        assert!(matches!(err, PoolError::MissingLeaf(RefId(1))));
    }

    #[test]
    fn test_write_is_idempotent_when_resident() {
        let device: DeviceRef = Arc::new(CpuRamDevice::new());
        let state = Arc::new(RefState::new(8, StorageState::initial(value_of(5), Arc::clone(&device))));

        device.write(&state, RefId(1)).unwrap();
        let value = device.read(&state, RefId(1), true).unwrap().unwrap();
        assert_eq!(*value.downcast_ref::<u64>().unwrap(), 5);
    }

    #[test]
    fn test_resource_validation() {
        let device = CpuRamDevice::new();
        let owned = device.storage_resources().pop().unwrap();
        assert!(device.capacity(Some(&owned)).is_ok());

        let foreign: ResourceHandle =
            Arc::new(crate::resource::FilesystemResource::new("/tmp"));
        let err = device.capacity(Some(&foreign)).unwrap_err();
        assert!(matches!(err, PoolError::InvalidResourceForDevice { .. }));
    }
}
