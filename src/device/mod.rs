//! Storage device abstraction.
//!
//! A [`StorageDevice`] is the placement contract of the engine: it ensures
//! a reference's bytes are present on its media (`write`), materializes
//! them back (`read`), removes them (`delete`), and controls whether the
//! underlying bytes survive removal (`retain`). Devices also answer the
//! same capacity queries as their [resources](crate::resource), optionally
//! scoped to a single resource they own.
//!
//! # Built-in devices
//!
//! - [`CpuRamDevice`]: keeps the value live in memory.
//! - [`SerializationFileDevice`]: serializes the value to one file per
//!   reference, with an optional byte-stream filter chain.
//! - [`SimpleRecencyAllocator`](crate::allocator::SimpleRecencyAllocator):
//!   a composite device that swaps between an upper and a lower device
//!   under a recency policy.
//!
//! Custom devices implement [`StorageDevice`] and participate through the
//! same `Arc<dyn StorageDevice>` handles.

mod file;
mod memory;

pub use file::{FileDeviceConfig, SerializationFileDevice};
pub use memory::CpuRamDevice;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec::PoolValue;
use crate::error::{PoolError, Result};
use crate::resource::ResourceHandle;
use crate::state::{RefId, RefState};

/// Process-unique identity of a device object.
///
/// Leaves and roots compare devices by identity: two file devices over the
/// same directory are distinct devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u64);

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

impl DeviceId {
    pub(crate) fn next() -> Self {
        DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Placement contract for one or more storage resources.
///
/// All operations take the reference's [`RefState`] so implementations can
/// swap placement states and read the size estimate without going back to
/// the datastore map.
pub trait StorageDevice: Send + Sync + fmt::Debug {
    /// Identity of this device object.
    fn device_id(&self) -> DeviceId;

    /// Human-readable name, used in errors and logs.
    fn name(&self) -> String;

    /// The resources this device places bytes on.
    fn storage_resources(&self) -> Vec<ResourceHandle>;

    /// Whether availability can change without engine-initiated calls.
    /// Leaf devices share their media with the rest of the system; a
    /// composite allocator accounts for every byte it admits.
    fn externally_varying(&self) -> bool {
        true
    }

    /// Capacity in bytes, for one owned resource or for the device as a
    /// whole.
    fn capacity(&self, resource: Option<&ResourceHandle>) -> Result<u64>;

    /// Available bytes, for one owned resource or for the device as a
    /// whole.
    fn available(&self, resource: Option<&ResourceHandle>) -> Result<u64>;

    /// Bytes in use. Best-effort, like every other byte count.
    fn utilized(&self, resource: Option<&ResourceHandle>) -> Result<u64> {
        let capacity = self.capacity(resource)?;
        let available = self.available(resource)?;
        Ok(capacity.saturating_sub(available))
    }

    /// Ensure the value is physically present on this device. May first
    /// force a read from another leaf.
    fn write(&self, state: &Arc<RefState>, id: RefId) -> Result<()>;

    /// Return the value when `materialize` is true; perform accounting
    /// only (recency touch) when false. May transparently fetch from
    /// another leaf.
    fn read(&self, state: &Arc<RefState>, id: RefId, materialize: bool) -> Result<Option<PoolValue>>;

    /// Remove this device's copy. A leaf with `retain` set keeps its
    /// medium-level bytes. Missing leaves are tolerated.
    fn delete(&self, state: &Arc<RefState>, id: RefId) -> Result<()>;

    /// Set retention on this device's leaf, or on every leaf when `all`
    /// is true and this device is the root. Missing leaves are tolerated.
    fn retain(&self, state: &Arc<RefState>, id: RefId, retain: bool, all: bool) -> Result<()>;
}

/// Check that `resource` is one of `device`'s resources.
pub(crate) fn validate_resource(
    device: &dyn StorageDevice,
    resource: &ResourceHandle,
) -> Result<()> {
    let id = resource.resource_id();
    if device
        .storage_resources()
        .iter()
        .any(|r| r.resource_id() == id)
    {
        Ok(())
    } else {
        Err(PoolError::InvalidResourceForDevice {
            resource: resource.name(),
            device: device.name(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Device that owns nothing and does nothing. Unit-test scaffolding.
    #[derive(Debug)]
    pub(crate) struct InertDevice {
        id: DeviceId,
    }

    impl InertDevice {
        pub(crate) fn new() -> Self {
            Self {
                id: DeviceId::next(),
            }
        }
    }

    impl StorageDevice for InertDevice {
        fn device_id(&self) -> DeviceId {
            self.id
        }

        fn name(&self) -> String {
            "inert".to_string()
        }

        fn storage_resources(&self) -> Vec<ResourceHandle> {
            Vec::new()
        }

        fn capacity(&self, _resource: Option<&ResourceHandle>) -> Result<u64> {
            Ok(0)
        }

        fn available(&self, _resource: Option<&ResourceHandle>) -> Result<u64> {
            Ok(0)
        }

        fn write(&self, _state: &Arc<RefState>, _id: RefId) -> Result<()> {
            Ok(())
        }

        fn read(
            &self,
            _state: &Arc<RefState>,
            _id: RefId,
            _materialize: bool,
        ) -> Result<Option<PoolValue>> {
            Ok(None)
        }

        fn delete(&self, _state: &Arc<RefState>, _id: RefId) -> Result<()> {
            Ok(())
        }

        fn retain(&self, _state: &Arc<RefState>, _id: RefId, _retain: bool, _all: bool) -> Result<()> {
            Ok(())
        }
    }
}
