//! Datastore integration tests: entrypoint round trips, unknown refs, and
//! the global instance.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use oxipool::allocator::{RecencyConfig, SimpleRecencyAllocator};
use oxipool::codec::{BincodeCodec, PoolValue};
use oxipool::device::{CpuRamDevice, FileDeviceConfig, SerializationFileDevice};
use oxipool::state::DeviceRef;
use oxipool::{Datastore, PoolError, RefId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    name: String,
    samples: Vec<u32>,
}

fn tiered_store(dir: &std::path::Path, mem_limit: u64) -> Datastore {
    let upper: DeviceRef = Arc::new(CpuRamDevice::new());
    let lower: DeviceRef = SerializationFileDevice::new(
        FileDeviceConfig::new(dir),
        Arc::new(BincodeCodec::<Record>::new()),
    )
    .unwrap();
    let sra =
        SimpleRecencyAllocator::new(RecencyConfig::new(mem_limit, 1 << 20), upper, lower).unwrap();
    Datastore::with_default_device(Arc::new(sra) as DeviceRef)
}

fn record(name: &str, n: u32) -> Record {
    Record {
        name: name.to_string(),
        samples: (0..n).collect(),
    }
}

#[test]
fn test_roundtrip_through_tiers() {
    let dir = tempfile::tempdir().unwrap();
    // Limits small enough that the second put spills the first.
    let store = tiered_store(dir.path(), 300);

    let first = record("first", 32);
    let second = record("second", 32);
    let a = store.put(Arc::new(first.clone()), 200).unwrap();
    let b = store.put(Arc::new(second.clone()), 200).unwrap();

    let got_a = store.get(a).unwrap();
    let got_b = store.get(b).unwrap();
    assert_eq!(got_a.downcast_ref::<Record>().unwrap(), &first);
    assert_eq!(got_b.downcast_ref::<Record>().unwrap(), &second);
}

#[test]
fn test_operations_on_removed_ref_fail() {
    let dir = tempfile::tempdir().unwrap();
    let store = tiered_store(dir.path(), 1024);

    let id = store.put(Arc::new(record("gone", 4)), 64).unwrap();
    store.remove(id).unwrap();

    assert!(matches!(store.get(id), Err(PoolError::UnknownRef(_))));
    assert!(matches!(store.remove(id), Err(PoolError::UnknownRef(_))));
    assert!(matches!(
        store.set_retain(id, true, false),
        Err(PoolError::UnknownRef(_))
    ));
    let other: DeviceRef = Arc::new(CpuRamDevice::new());
    assert!(matches!(
        store.set_device(id, other),
        Err(PoolError::UnknownRef(_))
    ));
}

#[test]
fn test_never_stored_ref_is_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let store = tiered_store(dir.path(), 1024);
    assert!(matches!(
        store.get(RefId(123456)),
        Err(PoolError::UnknownRef(RefId(123456)))
    ));
}

#[test]
fn test_many_refs_coexist() {
    let dir = tempfile::tempdir().unwrap();
    let store = tiered_store(dir.path(), 500);

    let ids: Vec<_> = (0..16u32)
        .map(|i| {
            store
                .put(Arc::new(record(&format!("r{i}"), i)), 100)
                .unwrap()
        })
        .collect();
    assert_eq!(store.len(), 16);

    for (i, id) in ids.iter().enumerate() {
        let value = store.get(*id).unwrap();
        assert_eq!(value.downcast_ref::<Record>().unwrap().name, format!("r{i}"));
    }

    for id in ids {
        store.remove(id).unwrap();
    }
    assert!(store.is_empty());
}

#[test]
fn test_global_entrypoints() {
    let device: DeviceRef = Arc::new(CpuRamDevice::new());
    oxipool::set_default_device(device);

    let id = oxipool::put(Arc::new(vec![3u8, 1, 4]), 3).unwrap();
    let value: PoolValue = oxipool::get(id).unwrap();
    assert_eq!(value.downcast_ref::<Vec<u8>>().unwrap(), &vec![3, 1, 4]);

    oxipool::remove(id).unwrap();
    assert!(matches!(oxipool::get(id), Err(PoolError::UnknownRef(_))));
}

#[test]
fn test_set_device_migrates_between_stores() {
    let dir = tempfile::tempdir().unwrap();
    let memory: DeviceRef = Arc::new(CpuRamDevice::new());
    let store = Datastore::with_default_device(Arc::clone(&memory));
    let file_device: DeviceRef = SerializationFileDevice::new(
        FileDeviceConfig::new(dir.path()),
        Arc::new(BincodeCodec::<Record>::new()),
    )
    .unwrap();

    let original = record("mover", 8);
    let id = store.put(Arc::new(original.clone()), 128).unwrap();

    store.set_device(id, Arc::clone(&file_device)).unwrap();
    let value = store.get(id).unwrap();
    assert_eq!(value.downcast_ref::<Record>().unwrap(), &original);

    // And back to memory.
    store.set_device(id, memory).unwrap();
    let value = store.get(id).unwrap();
    assert_eq!(value.downcast_ref::<Record>().unwrap(), &original);
}
