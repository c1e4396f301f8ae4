//! Per-reference placement state and its concurrency protocol.
//!
//! Every managed reference owns a [`RefState`]: a fixed size estimate plus
//! an RCU cell holding the current [`StorageState`] snapshot. Placement
//! transitions never mutate a published snapshot; they install a whole new
//! one. Readers obtain snapshots through [`RefState::storage_read`], which
//! waits on the snapshot's [`ReadyEvent`] so that no caller ever observes a
//! half-initialized placement.
//!
//! Two narrow exceptions to snapshot immutability exist, both one-shot
//! absent-to-present cell assignments performed by the background task that
//! subsequently fires `ready`: the value slot (`data`) and a leaf's
//! device handle. See [`StorageState`].

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};

use crate::codec::PoolValue;
use crate::device::{DeviceId, StorageDevice};

/// Numeric identity of one managed reference, unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(pub u64);

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared handle to a device, used both as the root of a [`RefState`] and
/// inside leaves.
pub type DeviceRef = Arc<dyn StorageDevice>;

/// Device-specific leaf handle. Built-in devices store a [`FileRef`];
/// user-defined leaf devices may store anything downcastable.
pub type LeafHandle = Box<dyn Any + Send + Sync>;

/// Handle to a serialized file on a filesystem resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    /// Absolute path of the serialized file.
    pub path: PathBuf,
    /// Estimated size of the serialized value in bytes.
    pub size: u64,
}

/// One-shot sticky readiness notification.
///
/// Once fired it stays fired; waiting after the fact is a single atomic
/// load. Firing takes the internal lock so no waiter can miss the wakeup.
pub struct ReadyEvent {
    fired: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl ReadyEvent {
    /// A not-yet-fired event.
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// An event that is already fired.
    pub fn fired() -> Self {
        Self {
            fired: AtomicBool::new(true),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// Fire the event, waking all current and future waiters.
    pub fn set(&self) {
        let guard = self.lock.lock();
        self.fired.store(true, Ordering::Release);
        drop(guard);
        self.cvar.notify_all();
    }

    /// Whether the event has fired.
    pub fn is_set(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Block until the event fires.
    pub fn wait(&self) {
        if self.fired.load(Ordering::Acquire) {
            return;
        }
        let mut guard = self.lock.lock();
        while !self.fired.load(Ordering::Acquire) {
            self.cvar.wait(&mut guard);
        }
    }
}

impl Default for ReadyEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReadyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyEvent")
            .field("fired", &self.is_set())
            .finish()
    }
}

/// One physical location currently holding a copy of the value.
///
/// Cloning a leaf shares its handle cell: a background write that publishes
/// the handle is visible through every state that carries the leaf.
#[derive(Clone)]
pub struct StorageLeaf {
    device: DeviceRef,
    handle: Arc<OnceLock<LeafHandle>>,
    retain: bool,
}

impl StorageLeaf {
    /// A leaf for `device` with an absent handle.
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            handle: Arc::new(OnceLock::new()),
            retain: false,
        }
    }

    /// The owning device.
    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    /// Identity of the owning device.
    pub fn device_id(&self) -> DeviceId {
        self.device.device_id()
    }

    /// The device-specific handle, if published.
    pub fn handle(&self) -> Option<&LeafHandle> {
        self.handle.get()
    }

    /// Publish the handle. Must only be called by the background task that
    /// will fire the owning state's `ready`; a second call is ignored.
    pub fn publish_handle(&self, handle: LeafHandle) {
        let _ = self.handle.set(handle);
    }

    /// Whether the underlying bytes survive a delete.
    pub fn retain(&self) -> bool {
        self.retain
    }

    /// A copy of this leaf (sharing the handle cell) with `retain` set.
    pub fn with_retain(&self, retain: bool) -> Self {
        Self {
            device: Arc::clone(&self.device),
            handle: Arc::clone(&self.handle),
            retain,
        }
    }
}

impl fmt::Debug for StorageLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLeaf")
            .field("device", &self.device.device_id())
            .field("handle_set", &self.handle.get().is_some())
            .field("retain", &self.retain)
            .finish()
    }
}

/// Immutable snapshot of where a reference's bytes live.
///
/// Fields other than `ready` may not be observed before `ready` fires;
/// [`RefState::storage_read`] enforces this.
pub struct StorageState {
    data: OnceLock<PoolValue>,
    leaves: Vec<StorageLeaf>,
    root: DeviceRef,
    ready: ReadyEvent,
}

impl StorageState {
    /// Initial state for a freshly created reference: value in memory, no
    /// leaves, already ready.
    pub fn initial(value: PoolValue, root: DeviceRef) -> Self {
        let data = OnceLock::new();
        let _ = data.set(value);
        Self {
            data,
            leaves: Vec::new(),
            root,
            ready: ReadyEvent::fired(),
        }
    }

    /// Copy-constructor: inherit every field of `prev`, with a fresh
    /// unfired `ready`. All RCU update closures must build through this so
    /// unchanged fields carry over.
    pub fn next(prev: &StorageState) -> Self {
        let data = OnceLock::new();
        if let Some(value) = prev.data.get() {
            let _ = data.set(Arc::clone(value));
        }
        Self {
            data,
            leaves: prev.leaves.clone(),
            root: Arc::clone(&prev.root),
            ready: ReadyEvent::new(),
        }
    }

    /// The in-memory value, if present.
    pub fn data(&self) -> Option<PoolValue> {
        self.data.get().cloned()
    }

    /// Publish the value slot. Must only be called by the background task
    /// that will fire this state's `ready`.
    pub fn publish_data(&self, value: PoolValue) {
        let _ = self.data.set(value);
    }

    /// Drop the in-memory value. Only valid on a state that has not been
    /// published yet (inside an RCU closure).
    pub fn clear_data(&mut self) {
        self.data = OnceLock::new();
    }

    /// Set the in-memory value on a not-yet-published state.
    pub fn set_data(&mut self, value: PoolValue) {
        self.data = OnceLock::new();
        let _ = self.data.set(value);
    }

    /// Every physical location currently holding a copy, insertion order.
    pub fn leaves(&self) -> &[StorageLeaf] {
        &self.leaves
    }

    /// The leaf owned by `device`, if any.
    pub fn leaf_for(&self, device: DeviceId) -> Option<&StorageLeaf> {
        self.leaves.iter().find(|l| l.device_id() == device)
    }

    /// Append a leaf on a not-yet-published state. A device may hold at
    /// most one leaf per state; a duplicate replaces the existing entry.
    pub fn push_leaf(&mut self, leaf: StorageLeaf) {
        self.leaves.retain(|l| l.device_id() != leaf.device_id());
        self.leaves.push(leaf);
    }

    /// Remove the leaf owned by `device` on a not-yet-published state.
    /// Returns the removed leaf.
    pub fn remove_leaf(&mut self, device: DeviceId) -> Option<StorageLeaf> {
        let idx = self.leaves.iter().position(|l| l.device_id() == device)?;
        Some(self.leaves.remove(idx))
    }

    /// Replace the leaf owned by `device` on a not-yet-published state.
    pub fn replace_leaf(&mut self, device: DeviceId, leaf: StorageLeaf) {
        if let Some(slot) = self.leaves.iter_mut().find(|l| l.device_id() == device) {
            *slot = leaf;
        }
    }

    /// Set the retain flag on every leaf of a not-yet-published state.
    pub fn retain_all_leaves(&mut self, retain: bool) {
        self.leaves = self.leaves.iter().map(|l| l.with_retain(retain)).collect();
    }

    /// The device managing this reference.
    pub fn root(&self) -> &DeviceRef {
        &self.root
    }

    /// Re-parent a not-yet-published state onto a new root device.
    pub fn set_root(&mut self, root: DeviceRef) {
        self.root = root;
    }

    /// The readiness event guarding this snapshot's fields.
    pub fn ready(&self) -> &ReadyEvent {
        &self.ready
    }
}

impl fmt::Debug for StorageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageState")
            .field("data_set", &self.data.get().is_some())
            .field("leaves", &self.leaves)
            .field("root", &self.root.device_id())
            .field("ready", &self.ready)
            .finish()
    }
}

/// Per-reference record: the fixed size estimate and the RCU-swappable
/// placement cell.
///
/// The cell is private; the only operations are [`storage_read`] and
/// [`storage_rcu`].
///
/// [`storage_read`]: RefState::storage_read
/// [`storage_rcu`]: RefState::storage_rcu
pub struct RefState {
    size: u64,
    storage: ArcSwap<StorageState>,
}

impl RefState {
    /// Create a record with its initial placement state.
    pub fn new(size: u64, initial: StorageState) -> Self {
        Self {
            size,
            storage: ArcSwap::from_pointee(initial),
        }
    }

    /// Estimated size of the value in bytes, fixed at creation.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Load the current placement snapshot, waiting on its readiness
    /// event.
    ///
    /// The returned value is a snapshot: it may be stale by the time its
    /// fields are inspected. Snapshots must not be cached across
    /// entrypoints.
    pub fn storage_read(&self) -> Arc<StorageState> {
        let snapshot = self.storage.load_full();
        snapshot.ready().wait();
        snapshot
    }

    /// Install a new placement state produced by `update`.
    ///
    /// `update` must be pure and build through [`StorageState::next`] so
    /// unchanged fields are inherited; it may run more than once under
    /// contention. Installation is a compare-and-swap loop keyed on the
    /// cell's pointer, so concurrent updates linearize.
    ///
    /// The returned state's `ready` has NOT fired; the caller is
    /// responsible for firing it, possibly from a background task.
    pub fn storage_rcu<F>(&self, update: F) -> Arc<StorageState>
    where
        F: Fn(&StorageState) -> StorageState,
    {
        loop {
            let current = self.storage.load_full();
            let next = Arc::new(update(&current));
            let previous = self
                .storage
                .compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&*previous, &current) {
                return next;
            }
        }
    }

    /// Like [`storage_rcu`], except `update` may decline a transition by
    /// returning `None` once it sees the current state; nothing is
    /// installed then and the current state comes back with `false`.
    ///
    /// The decision runs inside the compare-and-swap loop, so it is made
    /// against the state that actually gets replaced. Use this when a
    /// transition must be skipped if a concurrent caller already performed
    /// it; the declining caller must not fire the returned state, whose
    /// readiness belongs to whoever installed it.
    ///
    /// [`storage_rcu`]: RefState::storage_rcu
    pub fn storage_try_rcu<F>(&self, update: F) -> (Arc<StorageState>, bool)
    where
        F: Fn(&StorageState) -> Option<StorageState>,
    {
        loop {
            let current = self.storage.load_full();
            let next = match update(&current) {
                Some(next) => Arc::new(next),
                None => return (current, false),
            };
            let previous = self
                .storage
                .compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&*previous, &current) {
                return (next, true);
            }
        }
    }
}

impl fmt::Debug for RefState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefState")
            .field("size", &self.size)
            .field("storage", &self.storage.load())
            .finish()
    }
}
