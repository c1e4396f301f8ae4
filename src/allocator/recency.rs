//! Two-tier recency allocator.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::allocator::AllocatorStats;
use crate::codec::PoolValue;
use crate::device::{DeviceId, StorageDevice};
use crate::error::{PoolError, Result};
use crate::resource::ResourceHandle;
use crate::state::{DeviceRef, RefId, RefState};

/// Eviction policy of a [`SimpleRecencyAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecencyPolicy {
    /// Evict the least recently used ref.
    Lru,
    /// Evict the most recently used ref.
    Mru,
}

impl FromStr for RecencyPolicy {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(RecencyPolicy::Lru),
            "mru" => Ok(RecencyPolicy::Mru),
            other => Err(PoolError::InvalidConfig(format!(
                "unknown recency policy: {other}"
            ))),
        }
    }
}

/// Construction options for [`SimpleRecencyAllocator`].
#[derive(Debug, Clone)]
pub struct RecencyConfig {
    /// Byte limit of the upper (memory) tier. Must be positive.
    pub mem_limit: u64,
    /// Byte limit of the lower (secondary) tier. Must be positive.
    pub device_limit: u64,
    /// Eviction policy.
    pub policy: RecencyPolicy,
    /// Initial value of the retain cell.
    pub retain: bool,
}

impl RecencyConfig {
    /// LRU options with the given tier limits.
    pub fn new(mem_limit: u64, device_limit: u64) -> Self {
        Self {
            mem_limit,
            device_limit,
            policy: RecencyPolicy::Lru,
            retain: false,
        }
    }

    /// Set the eviction policy.
    pub fn with_policy(mut self, policy: RecencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the initial retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.mem_limit == 0 {
            return Err(PoolError::InvalidConfig(
                "mem_limit must be positive".to_string(),
            ));
        }
        if self.device_limit == 0 {
            return Err(PoolError::InvalidConfig(
                "device_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
struct TierLists {
    /// Most recent at the front.
    mem_refs: VecDeque<RefId>,
    device_refs: VecDeque<RefId>,
    ref_cache: HashMap<RefId, Arc<RefState>>,
}

/// Composite device that keeps recently used refs on an upper (memory)
/// device and spills the rest to a lower device, within per-tier byte
/// limits.
///
/// Accounting is approximate: it sums the size estimates of admitted refs,
/// so limits are advisory rather than enforced against the medium.
pub struct SimpleRecencyAllocator {
    id: DeviceId,
    upper: DeviceRef,
    lower: DeviceRef,
    mem_limit: u64,
    device_limit: u64,
    policy: RecencyPolicy,
    retain: AtomicBool,
    stats: AllocatorStats,
    inner: Mutex<TierLists>,
}

impl SimpleRecencyAllocator {
    /// Create an allocator composing `upper` and `lower`.
    pub fn new(config: RecencyConfig, upper: DeviceRef, lower: DeviceRef) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id: DeviceId::next(),
            upper,
            lower,
            mem_limit: config.mem_limit,
            device_limit: config.device_limit,
            policy: config.policy,
            retain: AtomicBool::new(config.retain),
            stats: AllocatorStats::new(),
            inner: Mutex::new(TierLists::default()),
        })
    }

    /// Read and migration counters.
    pub fn stats(&self) -> &AllocatorStats {
        &self.stats
    }

    /// The upper tier device.
    pub fn upper(&self) -> &DeviceRef {
        &self.upper
    }

    /// The lower tier device.
    pub fn lower(&self) -> &DeviceRef {
        &self.lower
    }

    /// Refs currently resident in the upper tier, most recent first.
    pub fn mem_refs(&self) -> Vec<RefId> {
        self.inner.lock().mem_refs.iter().copied().collect()
    }

    /// Refs currently resident in the lower tier.
    pub fn device_refs(&self) -> Vec<RefId> {
        self.inner.lock().device_refs.iter().copied().collect()
    }

    /// Whether the allocator still tracks `id`.
    pub fn is_cached(&self, id: RefId) -> bool {
        self.inner.lock().ref_cache.contains_key(&id)
    }

    fn owns_resource(device: &DeviceRef, resource: &ResourceHandle) -> bool {
        let id = resource.resource_id();
        device
            .storage_resources()
            .iter()
            .any(|r| r.resource_id() == id)
    }

    fn sum_sizes(list: &VecDeque<RefId>, cache: &HashMap<RefId, Arc<RefState>>) -> u64 {
        list.iter()
            .map(|r| cache.get(r).map_or(0, |s| s.size()))
            .sum()
    }

    /// Make room for `id` in the destination tier and place it there.
    ///
    /// Runs with the allocator lock held. `to_mem` selects the destination
    /// (upper tier when true); victims spill to the opposite tier, written
    /// there before their source copy is deleted so a failure never loses
    /// the only copy.
    fn migrate(
        &self,
        lists: &mut TierLists,
        state: &Arc<RefState>,
        id: RefId,
        to_mem: bool,
        read: bool,
    ) -> Result<Option<PoolValue>> {
        let (dest_limit, spill_limit) = if to_mem {
            (self.mem_limit, self.device_limit)
        } else {
            (self.device_limit, self.mem_limit)
        };
        let (dest_device, spill_device) = if to_mem {
            (&self.upper, &self.lower)
        } else {
            (&self.lower, &self.upper)
        };
        let ref_size = state.size();

        // Victim planning on an immutable view. The incoming ref is
        // excluded from the destination accounting; it is about to be
        // (re)placed at the head.
        let victims = {
            let (dest_view, spill_view) = if to_mem {
                (&lists.mem_refs, &lists.device_refs)
            } else {
                (&lists.device_refs, &lists.mem_refs)
            };
            let mut dest_size = Self::sum_sizes(dest_view, &lists.ref_cache)
                .saturating_sub(if dest_view.contains(&id) { ref_size } else { 0 });
            let mut spill_size = Self::sum_sizes(spill_view, &lists.ref_cache);

            let scan_from_head = to_mem == matches!(self.policy, RecencyPolicy::Mru);
            let candidates: Vec<RefId> = if scan_from_head {
                dest_view.iter().copied().filter(|r| *r != id).collect()
            } else {
                dest_view.iter().rev().copied().filter(|r| *r != id).collect()
            };

            let mut victims = Vec::new();
            for candidate in candidates {
                if ref_size + dest_size <= dest_limit {
                    break;
                }
                let candidate_size = lists.ref_cache.get(&candidate).map_or(0, |s| s.size());
                // A victim that does not fit in the spillover tier is
                // skipped, not evicted.
                if spill_size + candidate_size <= spill_limit {
                    victims.push(candidate);
                    dest_size -= candidate_size;
                    spill_size += candidate_size;
                }
            }
            if ref_size + dest_size > dest_limit {
                return Err(PoolError::MigrationInvariantViolated {
                    needed: ref_size + dest_size,
                    limit: dest_limit,
                });
            }
            victims
        };

        if !victims.is_empty() {
            debug!(
                ref_id = %id,
                to_mem,
                victims = victims.len(),
                "evicting to make room"
            );
        }

        // Eviction batch: spill copy first, then drop the source copy.
        for victim in &victims {
            let victim_state = lists
                .ref_cache
                .get(victim)
                .cloned()
                .ok_or(PoolError::UnknownRef(*victim))?;
            spill_device.write(&victim_state, *victim)?;
            dest_device.delete(&victim_state, *victim)?;
            self.stats.record_evict();
        }
        {
            let (dest_list, spill_list) = if to_mem {
                (&mut lists.mem_refs, &mut lists.device_refs)
            } else {
                (&mut lists.device_refs, &mut lists.mem_refs)
            };
            for victim in &victims {
                dest_list.retain(|r| r != victim);
                spill_list.push_back(*victim);
            }
            dest_list.retain(|r| *r != id);
            dest_list.push_front(id);
        }

        dest_device.write(state, id)?;

        // A pre-existing copy in the spillover tier is now stale.
        let had_spill_copy = {
            let spill_list = if to_mem {
                &mut lists.device_refs
            } else {
                &mut lists.mem_refs
            };
            match spill_list.iter().position(|r| *r == id) {
                Some(pos) => {
                    spill_list.remove(pos);
                    true
                }
                None => false,
            }
        };
        if had_spill_copy {
            spill_device.delete(state, id)?;
        }

        if read {
            dest_device.read(state, id, true)
        } else {
            Ok(None)
        }
    }
}

impl std::fmt::Debug for SimpleRecencyAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleRecencyAllocator")
            .field("id", &self.id)
            .field("mem_limit", &self.mem_limit)
            .field("device_limit", &self.device_limit)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl StorageDevice for SimpleRecencyAllocator {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> String {
        "recency-allocator".to_string()
    }

    fn storage_resources(&self) -> Vec<ResourceHandle> {
        let mut resources = self.upper.storage_resources();
        resources.extend(self.lower.storage_resources());
        resources
    }

    fn externally_varying(&self) -> bool {
        false
    }

    fn capacity(&self, resource: Option<&ResourceHandle>) -> Result<u64> {
        match resource {
            None => Ok(self.mem_limit + self.device_limit),
            Some(r) if Self::owns_resource(&self.upper, r) => Ok(self.mem_limit),
            Some(r) if Self::owns_resource(&self.lower, r) => Ok(self.device_limit),
            Some(r) => Err(PoolError::InvalidResourceForDevice {
                resource: r.name(),
                device: self.name(),
            }),
        }
    }

    fn utilized(&self, resource: Option<&ResourceHandle>) -> Result<u64> {
        let lists = self.inner.lock();
        let mem = Self::sum_sizes(&lists.mem_refs, &lists.ref_cache);
        let device = Self::sum_sizes(&lists.device_refs, &lists.ref_cache);
        match resource {
            None => Ok(mem + device),
            Some(r) if Self::owns_resource(&self.upper, r) => Ok(mem),
            Some(r) if Self::owns_resource(&self.lower, r) => Ok(device),
            Some(r) => Err(PoolError::InvalidResourceForDevice {
                resource: r.name(),
                device: self.name(),
            }),
        }
    }

    fn available(&self, resource: Option<&ResourceHandle>) -> Result<u64> {
        let capacity = self.capacity(resource)?;
        let utilized = self.utilized(resource)?;
        Ok(capacity.saturating_sub(utilized))
    }

    fn write(&self, state: &Arc<RefState>, id: RefId) -> Result<()> {
        let mut lists = self.inner.lock();
        let was_cached = lists.ref_cache.contains_key(&id);
        lists.ref_cache.insert(id, Arc::clone(state));

        let size = state.size();
        if size > self.mem_limit && size > self.device_limit {
            if !was_cached {
                lists.ref_cache.remove(&id);
            }
            return Err(PoolError::RefTooLarge {
                id,
                size,
                mem_limit: self.mem_limit,
                device_limit: self.device_limit,
            });
        }

        // A ref that can never fit the upper tier resides in the lower
        // tier from the start.
        let to_mem = size <= self.mem_limit;
        let outcome = self.migrate(&mut lists, state, id, to_mem, false);
        if outcome.is_err() && !was_cached {
            // Same rollback as the size check: a failed admission must not
            // leave a cache entry that neither list can reach, nor a list
            // entry with no cached state.
            lists.ref_cache.remove(&id);
            lists.mem_refs.retain(|r| *r != id);
            lists.device_refs.retain(|r| *r != id);
        }
        outcome.map(|_| ())
    }

    fn read(&self, state: &Arc<RefState>, id: RefId, materialize: bool) -> Result<Option<PoolValue>> {
        let mut lists = self.inner.lock();
        if lists.mem_refs.contains(&id) {
            self.stats.record_hit();
            if let Some(pos) = lists.mem_refs.iter().position(|r| *r == id) {
                lists.mem_refs.remove(pos);
                lists.mem_refs.push_front(id);
            }
            self.upper.read(state, id, materialize)
        } else if lists.device_refs.contains(&id) {
            self.stats.record_miss();
            let to_mem = state.size() <= self.mem_limit;
            self.migrate(&mut lists, state, id, to_mem, materialize)
        } else {
            Err(PoolError::UnknownRef(id))
        }
    }

    fn delete(&self, state: &Arc<RefState>, id: RefId) -> Result<()> {
        let mut lists = self.inner.lock();
        let retain = self.retain.load(Ordering::Relaxed);

        if lists.mem_refs.contains(&id) {
            if retain {
                // Keep the bytes: demote to the lower tier, then fall
                // through to the lower-tier removal below.
                self.migrate(&mut lists, state, id, false, false)?;
            } else {
                self.upper.delete(state, id)?;
                lists.mem_refs.retain(|r| *r != id);
                lists.ref_cache.remove(&id);
                return Ok(());
            }
        }

        if lists.device_refs.contains(&id) {
            if retain {
                self.lower.retain(state, id, true, false)?;
            }
            self.lower.delete(state, id)?;
            lists.device_refs.retain(|r| *r != id);
            lists.ref_cache.remove(&id);
        }
        Ok(())
    }

    fn retain(&self, _state: &Arc<RefState>, _id: RefId, retain: bool, _all: bool) -> Result<()> {
        // Takes effect lazily, at deletion time.
        self.retain.store(retain, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuRamDevice;
    use crate::state::StorageState;

    fn devices() -> (DeviceRef, DeviceRef) {
        (
            Arc::new(CpuRamDevice::new()) as DeviceRef,
            Arc::new(CpuRamDevice::new()) as DeviceRef,
        )
    }

    fn ref_state(size: u64, root: &DeviceRef) -> Arc<RefState> {
        Arc::new(RefState::new(
            size,
            StorageState::initial(Arc::new(size), Arc::clone(root)),
        ))
    }

    #[test]
    fn test_zero_mem_limit_rejected() {
        let (upper, lower) = devices();
        let err = SimpleRecencyAllocator::new(RecencyConfig::new(0, 100), upper, lower)
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_device_limit_rejected() {
        let (upper, lower) = devices();
        let err = SimpleRecencyAllocator::new(RecencyConfig::new(100, 0), upper, lower)
            .err()
            .unwrap();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("lru".parse::<RecencyPolicy>().unwrap(), RecencyPolicy::Lru);
        assert_eq!("MRU".parse::<RecencyPolicy>().unwrap(), RecencyPolicy::Mru);
        assert!("foo".parse::<RecencyPolicy>().is_err());
    }

    #[test]
    fn test_failed_admission_rolls_back_the_cache() {
        let (upper, lower) = devices();
        let sra =
            SimpleRecencyAllocator::new(RecencyConfig::new(100, 50), Arc::clone(&upper), lower)
                .unwrap();

        let a = RefId(1);
        let state_a = ref_state(60, &upper);
        StorageDevice::write(&sra, &state_a, a).unwrap();

        // No victim fits the lower tier, so admitting a second resident
        // fails and must leave no trace of it.
        let b = RefId(2);
        let state_b = ref_state(60, &upper);
        let err = StorageDevice::write(&sra, &state_b, b).unwrap_err();
        assert!(matches!(err, PoolError::MigrationInvariantViolated { .. }));

        assert!(!sra.is_cached(b));
        assert!(sra.mem_refs().iter().all(|r| *r != b));
        assert!(sra.device_refs().is_empty());

        // The earlier admission is untouched.
        assert!(sra.is_cached(a));
        assert_eq!(sra.mem_refs(), vec![a]);
    }

    #[test]
    fn test_externally_varying_is_false() {
        let (upper, lower) = devices();
        let sra = SimpleRecencyAllocator::new(RecencyConfig::new(10, 10), upper, lower).unwrap();
        assert!(!sra.externally_varying());
    }

    #[test]
    fn test_capacity_per_tier() {
        let (upper, lower) = devices();
        let sra = SimpleRecencyAllocator::new(
            RecencyConfig::new(100, 1000),
            Arc::clone(&upper),
            lower,
        )
        .unwrap();

        let upper_resource = upper.storage_resources().pop().unwrap();
        assert_eq!(sra.capacity(Some(&upper_resource)).unwrap(), 100);
        assert_eq!(sra.capacity(None).unwrap(), 1100);
        assert_eq!(sra.available(None).unwrap(), 1100);
    }
}
