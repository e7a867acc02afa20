// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The enclave-side surface the pool coordinates with.
//!
//! An [`Enclave`] is pinned by the eviction pipeline through its `Arc`
//! refcount; a failed upgrade of a page's weak owner reference means
//! destruction owns that page now. The per-enclave lock serializes block,
//! track, write-back and parent cleanup, and is never taken while a list
//! lock is held.

pub mod backing;
mod tracking;

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use spin::{mutex::SpinMutex, RwLock};

use crate::addr::GuestVirtAddr;
use crate::consts::{PAGE_SIZE, SEAL_KEY_LEN};
use crate::cpumask::CpuMask;
use crate::epc::PageId;

use backing::BackingStore;
use tracking::TrackingState;

/// One address space the enclave is mapped into.
///
/// The pool only ever needs three things from a mapper: the accessed
/// indicator for aging, the ability to drop a translation when a page gets
/// blocked, and the set of CPUs that might currently be executing in it.
pub trait AddressSpace: Send + Sync {
    /// Test and clear the accessed indicator of the mapping at `vaddr`.
    fn test_and_clear_accessed(&self, vaddr: GuestVirtAddr) -> bool;

    /// Disallow new translations to the page at `vaddr`. Translations
    /// already cached on other cores may still be stale afterwards; the
    /// tracking cycle accounts for those.
    fn block(&self, vaddr: GuestVirtAddr);

    /// CPUs that might be executing inside this address space.
    fn cpus(&self) -> CpuMask;
}

/// Back reference from a resident page to its owner.
#[derive(Clone)]
pub struct PageOwner {
    /// Non-owning: an upgrade failure means the enclave is being destroyed.
    pub enclave: Weak<Enclave>,
    /// Linear address the page is mapped at inside the enclave range.
    pub vaddr: GuestVirtAddr,
}

pub struct Enclave {
    id: usize,
    /// Start of the enclave's linear address range.
    base: GuestVirtAddr,
    /// Size of the range in bytes.
    size: usize,

    /// Serializes block, track, write-back and parent cleanup. Never taken
    /// while holding a list lock.
    lock: SpinMutex<()>,

    /// Tracking cycle state.
    tracking: RwLock<TrackingState>,

    /// Weak records of every address space mapping this enclave. Iteration
    /// is snapshot style: upgrade under the read lock, then work unlocked.
    mappers: RwLock<Vec<Weak<dyn AddressSpace>>>,

    /// Resident child pages.
    resident: SpinMutex<BTreeSet<PageId>>,

    /// The top level control structure page, while resident.
    control_page: SpinMutex<Option<PageId>>,

    backing: BackingStore,
}

impl Enclave {
    pub fn new(
        id: usize,
        base: GuestVirtAddr,
        size: usize,
        seal_key: [u8; SEAL_KEY_LEN],
    ) -> Arc<Self> {
        // One slot per child page plus one for the control structure.
        let backing_capacity = size / PAGE_SIZE + 1;
        Arc::new(Self {
            id,
            base,
            size,
            lock: SpinMutex::new(()),
            tracking: RwLock::new(TrackingState::default()),
            mappers: RwLock::new(Vec::new()),
            resident: SpinMutex::new(BTreeSet::new()),
            control_page: SpinMutex::new(None),
            backing: BackingStore::new(backing_capacity, seal_key),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn base(&self) -> GuestVirtAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn backing(&self) -> &BackingStore {
        &self.backing
    }

    /// Backing key of the control structure page, one past the child range.
    pub fn control_offset(&self) -> usize {
        self.size
    }

    pub fn epoch(&self) -> u64 {
        self.tracking.read().epoch()
    }

    pub fn add_address_space(&self, aspace: &Arc<dyn AddressSpace>) {
        self.mappers.write().push(Arc::downgrade(aspace));
    }

    /// A logical processor entered the enclave.
    pub fn enter(&self, cpuid: usize) {
        self.tracking.write().update(true, cpuid);
    }

    /// A logical processor left the enclave.
    pub fn exit(&self, cpuid: usize) {
        self.tracking.write().update(false, cpuid);
    }

    pub fn active_thread_num(&self) -> u16 {
        self.tracking.read().active_thread_num()
    }

    /// Record a page the enclave subsystem faulted in or added.
    pub fn attach_page(&self, id: PageId) {
        self.resident.lock().insert(id);
    }

    /// Forget a page the enclave subsystem freed itself (teardown path).
    pub fn detach_page(&self, id: PageId) {
        self.resident.lock().remove(&id);
    }

    pub fn resident_pages(&self) -> usize {
        self.resident.lock().len()
    }

    pub fn set_control_page(&self, id: PageId) {
        *self.control_page.lock() = Some(id);
    }

    pub fn control_page(&self) -> Option<PageId> {
        *self.control_page.lock()
    }

    pub(crate) fn take_control_page(&self) -> Option<PageId> {
        self.control_page.lock().take()
    }

    pub(crate) fn lock(&self) -> spin::mutex::SpinMutexGuard<'_, ()> {
        self.lock.lock()
    }

    fn mapper_snapshot(&self) -> Vec<Arc<dyn AddressSpace>> {
        self.mappers
            .read()
            .iter()
            .filter_map(|weak| weak.upgrade())
            .collect()
    }

    /// Aging: the page is young if any mapper saw an access since the last
    /// scan. Every accessed indicator is cleared as a side effect.
    pub(crate) fn test_and_clear_young(&self, vaddr: GuestVirtAddr) -> bool {
        let mut young = false;
        for aspace in self.mapper_snapshot() {
            young |= aspace.test_and_clear_accessed(vaddr);
        }
        young
    }

    /// Disallow new translations to the page in every address space and
    /// invalidate any previously completed tracking cycle. Caller holds the
    /// enclave lock.
    pub(crate) fn block_page(&self, vaddr: GuestVirtAddr) {
        for aspace in self.mapper_snapshot() {
            aspace.block(vaddr);
        }
        self.tracking.write().require_track_for_write_back();
    }

    /// Whether a write-back may proceed without risking a stale translation.
    pub(crate) fn is_write_back_done(&self) -> bool {
        self.tracking.read().is_write_back_done()
    }

    /// Bump the epoch and start a tracking cycle. False if a cycle is
    /// already active, which the pipeline treats as a protocol violation.
    pub(crate) fn track(&self) -> bool {
        self.tracking.write().activate()
    }

    /// CPUs that might be executing inside any address space of this
    /// enclave. Computed strictly after the epoch bump so no straggler is
    /// missed.
    pub(crate) fn mapper_cpus(&self) -> CpuMask {
        let mut mask = CpuMask::new();
        for aspace in self.mapper_snapshot() {
            mask.union_with(&aspace.cpus());
        }
        mask
    }

    /// Account an evicted child page. True if it was the last resident
    /// child, in which case the control structure page follows.
    pub(crate) fn page_evicted(&self, id: PageId) -> bool {
        let mut resident = self.resident.lock();
        resident.remove(&id);
        resident.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use spin::Mutex as TestMutex;
    use std::collections::BTreeSet;

    /// Mapper with explicit accessed and blocked bookkeeping.
    pub(crate) struct MockAddressSpace {
        accessed: TestMutex<BTreeSet<GuestVirtAddr>>,
        blocked: TestMutex<BTreeSet<GuestVirtAddr>>,
        cpus: TestMutex<CpuMask>,
    }

    impl MockAddressSpace {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                accessed: TestMutex::new(BTreeSet::new()),
                blocked: TestMutex::new(BTreeSet::new()),
                cpus: TestMutex::new(CpuMask::new()),
            })
        }

        pub(crate) fn touch(&self, vaddr: GuestVirtAddr) {
            self.accessed.lock().insert(vaddr);
        }

        pub(crate) fn is_blocked(&self, vaddr: GuestVirtAddr) -> bool {
            self.blocked.lock().contains(&vaddr)
        }

        pub(crate) fn run_on_cpu(&self, cpuid: usize) {
            self.cpus.lock().set_cpu(cpuid);
        }
    }

    impl AddressSpace for MockAddressSpace {
        fn test_and_clear_accessed(&self, vaddr: GuestVirtAddr) -> bool {
            self.accessed.lock().remove(&vaddr)
        }

        fn block(&self, vaddr: GuestVirtAddr) {
            self.blocked.lock().insert(vaddr);
        }

        fn cpus(&self) -> CpuMask {
            self.cpus.lock().clone()
        }
    }

    #[test]
    fn aging_clears_accessed_bits() {
        let encl = Enclave::new(1, 0x10000, 4 * PAGE_SIZE, [0; SEAL_KEY_LEN]);
        let aspace = MockAddressSpace::new();
        let dyn_aspace: Arc<dyn AddressSpace> = aspace.clone();
        encl.add_address_space(&dyn_aspace);

        aspace.touch(0x10000);
        assert!(encl.test_and_clear_young(0x10000));
        assert!(!encl.test_and_clear_young(0x10000));
    }

    #[test]
    fn dead_mapper_is_skipped() {
        let encl = Enclave::new(1, 0, 4 * PAGE_SIZE, [0; SEAL_KEY_LEN]);
        {
            let aspace = MockAddressSpace::new();
            let dyn_aspace: Arc<dyn AddressSpace> = aspace.clone();
            encl.add_address_space(&dyn_aspace);
            aspace.touch(0);
        }
        // The address space is gone; aging must not observe its state.
        assert!(!encl.test_and_clear_young(0));
    }

    #[test]
    fn last_child_detection() {
        let encl = Enclave::new(1, 0, 4 * PAGE_SIZE, [0; SEAL_KEY_LEN]);
        let a = PageId::new(0, 0);
        let b = PageId::new(0, 1);
        encl.attach_page(a);
        encl.attach_page(b);
        assert!(!encl.page_evicted(a));
        assert!(encl.page_evicted(b));
    }
}
