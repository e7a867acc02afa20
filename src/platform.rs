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

//! Privileged capabilities consumed by the pool.
//!
//! Everything that needs ring-0 or hardware support lives behind
//! [`PlatformOps`]: mapping the protected ranges, the per-page sanitize verb,
//! and the cross-core signal that forces stragglers out of enclave mode.

use crate::addr::{HostVirtAddr, PhysAddr};
use crate::cpumask::CpuMask;
use crate::error::EpcResult;

/// Type of an advertised physical memory region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Protected enclave memory, managed by this crate.
    Secure,
    /// Ordinary memory.
    Normal,
    /// Reserved by firmware, unusable.
    Reserved,
}

/// One EPC region as advertised by the platform.
#[derive(Clone, Copy, Debug)]
pub struct EpcRegion {
    pub base: PhysAddr,
    pub size: usize,
    /// NUMA node the region is attached to.
    pub node: usize,
    pub kind: RegionKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SanitizeError {
    /// The page is a control structure whose children are still present.
    ChildPresent,
    /// Unexpected rejection; the page is abandoned by the caller.
    Rejected,
}

pub trait PlatformOps: Send + Sync {
    /// Map an EPC range into this component's address space.
    fn map_section(&self, base: PhysAddr, size: usize) -> EpcResult<HostVirtAddr>;

    fn unmap_section(&self, virt: HostVirtAddr, size: usize);

    /// Clear a page of unknown provenance so it can enter a free list.
    fn sanitize(&self, paddr: PhysAddr) -> Result<(), SanitizeError>;

    /// Send a no-op signal to `cpus` that forces each of them out of enclave
    /// mode before it returns. The exits drive the owning enclave's tracking
    /// cycle to completion.
    fn broadcast_evict(&self, cpus: &CpuMask);

    fn current_cpu(&self) -> usize;

    fn node_of_cpu(&self, cpu: usize) -> usize;

    fn current_node(&self) -> usize {
        self.node_of_cpu(self.current_cpu())
    }

    /// Whether the calling context has an interruption pending. A blocking
    /// allocation polls this to abort its wait.
    fn signal_pending(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::consts::PAGE_SIZE;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use spin::Mutex as SpinMutex;
    use std::collections::{BTreeMap, BTreeSet};

    type EvictHook = Box<dyn Fn(&CpuMask) + Send + Sync>;

    pub(crate) struct MockPlatform {
        maps: SpinMutex<Vec<(HostVirtAddr, usize)>>,
        /// parent paddr -> child paddrs; a parent fails to sanitize while any
        /// child has not been sanitized yet.
        children: SpinMutex<BTreeMap<PhysAddr, Vec<PhysAddr>>>,
        sanitized: SpinMutex<BTreeSet<PhysAddr>>,
        rejected: SpinMutex<BTreeSet<PhysAddr>>,
        signal: AtomicBool,
        cpu: AtomicUsize,
        node_count: usize,
        broadcasts: AtomicUsize,
        evict_hook: SpinMutex<Option<EvictHook>>,
    }

    impl MockPlatform {
        pub(crate) fn new(node_count: usize) -> Self {
            Self {
                maps: SpinMutex::new(Vec::new()),
                children: SpinMutex::new(BTreeMap::new()),
                sanitized: SpinMutex::new(BTreeSet::new()),
                rejected: SpinMutex::new(BTreeSet::new()),
                signal: AtomicBool::new(false),
                cpu: AtomicUsize::new(0),
                node_count,
                broadcasts: AtomicUsize::new(0),
                evict_hook: SpinMutex::new(None),
            }
        }

        pub(crate) fn set_current_cpu(&self, cpu: usize) {
            self.cpu.store(cpu, Ordering::Release);
        }

        pub(crate) fn set_signal_pending(&self, pending: bool) {
            self.signal.store(pending, Ordering::Release);
        }

        pub(crate) fn add_child(&self, parent: PhysAddr, child: PhysAddr) {
            self.children.lock().entry(parent).or_default().push(child);
        }

        pub(crate) fn reject_sanitize(&self, paddr: PhysAddr) {
            self.rejected.lock().insert(paddr);
        }

        pub(crate) fn sanitized_count(&self) -> usize {
            self.sanitized.lock().len()
        }

        pub(crate) fn broadcast_count(&self) -> usize {
            self.broadcasts.load(Ordering::Acquire)
        }

        pub(crate) fn set_evict_hook(&self, hook: EvictHook) {
            *self.evict_hook.lock() = Some(hook);
        }
    }

    impl PlatformOps for MockPlatform {
        fn map_section(&self, _base: PhysAddr, size: usize) -> EpcResult<HostVirtAddr> {
            let mapping = vec![0u8; size].into_boxed_slice();
            let virt = Box::into_raw(mapping) as *mut u8 as usize;
            self.maps.lock().push((virt, size));
            Ok(virt)
        }

        fn unmap_section(&self, virt: HostVirtAddr, size: usize) {
            let mut maps = self.maps.lock();
            if let Some(pos) = maps.iter().position(|m| *m == (virt, size)) {
                maps.remove(pos);
                let slice = core::ptr::slice_from_raw_parts_mut(virt as *mut u8, size);
                drop(unsafe { Box::from_raw(slice) });
            }
        }

        fn sanitize(&self, paddr: PhysAddr) -> Result<(), SanitizeError> {
            if self.rejected.lock().contains(&paddr) {
                return Err(SanitizeError::Rejected);
            }
            if let Some(kids) = self.children.lock().get(&paddr) {
                let sanitized = self.sanitized.lock();
                if kids.iter().any(|kid| !sanitized.contains(kid)) {
                    return Err(SanitizeError::ChildPresent);
                }
            }
            self.sanitized.lock().insert(paddr);
            Ok(())
        }

        fn broadcast_evict(&self, cpus: &CpuMask) {
            self.broadcasts.fetch_add(1, Ordering::Release);
            if let Some(ref hook) = *self.evict_hook.lock() {
                hook(cpus);
            }
        }

        fn current_cpu(&self) -> usize {
            self.cpu.load(Ordering::Acquire)
        }

        fn node_of_cpu(&self, cpu: usize) -> usize {
            cpu % self.node_count
        }

        fn signal_pending(&self) -> bool {
            self.signal.load(Ordering::Acquire)
        }
    }

    pub(crate) fn regions_on_nodes(pages_per_node: &[usize]) -> Vec<EpcRegion> {
        pages_per_node
            .iter()
            .enumerate()
            .filter(|(_, pages)| **pages > 0)
            .map(|(node, pages)| EpcRegion {
                base: 0x1000_0000 * (node + 1),
                size: pages * PAGE_SIZE,
                node,
                kind: RegionKind::Secure,
            })
            .collect()
    }
}
