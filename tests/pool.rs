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

//! End-to-end flow over the public surface: init, startup sanitization,
//! exhaustion, reclaim under pressure, shutdown.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use epc_pool::{
    AddressSpace, CpuMask, Enclave, EpcPool, EpcRegion, GuestVirtAddr, HostVirtAddr, PageOwner,
    PhysAddr, PlatformOps, PoolConfig, RegionKind, SanitizeError, EpcResult, PAGE_SIZE,
    SEAL_KEY_LEN,
};

struct HostPlatform {
    maps: Mutex<Vec<(HostVirtAddr, usize)>>,
}

impl HostPlatform {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            maps: Mutex::new(Vec::new()),
        })
    }
}

impl PlatformOps for HostPlatform {
    fn map_section(&self, _base: PhysAddr, size: usize) -> EpcResult<HostVirtAddr> {
        let mapping = vec![0u8; size].into_boxed_slice();
        let virt = Box::into_raw(mapping) as *mut u8 as usize;
        self.maps.lock().unwrap().push((virt, size));
        Ok(virt)
    }

    fn unmap_section(&self, virt: HostVirtAddr, size: usize) {
        let mut maps = self.maps.lock().unwrap();
        if let Some(pos) = maps.iter().position(|m| *m == (virt, size)) {
            maps.remove(pos);
            let slice = core::ptr::slice_from_raw_parts_mut(virt as *mut u8, size);
            drop(unsafe { Box::from_raw(slice) });
        }
    }

    fn sanitize(&self, _paddr: PhysAddr) -> Result<(), SanitizeError> {
        Ok(())
    }

    fn broadcast_evict(&self, _cpus: &CpuMask) {}

    fn current_cpu(&self) -> usize {
        0
    }

    fn node_of_cpu(&self, _cpu: usize) -> usize {
        0
    }

    fn signal_pending(&self) -> bool {
        false
    }
}

struct HostAddressSpace {
    accessed: Mutex<BTreeSet<GuestVirtAddr>>,
}

impl HostAddressSpace {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            accessed: Mutex::new(BTreeSet::new()),
        })
    }
}

impl AddressSpace for HostAddressSpace {
    fn test_and_clear_accessed(&self, vaddr: GuestVirtAddr) -> bool {
        self.accessed.lock().unwrap().remove(&vaddr)
    }

    fn block(&self, _vaddr: GuestVirtAddr) {}

    fn cpus(&self) -> CpuMask {
        CpuMask::new()
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn full_lifecycle_under_pressure() {
    const PAGES: usize = 16;

    let platform = HostPlatform::new();
    let regions = [EpcRegion {
        base: 0x4000_0000,
        size: PAGES * PAGE_SIZE,
        node: 0,
        kind: RegionKind::Secure,
    }];
    let config = PoolConfig {
        nr_low_pages: 2,
        nr_high_pages: 4,
    };
    let pool = EpcPool::init_with_config(&regions, platform.clone(), config).unwrap();

    // The reclaimer sanitizes every page before first use.
    wait_for("startup sanitization", || pool.free_page_count() == PAGES);
    assert!(!pool.sanitize_failed());

    let encl = Enclave::new(1, 0x7000_0000, PAGES * PAGE_SIZE, [3u8; SEAL_KEY_LEN]);
    let aspace = HostAddressSpace::new();
    let dyn_aspace: Arc<dyn AddressSpace> = aspace.clone();
    encl.add_address_space(&dyn_aspace);

    // Exhaust the pool.
    let mut pages = Vec::new();
    for n in 0..PAGES {
        let owner = PageOwner {
            enclave: Arc::downgrade(&encl),
            vaddr: encl.base() + n * PAGE_SIZE,
        };
        let id = pool.allocate(owner, false).unwrap();
        encl.attach_page(id);
        pages.push(id);
    }
    assert_eq!(pool.free_page_count(), 0);

    // Six pages become reclaimable, five of them recently touched: the
    // synchronous pass under pressure can only evict the one old page.
    for id in &pages[..6] {
        pool.mark_reclaimable(*id);
    }
    for n in 1..6 {
        aspace
            .accessed
            .lock()
            .unwrap()
            .insert(encl.base() + n * PAGE_SIZE);
    }

    let other = Enclave::new(2, 0x9000_0000, 4 * PAGE_SIZE, [4u8; SEAL_KEY_LEN]);
    let owner = PageOwner {
        enclave: Arc::downgrade(&other),
        vaddr: other.base(),
    };
    let id = pool.allocate(owner, true).unwrap();
    other.attach_page(id);

    // That allocation left the pool below the low watermark with the five
    // second-chance pages still queued; its wakeup lets the background task
    // reclaim up to the high watermark.
    wait_for("background reclaim", || {
        pool.free_page_count() >= config.nr_high_pages
    });
    assert!(encl.backing().stored_pages() > 0);

    pool.shutdown();
    let free_after_stop = pool.free_page_count();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(pool.free_page_count(), free_after_stop);

    // Shutdown is idempotent.
    pool.shutdown();
}

#[test]
fn init_without_sections_fails() {
    let platform = HostPlatform::new();
    assert!(EpcPool::init(&[], platform).is_err());
}

#[test]
fn reject_non_secure_region() {
    let platform = HostPlatform::new();
    let regions = [EpcRegion {
        base: 0x4000_0000,
        size: 4 * PAGE_SIZE,
        node: 0,
        kind: RegionKind::Normal,
    }];
    assert!(EpcPool::init(&regions, platform).is_err());
}
