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

//! The enclave page cache pool.
//!
//! [`EpcPool`] is the one explicit state object for the whole allocator:
//! the mapped sections, the per-node free lists, the global active list and
//! the background reclaimer. It is constructed once at startup and shared
//! by reference; nothing here lives in ambient globals.

mod active;
mod numa;
mod page;
pub(crate) mod reclaim;
mod reclaimer;
mod section;

pub use page::PageId;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use spin::Mutex as SpinMutex;

use crate::addr::{HostVirtAddr, PhysAddr};
use crate::consts::{NR_HIGH_PAGES, NR_LOW_PAGES, PAGE_SIZE};
use crate::enclave::PageOwner;
use crate::error::EpcResult;
use crate::platform::{EpcRegion, PlatformOps};

use active::ActiveList;
use numa::NumaNode;
use page::{EpcPage, ListId, PageIndex, PageList};
use reclaimer::WaitQueue;
use section::EpcSection;

/// Watermark configuration of one pool.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Below this many free pages a successful blocking allocation wakes the
    /// background reclaimer.
    pub nr_low_pages: usize,
    /// The background reclaimer keeps running while fewer pages than this
    /// are free and the active list is non-empty.
    pub nr_high_pages: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            nr_low_pages: NR_LOW_PAGES,
            nr_high_pages: NR_HIGH_PAGES,
        }
    }
}

pub struct EpcPool {
    platform: Arc<dyn PlatformOps>,
    config: PoolConfig,
    /// Read-only after discovery.
    sections: Vec<EpcSection>,
    /// Indexed by node id; nodes without sections stay unmarked and are
    /// skipped by the allocation probe.
    nodes: Vec<NumaNode>,
    active: ActiveList,
    /// Pages awaiting startup sanitization.
    dirty: SpinMutex<PageList>,
    free_cnt: AtomicUsize,
    sanitize_failed: AtomicBool,
    waitq: WaitQueue,
    reclaimer: SpinMutex<Option<JoinHandle<()>>>,
}

impl PageIndex for EpcPool {
    fn page(&self, id: PageId) -> &EpcPage {
        self.sections[id.section as usize].page(id.index)
    }
}

impl core::fmt::Debug for EpcPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EpcPool")
            .field("config", &self.config)
            .field("nr_sections", &self.sections.len())
            .field("nr_nodes", &self.nodes.len())
            .field("free_cnt", &self.free_cnt)
            .field("sanitize_failed", &self.sanitize_failed)
            .finish_non_exhaustive()
    }
}

impl EpcPool {
    /// Discover all advertised EPC regions and start the background
    /// reclaimer. Fails if no usable section exists or the task cannot
    /// start.
    pub fn init(regions: &[EpcRegion], platform: Arc<dyn PlatformOps>) -> EpcResult<Arc<Self>> {
        Self::init_with_config(regions, platform, PoolConfig::default())
    }

    pub fn init_with_config(
        regions: &[EpcRegion],
        platform: Arc<dyn PlatformOps>,
        config: PoolConfig,
    ) -> EpcResult<Arc<Self>> {
        let pool = Arc::new(Self::discover(regions, platform, config)?);
        let handle = reclaimer::spawn(&pool)?;
        *pool.reclaimer.lock() = Some(handle);
        Ok(pool)
    }

    fn discover(
        regions: &[EpcRegion],
        platform: Arc<dyn PlatformOps>,
        config: PoolConfig,
    ) -> EpcResult<Self> {
        let sections = section::discover_sections(regions, &platform)?;
        if sections.is_empty() {
            return epc_result_err!(ENODEV, "no usable EPC sections");
        }

        let max_node = sections.iter().map(|s| s.node() as usize).max().unwrap_or(0);
        let mut nodes: Vec<NumaNode> = (0..=max_node).map(NumaNode::new).collect();
        for section in &sections {
            nodes[section.node() as usize].mark_present();
        }

        let pool = Self {
            platform,
            config,
            sections,
            nodes,
            active: ActiveList::new(),
            dirty: SpinMutex::new(PageList::new(ListId::Dirty)),
            free_cnt: AtomicUsize::new(0),
            sanitize_failed: AtomicBool::new(false),
            waitq: WaitQueue::new(),
            reclaimer: SpinMutex::new(None),
        };

        // Every page starts dirty; the reclaimer sanitizes them before
        // first use.
        let mut total = 0;
        {
            let mut dirty = pool.dirty.lock();
            for (sid, section) in pool.sections.iter().enumerate() {
                for index in 0..section.page_count() as u32 {
                    dirty.push_tail(&pool, PageId::new(sid as u16, index));
                }
                total += section.page_count();
            }
        }

        info!(
            "EPC pool: {} pages in {} sections across {} nodes",
            total,
            pool.sections.len(),
            pool.nodes.iter().filter(|n| n.is_present()).count()
        );
        Ok(pool)
    }

    /// Stop the background reclaimer and wait for it to park. Any in-flight
    /// batch finishes first.
    pub fn shutdown(&self) {
        self.waitq.request_stop();
        if let Some(handle) = self.reclaimer.lock().take() {
            let _ = handle.join();
        }
    }

    /// Allocate one page for `owner`.
    ///
    /// With `reclaim_allowed` the call blocks, running the eviction
    /// pipeline synchronously until a page frees up, the active list runs
    /// dry (`ENOMEM`), or an interruption is pending (`EINTR`). Without it
    /// the call returns `EBUSY` as soon as reclaim would be needed.
    pub fn allocate(&self, owner: PageOwner, reclaim_allowed: bool) -> EpcResult<PageId> {
        loop {
            if let Some(id) = self.alloc_local_or_any() {
                self.page(id).set_owner(Some(owner.clone()));
                if self.should_reclaim(self.config.nr_low_pages) {
                    self.waitq.wake();
                }
                return Ok(id);
            }
            if self.active.is_empty() {
                return epc_result_err!(ENOMEM);
            }
            if !reclaim_allowed {
                return epc_result_err!(EBUSY);
            }
            if self.platform.signal_pending() {
                return epc_result_err!(EINTR);
            }
            reclaim::reclaim_pages(self);
            thread::yield_now();
        }
    }

    /// Pop a page from the calling CPU's node, falling back to the other
    /// nodes that own EPC sections in cyclic order.
    fn alloc_local_or_any(&self) -> Option<PageId> {
        let nr_nodes = self.nodes.len();
        let start = self.platform.current_node() % nr_nodes;
        for probe in 0..nr_nodes {
            let node = &self.nodes[(start + probe) % nr_nodes];
            if !node.is_present() {
                continue;
            }
            if let Some(id) = node.pop_free(self) {
                self.free_cnt.fetch_sub(1, Ordering::Release);
                return Some(id);
            }
        }
        None
    }

    /// Return a page to its own node's free list. The caller guarantees the
    /// content has already been sanitized.
    pub fn free(&self, id: PageId) {
        let page = self.page(id);
        debug_assert!(page.flags().is_empty());
        debug_assert!(page.on_list().is_none());
        page.set_owner(None);
        let node = self.sections[id.section as usize].node() as usize;
        self.nodes[node].push_free(self, id);
        self.free_cnt.fetch_add(1, Ordering::Release);
    }

    /// Hand a resident page over to the reclaimer's aging.
    pub fn mark_reclaimable(&self, id: PageId) {
        self.active.mark(self, id);
    }

    /// Take a page back out of reclaim. `EBUSY` means an in-flight batch
    /// already owns it; the caller must wait for the batch or accept that
    /// eviction proceeds.
    pub fn unmark_reclaimable(&self, id: PageId) -> EpcResult {
        self.active.unmark(self, id)
    }

    pub fn free_page_count(&self) -> usize {
        self.free_cnt.load(Ordering::Acquire)
    }

    pub fn node_free_count(&self, node: usize) -> usize {
        self.nodes.get(node).map_or(0, |n| n.free_count())
    }

    /// Whether startup sanitization left pages it could not clear. A true
    /// value is a fatal platform configuration problem.
    pub fn sanitize_failed(&self) -> bool {
        self.sanitize_failed.load(Ordering::Acquire)
    }

    /// Interrupt-context entry point for hardware fault containment data.
    /// The payload is opaque to the pool; it only answers whether the
    /// address is EPC at all.
    pub fn report_memory_failure(&self, paddr: PhysAddr) -> bool {
        let is_epc = self.sections.iter().any(|s| s.contains(paddr));
        if is_epc {
            error!(
                "report_memory_failure(): hardware fault in EPC page {:#x}",
                paddr
            );
        }
        is_epc
    }

    pub fn page_paddr(&self, id: PageId) -> PhysAddr {
        self.sections[id.section as usize].paddr_of(id.index)
    }

    fn page_virt(&self, id: PageId) -> HostVirtAddr {
        self.sections[id.section as usize].virt_of(id.index)
    }

    pub(crate) fn page_slice(&self, id: PageId) -> &[u8] {
        let virt = self.page_virt(id);
        // SAFETY: the section mapping lives as long as the pool, and during
        // write-back the page is held exclusively by the pipeline.
        unsafe { core::slice::from_raw_parts(virt as *const u8, PAGE_SIZE) }
    }

    pub(crate) fn zero_page(&self, id: PageId) {
        let virt = self.page_virt(id);
        // SAFETY: see page_slice().
        unsafe { core::ptr::write_bytes(virt as *mut u8, 0, PAGE_SIZE) };
    }

    pub(crate) fn platform(&self) -> &Arc<dyn PlatformOps> {
        &self.platform
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn waitq(&self) -> &WaitQueue {
        &self.waitq
    }

    /// The watermark predicate: pages are scarce and there is something to
    /// reclaim.
    pub(crate) fn should_reclaim(&self, watermark: usize) -> bool {
        self.free_page_count() < watermark && !self.active.is_empty()
    }

    pub(crate) fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }

    pub(crate) fn pop_dirty(&self) -> Option<PageId> {
        self.dirty.lock().pop_head(self)
    }

    pub(crate) fn push_dirty(&self, id: PageId) {
        self.dirty.lock().push_tail(self, id)
    }

    pub(crate) fn set_sanitize_failed(&self) {
        self.sanitize_failed.store(true, Ordering::Release);
    }
}
