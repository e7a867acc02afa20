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

//! The eviction pipeline: block, track, write back.
//!
//! Pages are processed in batches of up to [`NR_TO_SCAN`] so one epoch bump
//! and one cross-core signal cover every page of the same enclave in the
//! batch. Per-page failures are logged and the page abandoned; the pipeline
//! never retries a rejection indefinitely.

use std::sync::Arc;

use crate::addr::GuestVirtAddr;
use crate::consts::{NR_TO_SCAN, SANITIZE_PASSES};
use crate::enclave::backing::BackingSlot;
use crate::enclave::Enclave;
use crate::error::EpcResult;
use crate::platform::SanitizeError;

use super::page::{PageFlags, PageId, PageIndex};
use super::EpcPool;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PageAge {
    /// Accessed since the last scan; gets a second chance.
    Young,
    /// Eligible for eviction.
    Old,
}

struct BatchEntry {
    id: PageId,
    /// Pin taken at selection; released when the entry drops, whatever the
    /// outcome.
    encl: Arc<Enclave>,
    vaddr: GuestVirtAddr,
}

/// Run one batch of the pipeline. Returns the number of pages freed.
pub(crate) fn reclaim_pages(pool: &EpcPool) -> usize {
    let batch = select_batch(pool);
    if batch.is_empty() {
        return 0;
    }

    // Aging filter: Young pages go back to the tail (second chance).
    let mut survivors = Vec::with_capacity(batch.len());
    for entry in batch {
        match age(&entry) {
            PageAge::Young => pool.active.requeue(pool, entry.id),
            PageAge::Old => survivors.push(entry),
        }
    }

    // Backing acquisition. Failure here is transient, not fatal.
    let mut ready = Vec::with_capacity(survivors.len());
    for entry in survivors {
        let offset = entry.vaddr - entry.encl.base();
        match entry.encl.backing().get_backing(offset) {
            Ok(slot) => ready.push((entry, slot)),
            Err(e) => {
                debug!(
                    "reclaim_pages(): no backing for page {:?} (offset {:#x}): {:?}",
                    entry.id, offset, e
                );
                pool.active.requeue(pool, entry.id);
            }
        }
    }

    // Block all batch members first: the last call leaves the tracking
    // cycle invalidated once, and the first write-back restarts it for the
    // whole batch.
    for (entry, _) in &ready {
        let _lock = entry.encl.lock();
        entry.encl.block_page(entry.vaddr);
    }

    let mut freed = 0;
    for (entry, slot) in ready {
        match write_back_page(pool, &entry, &slot) {
            Ok(()) => {
                pool.page(entry.id)
                    .remove_flags(PageFlags::RECLAIMABLE | PageFlags::BEING_RECLAIMED);
                pool.free(entry.id);
                freed += 1;
            }
            Err(e) => {
                // Broken protocol contract: abandon the page rather than
                // retry forever. It stays owned and off every list.
                error!(
                    "reclaim_pages(): write back of page {:?} failed: {:?}",
                    entry.id, e
                );
                entry.encl.backing().release_backing(slot);
                pool.page(entry.id)
                    .remove_flags(PageFlags::RECLAIMABLE | PageFlags::BEING_RECLAIMED);
            }
        }
    }
    freed
}

/// Pop up to one batch from the head of the active list, pinning each
/// page's enclave. Pages whose enclave is already being destroyed are
/// dropped from reclaim entirely; destruction owns them now.
fn select_batch(pool: &EpcPool) -> Vec<BatchEntry> {
    let mut batch = Vec::with_capacity(NR_TO_SCAN);
    let mut active = pool.active.lock();
    while batch.len() < NR_TO_SCAN {
        let id = match active.pop_head(pool) {
            Some(id) => id,
            None => break,
        };
        let page = pool.page(id);
        let pinned = page
            .owner()
            .and_then(|owner| owner.enclave.upgrade().map(|encl| (encl, owner.vaddr)));
        match pinned {
            Some((encl, vaddr)) => {
                page.insert_flags(PageFlags::BEING_RECLAIMED);
                batch.push(BatchEntry { id, encl, vaddr });
            }
            None => {
                page.remove_flags(PageFlags::RECLAIMABLE | PageFlags::BEING_RECLAIMED);
            }
        }
    }
    batch
}

fn age(entry: &BatchEntry) -> PageAge {
    if entry.encl.test_and_clear_young(entry.vaddr) {
        PageAge::Young
    } else {
        PageAge::Old
    }
}

/// Write one page out through the three-tier protocol, then run parent
/// cleanup. The enclave lock is held across all tiers.
fn write_back_page(pool: &EpcPool, entry: &BatchEntry, slot: &BackingSlot) -> EpcResult {
    let encl = &entry.encl;
    let _lock = encl.lock();

    // Optimistic attempt: a cycle completed by an earlier batch member (or
    // an idle enclave) lets the write-back go through directly.
    if !encl.is_write_back_done() {
        // Bump the epoch so every processor entering from now on observes
        // it; processors already inside must exit once.
        if !encl.track() {
            return epc_result_err!(
                EIO,
                format!(
                    "write_back_page(): tracking cycle of enclave {:#x} already active",
                    encl.id()
                )
            );
        }
        if !encl.is_write_back_done() {
            // Stragglers entered before the epoch bump. Force them out with
            // a no-op signal; the mask is computed only after the bump so
            // none is missed.
            let mask = encl.mapper_cpus();
            pool.platform().broadcast_evict(&mask);
            if !encl.is_write_back_done() {
                return epc_result_err!(
                    EIO,
                    format!(
                        "write_back_page(): page {:?} of enclave {:#x} still tracked after forced exit",
                        entry.id,
                        encl.id()
                    )
                );
            }
        }
    }

    encl.backing()
        .write_back(slot, encl.id(), pool.page_slice(entry.id))?;
    pool.zero_page(entry.id);

    if encl.page_evicted(entry.id) {
        write_back_control_page(pool, encl);
    }
    Ok(())
}

/// Evict the enclave's control structure page after its last child left.
/// Failures are logged and leave the control page resident; the next
/// eviction of a re-added child retries. Caller holds the enclave lock.
fn write_back_control_page(pool: &EpcPool, encl: &Arc<Enclave>) {
    let id = match encl.take_control_page() {
        Some(id) => id,
        None => return,
    };

    let slot = match encl.backing().get_backing(encl.control_offset()) {
        Ok(slot) => slot,
        Err(e) => {
            warn!(
                "write_back_control_page(): no backing for control page of enclave {:#x}: {:?}",
                encl.id(),
                e
            );
            encl.set_control_page(id);
            return;
        }
    };

    // The last child's write-back just completed its tracking cycle, and
    // the control page has no translations of its own.
    match encl.backing().write_back(&slot, encl.id(), pool.page_slice(id)) {
        Ok(()) => {
            pool.zero_page(id);
            pool.free(id);
            debug!(
                "write_back_control_page(): enclave {:#x} has no resident pages left",
                encl.id()
            );
        }
        Err(e) => {
            error!(
                "write_back_control_page(): enclave {:#x}: {:?}",
                encl.id(),
                e
            );
            encl.backing().release_backing(slot);
            encl.set_control_page(id);
        }
    }
}

/// Drain the startup dirty queue. Pages whose control structure still has
/// live children fail their first pass and are re-queued; children always
/// precede parents by one hierarchy level, so the second pass must leave
/// the queue empty. Anything left afterwards is a startup integrity
/// failure.
pub(crate) fn sanitize_dirty_pages(pool: &EpcPool) {
    for pass in 0..SANITIZE_PASSES {
        let pending = pool.dirty_len();
        if pending == 0 {
            break;
        }
        debug!("sanitize_dirty_pages(): pass {}, {} pages", pass, pending);
        for _ in 0..pending {
            let id = match pool.pop_dirty() {
                Some(id) => id,
                None => break,
            };
            match pool.platform().sanitize(pool.page_paddr(id)) {
                Ok(()) => pool.free(id),
                Err(SanitizeError::ChildPresent) => pool.push_dirty(id),
                Err(e) => {
                    error!(
                        "sanitize_dirty_pages(): page {:#x} rejected: {:?}, abandoning it",
                        pool.page_paddr(id),
                        e
                    );
                }
            }
        }
    }

    let left = pool.dirty_len();
    if left != 0 {
        error!(
            "sanitize_dirty_pages(): {} pages failed to sanitize after {} passes",
            left, SANITIZE_PASSES
        );
        pool.set_sanitize_failed();
    }
}
