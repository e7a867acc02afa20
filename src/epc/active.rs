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

//! The global active list: reclaimable pages in approximate LRU order.
//!
//! Strict FIFO with tail re-insertion of recently touched pages gives the
//! clock/second-chance behavior the eviction pipeline relies on.

use spin::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard};

use crate::error::EpcResult;

use super::page::{ListId, PageFlags, PageId, PageIndex, PageList};

pub(crate) struct ActiveList {
    inner: SpinMutex<PageList>,
}

impl ActiveList {
    pub(crate) fn new() -> Self {
        Self {
            inner: SpinMutex::new(PageList::new(ListId::Active)),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Selection in the eviction pipeline locks the list once for a whole
    /// batch.
    pub(crate) fn lock(&self) -> SpinMutexGuard<'_, PageList> {
        self.inner.lock()
    }

    /// Flag `id` reclaimable and append it to the tail. A page that is
    /// already flagged is left where it is, so concurrent calls link the
    /// page exactly once.
    pub(crate) fn mark(&self, idx: &dyn PageIndex, id: PageId) {
        let mut list = self.inner.lock();
        let page = idx.page(id);
        if page.flags().contains(PageFlags::RECLAIMABLE) {
            return;
        }
        page.insert_flags(PageFlags::RECLAIMABLE);
        list.push_tail(idx, id);
    }

    /// Take `id` back out of reclaim. `EBUSY` means the reclaimer has
    /// already dequeued the page for processing; the caller must wait for
    /// the in-flight batch or accept that eviction proceeds.
    pub(crate) fn unmark(&self, idx: &dyn PageIndex, id: PageId) -> EpcResult {
        let mut list = self.inner.lock();
        let page = idx.page(id);
        if !page.flags().contains(PageFlags::RECLAIMABLE) {
            return Ok(());
        }
        if list.unlink(idx, id) {
            page.remove_flags(PageFlags::RECLAIMABLE);
            Ok(())
        } else {
            epc_result_err!(EBUSY)
        }
    }

    /// Give a page that survived selection another round: back to the tail,
    /// no longer in flight, still reclaimable.
    pub(crate) fn requeue(&self, idx: &dyn PageIndex, id: PageId) {
        let mut list = self.inner.lock();
        idx.page(id).remove_flags(PageFlags::BEING_RECLAIMED);
        list.push_tail(idx, id);
    }
}
