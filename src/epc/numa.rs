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

use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex as SpinMutex;

use super::page::{ListId, PageId, PageIndex, PageList};

/// Free pages of one NUMA node. Mutated only under its own lock; no ordering
/// is guaranteed across nodes.
pub(crate) struct NumaNode {
    free: SpinMutex<PageList>,
    free_cnt: AtomicUsize,
    /// Whether any EPC section is attached to this node. Nodes without
    /// sections are skipped by the allocation probe.
    present: bool,
}

impl NumaNode {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            free: SpinMutex::new(PageList::new(ListId::NodeFree(id as u16))),
            free_cnt: AtomicUsize::new(0),
            present: false,
        }
    }

    pub(crate) fn mark_present(&mut self) {
        self.present = true;
    }

    pub(crate) fn is_present(&self) -> bool {
        self.present
    }

    pub(crate) fn push_free(&self, idx: &dyn PageIndex, id: PageId) {
        self.free.lock().push_tail(idx, id);
        self.free_cnt.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn pop_free(&self, idx: &dyn PageIndex) -> Option<PageId> {
        let id = self.free.lock().pop_head(idx)?;
        self.free_cnt.fetch_sub(1, Ordering::Release);
        Some(id)
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free_cnt.load(Ordering::Acquire)
    }
}
