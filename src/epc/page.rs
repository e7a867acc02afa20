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

//! Page descriptors and the intrusive page list.
//!
//! Every physical EPC page has exactly one descriptor, addressed by a stable
//! [`PageId`]. A page is linked into at most one list at a time; the link
//! word records which one, and [`PageList::push_tail`] panics if that ever
//! fails to hold.

use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;
use spin::Mutex as SpinMutex;

use crate::enclave::PageOwner;

/// Stable identifier of one EPC page: section number plus page index within
/// the section. Ids never move and are never reused for a different
/// physical page.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PageId {
    pub(crate) section: u16,
    pub(crate) index: u32,
}

impl PageId {
    pub(crate) fn new(section: u16, index: u32) -> Self {
        Self { section, index }
    }
}

bitflags! {
    pub struct PageFlags: u8 {
        /// The page participates in reclaim and is (or was) on the active list.
        const RECLAIMABLE     = 1 << 0;
        /// The page has been dequeued into an in-flight reclaim batch.
        const BEING_RECLAIMED = 1 << 1;
    }
}

/// The list a page is currently linked into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ListId {
    /// A NUMA node's free list.
    NodeFree(u16),
    /// The global active list of reclaimable pages.
    Active,
    /// The startup dirty queue.
    Dirty,
}

#[derive(Debug, Default)]
pub(crate) struct PageLink {
    on: Option<ListId>,
    prev: Option<PageId>,
    next: Option<PageId>,
}

/// Descriptor of one physical EPC page.
pub(crate) struct EpcPage {
    flags: AtomicU8,
    /// Non-owning back reference to the owning enclave; `None` iff free.
    owner: SpinMutex<Option<PageOwner>>,
    /// Guarded by the lock of the list named in `on`.
    link: SpinMutex<PageLink>,
}

impl EpcPage {
    pub(crate) fn new() -> Self {
        Self {
            flags: AtomicU8::new(0),
            owner: SpinMutex::new(None),
            link: SpinMutex::new(PageLink::default()),
        }
    }

    pub(crate) fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn insert_flags(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_flags(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn owner(&self) -> Option<PageOwner> {
        self.owner.lock().clone()
    }

    pub(crate) fn set_owner(&self, owner: Option<PageOwner>) {
        *self.owner.lock() = owner;
    }

    pub(crate) fn on_list(&self) -> Option<ListId> {
        self.link.lock().on
    }
}

/// Resolves a [`PageId`] to its descriptor.
pub(crate) trait PageIndex {
    fn page(&self, id: PageId) -> &EpcPage;
}

/// Doubly linked FIFO threaded through the page descriptors.
///
/// All link words of member pages are guarded by the caller's lock around
/// the list itself; no operation ever holds two link words at once.
pub(crate) struct PageList {
    id: ListId,
    head: Option<PageId>,
    tail: Option<PageId>,
    len: usize,
}

impl PageList {
    pub(crate) const fn new(id: ListId) -> Self {
        Self {
            id,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn push_tail(&mut self, idx: &dyn PageIndex, id: PageId) {
        {
            let mut link = idx.page(id).link.lock();
            assert!(
                link.on.is_none(),
                "page {:?} is already linked into {:?}",
                id,
                link.on
            );
            link.on = Some(self.id);
            link.prev = self.tail;
            link.next = None;
        }
        match self.tail {
            Some(tail) => idx.page(tail).link.lock().next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub(crate) fn pop_head(&mut self, idx: &dyn PageIndex) -> Option<PageId> {
        let id = self.head?;
        {
            let mut link = idx.page(id).link.lock();
            debug_assert_eq!(link.on, Some(self.id));
            self.head = link.next;
            *link = PageLink::default();
        }
        match self.head {
            Some(head) => idx.page(head).link.lock().prev = None,
            None => self.tail = None,
        }
        self.len -= 1;
        Some(id)
    }

    /// Unlink `id` if it is a member of this list. Returns false when the
    /// page is linked elsewhere or not linked at all.
    pub(crate) fn unlink(&mut self, idx: &dyn PageIndex, id: PageId) -> bool {
        let (prev, next) = {
            let mut link = idx.page(id).link.lock();
            if link.on != Some(self.id) {
                return false;
            }
            let neighbors = (link.prev, link.next);
            *link = PageLink::default();
            neighbors
        };
        match prev {
            Some(prev) => idx.page(prev).link.lock().next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => idx.page(next).link.lock().prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Arena(Vec<EpcPage>);

    impl PageIndex for Arena {
        fn page(&self, id: PageId) -> &EpcPage {
            &self.0[id.index as usize]
        }
    }

    fn arena(pages: usize) -> Arena {
        Arena((0..pages).map(|_| EpcPage::new()).collect())
    }

    fn id(index: u32) -> PageId {
        PageId::new(0, index)
    }

    #[test]
    fn fifo_order() {
        let arena = arena(4);
        let mut list = PageList::new(ListId::Active);
        for index in 0..4 {
            list.push_tail(&arena, id(index));
        }
        assert_eq!(list.len(), 4);
        for index in 0..4 {
            assert_eq!(list.pop_head(&arena), Some(id(index)));
        }
        assert!(list.is_empty());
        assert_eq!(list.pop_head(&arena), None);
    }

    #[test]
    fn unlink_middle_and_ends() {
        let arena = arena(3);
        let mut list = PageList::new(ListId::Dirty);
        for index in 0..3 {
            list.push_tail(&arena, id(index));
        }
        assert!(list.unlink(&arena, id(1)));
        assert!(!list.unlink(&arena, id(1)));
        assert!(list.unlink(&arena, id(0)));
        assert!(list.unlink(&arena, id(2)));
        assert!(list.is_empty());
        assert_eq!(arena.page(id(1)).on_list(), None);
    }

    #[test]
    fn unlink_refuses_foreign_member() {
        let arena = arena(1);
        let mut active = PageList::new(ListId::Active);
        let mut dirty = PageList::new(ListId::Dirty);
        active.push_tail(&arena, id(0));
        assert!(!dirty.unlink(&arena, id(0)));
        assert_eq!(active.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn double_link_panics() {
        let arena = arena(1);
        let mut active = PageList::new(ListId::Active);
        let mut free = PageList::new(ListId::NodeFree(0));
        active.push_tail(&arena, id(0));
        free.push_tail(&arena, id(0));
    }
}
