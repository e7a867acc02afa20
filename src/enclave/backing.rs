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

//! Per-enclave backing storage for evicted page content.
//!
//! Slots are keyed by the page's offset inside the enclave range. Each
//! evicted page gets a freshness nonce held in a version slot; the sealed
//! content carries an integrity tag bound to key, nonce, enclave and offset,
//! so a later reload detects both tampering and replay of an older copy.
//!
//! The cipher here is a digest-derived keystream. It keeps the layering
//! honest in hosted builds; deployments substitute the platform cipher.

use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;

use bitmap_allocator::{BitAlloc, BitAlloc4K};
use sha2::{Digest, Sha256};
use spin::Mutex as SpinMutex;

use crate::addr::is_aligned;
use crate::consts::{PAGE_SIZE, SEAL_KEY_LEN, VA_SLOTS_PER_PAGE};
use crate::error::EpcResult;

const TAG_LEN: usize = 32;
const KEYSTREAM_BLOCK: usize = 32;

/// Handle for one reserved backing slot, obtained before the write-back and
/// either consumed by it or released on failure.
#[derive(Debug)]
pub struct BackingSlot {
    offset: usize,
}

impl BackingSlot {
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// One page worth of version slots.
struct VersionPage {
    used: BitAlloc4K,
    values: Box<[u64]>,
}

impl VersionPage {
    fn new() -> Self {
        let mut used = BitAlloc4K::DEFAULT;
        used.insert(0..VA_SLOTS_PER_PAGE);
        Self {
            used,
            values: vec![0u64; VA_SLOTS_PER_PAGE].into_boxed_slice(),
        }
    }
}

struct SealedPage {
    va_page: usize,
    va_slot: usize,
    data: Box<[u8]>,
    tag: [u8; TAG_LEN],
    sealed: bool,
}

pub struct BackingStore {
    capacity: usize,
    seal_key: [u8; SEAL_KEY_LEN],
    nonce: AtomicU64,
    slots: SpinMutex<BTreeMap<usize, SealedPage>>,
    va_pages: SpinMutex<Vec<VersionPage>>,
}

impl BackingStore {
    pub fn new(capacity: usize, seal_key: [u8; SEAL_KEY_LEN]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seal_key);
        let digest = hasher.finalize();
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);

        Self {
            capacity,
            seal_key,
            nonce: AtomicU64::new(u64::from_le_bytes(seed)),
            slots: SpinMutex::new(BTreeMap::new()),
            va_pages: SpinMutex::new(Vec::new()),
        }
    }

    /// Reserve a slot for the page at `offset`. Failure is transient: the
    /// caller returns the page to the active list and retries later.
    pub fn get_backing(&self, offset: usize) -> EpcResult<BackingSlot> {
        if !is_aligned(offset) {
            return epc_result_err!(
                EINVAL,
                format!("BackingStore::get_backing(): offset {:#x} is not aligned", offset)
            );
        }

        let mut slots = self.slots.lock();
        if slots.contains_key(&offset) {
            return Ok(BackingSlot { offset });
        }
        if slots.len() >= self.capacity {
            return epc_result_err!(EBUSY);
        }

        let (va_page, va_slot) = self.alloc_va_slot();
        slots.insert(
            offset,
            SealedPage {
                va_page,
                va_slot,
                data: Box::default(),
                tag: [0; TAG_LEN],
                sealed: false,
            },
        );
        Ok(BackingSlot { offset })
    }

    /// Drop a reservation that was never written.
    pub fn release_backing(&self, slot: BackingSlot) {
        let mut slots = self.slots.lock();
        let reserved = slots.get(&slot.offset).map_or(false, |entry| !entry.sealed);
        if reserved {
            let entry = slots.remove(&slot.offset).unwrap();
            self.free_va_slot(entry.va_page, entry.va_slot);
        }
    }

    /// Seal `contents` into the reserved slot. The page itself is content
    /// free once this returns.
    pub(crate) fn write_back(
        &self,
        slot: &BackingSlot,
        encl_id: usize,
        contents: &[u8],
    ) -> EpcResult {
        if contents.len() != PAGE_SIZE {
            return epc_result_err!(
                EINVAL,
                format!(
                    "BackingStore::write_back(): {} bytes is not one page",
                    contents.len()
                )
            );
        }
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);

        let mut slots = self.slots.lock();
        let entry = match slots.get_mut(&slot.offset) {
            Some(entry) => entry,
            None => {
                return epc_result_err!(
                    EFAULT,
                    format!(
                        "BackingStore::write_back(): no slot reserved for offset {:#x}",
                        slot.offset
                    )
                )
            }
        };

        {
            let mut va_pages = self.va_pages.lock();
            let value = &mut va_pages[entry.va_page].values[entry.va_slot];
            if *value != 0 {
                return epc_result_err!(
                    EINVAL,
                    format!(
                        "BackingStore::write_back(): version slot for offset {:#x} is already in use",
                        slot.offset
                    )
                );
            }
            *value = nonce;
        }

        let (data, tag) = self.seal(nonce, encl_id, slot.offset, contents);
        entry.data = data;
        entry.tag = tag;
        entry.sealed = true;
        Ok(())
    }

    /// Verify and decrypt the copy stored for `offset` into `dst`, releasing
    /// the slot and its version nonce. Used by the fault-in path.
    pub fn load(&self, offset: usize, encl_id: usize, dst: &mut [u8]) -> EpcResult {
        let mut slots = self.slots.lock();
        let entry = match slots.get(&offset) {
            Some(entry) if entry.sealed => entry,
            _ => {
                return epc_result_err!(
                    EINVAL,
                    format!("BackingStore::load(): no sealed copy for offset {:#x}", offset)
                )
            }
        };

        let nonce = self.va_pages.lock()[entry.va_page].values[entry.va_slot];
        let expected = self.tag(nonce, encl_id, offset, &entry.data);
        if expected != entry.tag {
            return epc_result_err!(
                EINVAL,
                format!("BackingStore::load(): integrity check failed for offset {:#x}", offset)
            );
        }

        dst.copy_from_slice(&entry.data);
        self.apply_keystream(nonce, offset, dst);

        let entry = slots.remove(&offset).unwrap();
        self.free_va_slot(entry.va_page, entry.va_slot);
        Ok(())
    }

    /// Number of sealed pages currently held.
    pub fn stored_pages(&self) -> usize {
        self.slots.lock().values().filter(|entry| entry.sealed).count()
    }

    fn alloc_va_slot(&self) -> (usize, usize) {
        let mut va_pages = self.va_pages.lock();
        for (index, page) in va_pages.iter_mut().enumerate() {
            if let Some(slot) = page.used.alloc() {
                return (index, slot);
            }
        }
        let mut page = VersionPage::new();
        let slot = page.used.alloc().unwrap();
        va_pages.push(page);
        (va_pages.len() - 1, slot)
    }

    fn free_va_slot(&self, va_page: usize, va_slot: usize) {
        let mut va_pages = self.va_pages.lock();
        va_pages[va_page].values[va_slot] = 0;
        va_pages[va_page].used.dealloc(va_slot);
    }

    fn seal(
        &self,
        nonce: u64,
        encl_id: usize,
        offset: usize,
        contents: &[u8],
    ) -> (Box<[u8]>, [u8; TAG_LEN]) {
        let mut data = contents.to_vec().into_boxed_slice();
        self.apply_keystream(nonce, offset, &mut data);
        let tag = self.tag(nonce, encl_id, offset, &data);
        (data, tag)
    }

    fn apply_keystream(&self, nonce: u64, offset: usize, buf: &mut [u8]) {
        for (block, chunk) in buf.chunks_mut(KEYSTREAM_BLOCK).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(self.seal_key);
            hasher.update(nonce.to_le_bytes());
            hasher.update(offset.to_le_bytes());
            hasher.update((block as u64).to_le_bytes());
            let keystream = hasher.finalize();
            for (byte, key_byte) in chunk.iter_mut().zip(keystream.iter()) {
                *byte ^= key_byte;
            }
        }
    }

    fn tag(&self, nonce: u64, encl_id: usize, offset: usize, data: &[u8]) -> [u8; TAG_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(self.seal_key);
        hasher.update(nonce.to_le_bytes());
        hasher.update((encl_id as u64).to_le_bytes());
        hasher.update((offset as u64).to_le_bytes());
        hasher.update(data);
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: usize) -> BackingStore {
        BackingStore::new(capacity, [7u8; SEAL_KEY_LEN])
    }

    #[test]
    fn seal_and_load_roundtrip() {
        let store = store(4);
        let contents: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();

        let slot = store.get_backing(0x3000).unwrap();
        store.write_back(&slot, 42, &contents).unwrap();
        assert_eq!(store.stored_pages(), 1);

        let mut reloaded = vec![0u8; PAGE_SIZE];
        store.load(0x3000, 42, &mut reloaded).unwrap();
        assert_eq!(reloaded, contents);
        assert_eq!(store.stored_pages(), 0);
    }

    #[test]
    fn wrong_enclave_fails_integrity() {
        let store = store(4);
        let contents = vec![0xa5u8; PAGE_SIZE];
        let slot = store.get_backing(0).unwrap();
        store.write_back(&slot, 1, &contents).unwrap();

        let mut dst = vec![0u8; PAGE_SIZE];
        let err = store.load(0, 2, &mut dst).unwrap_err();
        assert_eq!(err.num(), crate::error::EpcErrorNum::EINVAL);
    }

    #[test]
    fn capacity_exhaustion_is_transient() {
        let store = store(2);
        let _a = store.get_backing(0x1000).unwrap();
        let b = store.get_backing(0x2000).unwrap();
        let err = store.get_backing(0x3000).unwrap_err();
        assert_eq!(err.num(), crate::error::EpcErrorNum::EBUSY);

        store.release_backing(b);
        store.get_backing(0x3000).unwrap();
    }

    #[test]
    fn version_slot_reused_after_load() {
        let store = store(1);
        let contents = vec![1u8; PAGE_SIZE];
        for round in 0..3 {
            let slot = store.get_backing(0x5000).unwrap();
            store.write_back(&slot, round, &contents).unwrap();
            let mut dst = vec![0u8; PAGE_SIZE];
            store.load(0x5000, round, &mut dst).unwrap();
        }
        assert_eq!(store.va_pages.lock().len(), 1);
    }

    #[test]
    fn unaligned_offset_rejected() {
        let store = store(1);
        assert!(store.get_backing(0x123).is_err());
    }
}
