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

//! Resource manager for the enclave page cache (EPC).
//!
//! The EPC is a fixed pool of specially protected physical pages shared by
//! every enclave on the system. This crate hands those pages out with NUMA
//! affinity, ages them on a global active list, and evicts them through the
//! hardware-enforced block/track/write-back protocol when the pool runs
//! low. A dedicated background task sanitizes the pool at startup and keeps
//! reclaiming while free pages sit below the high watermark.

#[macro_use]
extern crate log;

#[macro_use]
pub mod error;

mod addr;
mod consts;
mod cpumask;
mod enclave;
mod epc;
mod platform;

pub use addr::{GuestVirtAddr, HostVirtAddr, PhysAddr};
pub use consts::{NR_HIGH_PAGES, NR_LOW_PAGES, NR_TO_SCAN, PAGE_SIZE, SEAL_KEY_LEN};
pub use cpumask::CpuMask;
pub use enclave::backing::{BackingSlot, BackingStore};
pub use enclave::{AddressSpace, Enclave, PageOwner};
pub use epc::{EpcPool, PageId, PoolConfig};
pub use error::{EpcError, EpcErrorNum, EpcResult};
pub use platform::{EpcRegion, PlatformOps, RegionKind, SanitizeError};
