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

use static_assertions::{const_assert, const_assert_eq};

pub const PAGE_SIZE: usize = 0x1000;

/// Pages reclaimed in one pass of the eviction pipeline. The batch amortizes
/// the epoch bump and the cross-core signal over its members.
pub const NR_TO_SCAN: usize = 16;

/// Below this many free pages a blocking allocation wakes the reclaimer.
pub const NR_LOW_PAGES: usize = 32;

/// The reclaimer keeps reclaiming in the background until at least this many
/// pages are free.
pub const NR_HIGH_PAGES: usize = 64;

/// Startup sanitization passes. Child pages always precede their parent by
/// exactly one hierarchy level, so one retry pass suffices.
pub const SANITIZE_PASSES: usize = 2;

pub const MAX_EPC_SECTIONS: usize = 8;
pub const MAX_NUMA_NODES: usize = 64;

/// Version (nonce) slots held by one version page.
pub const VA_SLOTS_PER_PAGE: usize = 512;

pub const SEAL_KEY_LEN: usize = 16;

const_assert!(NR_LOW_PAGES <= NR_HIGH_PAGES);
const_assert!(MAX_EPC_SECTIONS <= u16::MAX as usize);
const_assert!(MAX_NUMA_NODES <= u16::MAX as usize);
const_assert_eq!(VA_SLOTS_PER_PAGE * core::mem::size_of::<u64>(), PAGE_SIZE);
