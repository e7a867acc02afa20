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

use crate::consts::PAGE_SIZE;

/// Physical address of an EPC page.
pub type PhysAddr = usize;
/// Address of an EPC page in this component's own mapping of a section.
pub type HostVirtAddr = usize;
/// Linear address of a page inside an enclave's address range.
pub type GuestVirtAddr = usize;

pub const fn is_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}
