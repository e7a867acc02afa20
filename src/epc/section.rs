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

//! EPC section discovery.

use std::sync::Arc;

use crate::addr::{is_aligned, HostVirtAddr, PhysAddr};
use crate::consts::{MAX_EPC_SECTIONS, MAX_NUMA_NODES, PAGE_SIZE};
use crate::error::EpcResult;
use crate::platform::{EpcRegion, PlatformOps, RegionKind};

use super::page::EpcPage;

/// One contiguous EPC range, mapped once at startup and immutable afterwards.
pub(crate) struct EpcSection {
    base: PhysAddr,
    size: usize,
    virt: HostVirtAddr,
    node: u16,
    pages: Box<[EpcPage]>,
    platform: Arc<dyn PlatformOps>,
}

impl EpcSection {
    fn map(region: &EpcRegion, platform: &Arc<dyn PlatformOps>) -> EpcResult<Self> {
        if region.kind != RegionKind::Secure {
            return epc_result_err!(
                EINVAL,
                format!(
                    "EpcSection::map(): region {:#x} has type {:?}, not Secure",
                    region.base, region.kind
                )
            );
        }
        if !is_aligned(region.base) || !is_aligned(region.size) || region.size == 0 {
            return epc_result_err!(
                EINVAL,
                format!(
                    "EpcSection::map(): region {:#x} (size {:#x}) is not page granular",
                    region.base, region.size
                )
            );
        }
        if region.node >= MAX_NUMA_NODES {
            return epc_result_err!(
                EINVAL,
                format!("EpcSection::map(): node {} out of range", region.node)
            );
        }

        let virt = platform.map_section(region.base, region.size)?;
        let page_count = region.size / PAGE_SIZE;
        let pages = (0..page_count)
            .map(|_| EpcPage::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            base: region.base,
            size: region.size,
            virt,
            node: region.node as u16,
            pages,
            platform: Arc::clone(platform),
        })
    }

    pub(crate) fn page(&self, index: u32) -> &EpcPage {
        &self.pages[index as usize]
    }

    pub(crate) fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn node(&self) -> u16 {
        self.node
    }

    pub(crate) fn contains(&self, paddr: PhysAddr) -> bool {
        (self.base..self.base + self.size).contains(&paddr)
    }

    pub(crate) fn paddr_of(&self, index: u32) -> PhysAddr {
        self.base + index as usize * PAGE_SIZE
    }

    pub(crate) fn virt_of(&self, index: u32) -> HostVirtAddr {
        self.virt + index as usize * PAGE_SIZE
    }
}

impl Drop for EpcSection {
    fn drop(&mut self) {
        self.platform.unmap_section(self.virt, self.size);
    }
}

/// Walk the advertised regions and map each of them. Fails fast on the first
/// region that does not validate or map; sections mapped so far are released
/// by drop on the error path.
pub(crate) fn discover_sections(
    regions: &[EpcRegion],
    platform: &Arc<dyn PlatformOps>,
) -> EpcResult<Vec<EpcSection>> {
    if regions.len() > MAX_EPC_SECTIONS {
        return epc_result_err!(
            EINVAL,
            format!(
                "discover_sections(): {} regions advertised, at most {} supported",
                regions.len(),
                MAX_EPC_SECTIONS
            )
        );
    }

    let mut sections = Vec::with_capacity(regions.len());
    for region in regions {
        let section = EpcSection::map(region, platform)?;
        info!(
            "EPC section {:#x}..{:#x} on node {}",
            region.base,
            region.base + region.size,
            region.node
        );
        sections.push(section);
    }
    Ok(sections)
}
