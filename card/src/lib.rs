// Copyright 2025 Kevin Ludwig
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

pub use ps2mc_err::*;

pub mod ecc;
mod superblock;
pub mod transfer;

pub use superblock::{Superblock, MAGIC, SUPERBLOCK_SIZE};

use ps2mc_err::{Error, Result};

/// The card transfers and verifies a spare area with every page.
pub const CF_USE_ECC: u8 = 0x01;
/// The card may contain blocks marked bad in the superblock.
pub const CF_BAD_BLOCK: u8 = 0x08;
/// Erased pages read as all-zeroes instead of all-ones.
pub const CF_ERASE_ZEROES: u8 = 0x10;

/// Size in bytes of the spare area trailing each physical page on cards that
/// carry ECC.
pub const SPARE_SIZE: usize = 16;

/// Negotiated card geometry, either decoded from the adaptor's spec query or
/// derived from a parsed superblock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CardSpecs {
    /// Total number of physical pages.
    pub card_size: u32,
    /// Pages per erase block.
    pub block_size: u16,
    /// Data bytes per page, excluding the spare area.
    pub page_size: u16,
    /// Card flags snapshot, see the `CF_` constants.
    pub card_flags: u8,
}

impl CardSpecs {
    pub fn has_ecc(&self) -> bool {
        self.card_flags & CF_USE_ECC != 0
    }

    pub fn may_have_bad_blocks(&self) -> bool {
        self.card_flags & CF_BAD_BLOCK != 0
    }

    /// The value every byte of an erased page holds.
    pub fn erased_byte(&self) -> u8 {
        if self.card_flags & CF_ERASE_ZEROES != 0 { 0x00 } else { 0xFF }
    }

    pub fn ecc_size(&self) -> usize {
        if self.has_ecc() { SPARE_SIZE } else { 0 }
    }

    /// Physical page size, data plus spare area.
    pub fn spare_page_size(&self) -> usize {
        self.page_size as usize + self.ecc_size()
    }
}

/// One physical page: the data area and, on cards with ECC, the 16 spare
/// bytes that were transferred with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub data: Vec<u8>,
    pub spare: Vec<u8>,
}

/// A memory card, backed either by the USB adaptor or by a flat image file.
///
/// Handles are single-threaded: they own per-handle caches (superblock,
/// pages) and the underlying transport is strictly request/response, so all
/// operations take `&mut self` and no two operations may interleave.
/// Connections are closed by dropping the handle.
pub trait MemoryCard {
    /// Negotiated geometry of the card.
    fn specs(&mut self) -> Result<CardSpecs>;

    /// The parsed superblock, cached after the first query. No validation is
    /// performed here; an unformatted card yields garbage fields and a failed
    /// [`MemoryCard::is_formatted`].
    fn superblock(&mut self) -> Result<Superblock>;

    fn is_formatted(&mut self) -> Result<bool> {
        Ok(self.superblock()?.is_formatted())
    }

    /// Reads one physical page together with its spare area.
    fn read_page(&mut self, page: u32) -> Result<Page>;

    /// Writes one physical page. The spare area is caller-supplied and must
    /// already contain correct ECC, see [`ecc::page_spare`]; pages restored
    /// from a dump carry their original spare bytes.
    fn write_page(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<()>;

    /// Erases the block enclosing `page`.
    fn erase_block(&mut self, page: u32) -> Result<()>;

    /// Reads one absolute cluster, stripping the spare bytes of each page
    /// unless `include_spare` is set.
    fn read_cluster(&mut self, cluster: u32, include_spare: bool) -> Result<Vec<u8>> {
        let superblock = self.superblock()?;
        if cluster >= superblock.clusters_per_card() {
            return Err(Error::InvalidArgument("cluster out of range"));
        }

        let pages_per_cluster = superblock.pages_per_cluster() as u32;
        let mut buffer = Vec::new();
        for page in 0..pages_per_cluster {
            let page = self.read_page(cluster * pages_per_cluster + page)?;
            buffer.extend_from_slice(&page.data);
            if include_spare {
                buffer.extend_from_slice(&page.spare);
            }
        }

        Ok(buffer)
    }

    /// First cluster of the root directory, relative to the allocation
    /// offset.
    fn root_cluster(&mut self) -> Result<u32> {
        Ok(self.superblock()?.rootdir_cluster())
    }
}
