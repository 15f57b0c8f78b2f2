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

use log::error;
use ps2mc_err::{Error, Result};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// Size of the serialized superblock: the first 340 bytes of the card.
pub const SUPERBLOCK_SIZE: usize = 340;

/// Magic string at the start of every formatted card.
pub const MAGIC: &[u8; 28] = b"Sony PS2 Memory Card Format ";

/// The superblock occupies the first 340 bytes of page 0 (spilling into page
/// 1 on cards with pages smaller than it). All multi-byte fields are
/// little-endian; reserved fields are carried so that re-serializing a parsed
/// superblock reproduces the on-card bytes exactly.
#[repr(C)]
#[derive(Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Superblock {
    /// The magic identifies a formatted card and shall contain, in ASCII
    /// characters, "Sony PS2 Memory Card Format " including the trailing
    /// space.
    magic: [u8; 28],
    /// Format version, e.g. "1.2.0.0", NUL-padded.
    version: [u8; 12],
    /// Count of data bytes per page. This does not include the spare area;
    /// a nominal card reports 512 and transfers 528 bytes per page.
    page_len: U16,
    /// Number of pages per allocation cluster, nominally 2.
    pages_per_cluster: U16,
    /// Number of pages per erase block, nominally 16. The block is the unit
    /// of erasure; single pages cannot be erased.
    pages_per_block: U16,
    /// Shall be 0xFF00.
    reserved1: U16,
    /// Total count of clusters on the card, including those preceding the
    /// allocatable area.
    clusters_per_card: U32,
    /// Absolute cluster number of the first allocatable cluster. Cluster
    /// numbers stored in the FAT and in directory entries are relative to
    /// this offset.
    alloc_offset: U32,
    /// Absolute cluster number just past the allocatable area.
    alloc_end: U32,
    /// First cluster of the root directory, relative to `alloc_offset`.
    rootdir_cluster: U32,
    /// First block of the backup area used while committing writes.
    backup_block1: U32,
    /// Second backup block; erased blocks are staged here.
    backup_block2: U32,
    reserved2: [u8; 8],
    /// Indirect FAT cluster list: the top level of the doubly-indirect FAT.
    /// Each used slot holds the absolute cluster number of a cluster that
    /// itself lists the absolute cluster numbers of FAT clusters. Unused
    /// slots are zero.
    ifc_list: [U32; 32],
    /// Blocks marked unusable at format time; 0xFFFFFFFF means the slot is
    /// unused.
    bad_block_list: [U32; 32],
    /// Shall be 2 for PS2 memory cards.
    card_type: u8,
    /// See the `CF_` constants.
    card_flags: u8,
    reserved3: [u8; 2],
}

impl Superblock {
    /// Parses the leading [`SUPERBLOCK_SIZE`] bytes of `buffer`. Succeeds on
    /// any byte pattern of sufficient length; use [`Superblock::validate`] to
    /// decide whether the card is actually formatted.
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        let buffer = buffer
            .get(..SUPERBLOCK_SIZE)
            .ok_or(Error::InvalidSuperblock)?;
        Self::read_from_bytes(buffer).map_err(|_| Error::InvalidSuperblock)
    }

    pub fn is_formatted(&self) -> bool {
        self.magic.starts_with(MAGIC)
    }

    /// Checks the magic and the geometry invariant
    /// `alloc_offset <= alloc_end <= clusters_per_card`.
    pub fn validate(&self) -> Result<()> {
        if !self.is_formatted() {
            error!("Superblock magic does not match");
            return Err(Error::InvalidSuperblock);
        }
        if self.alloc_offset() > self.alloc_end() || self.alloc_end() > self.clusters_per_card() {
            error!(
                "Allocatable area ({}..{}) shall lie within the card ({} clusters)",
                self.alloc_offset(),
                self.alloc_end(),
                self.clusters_per_card()
            );
            return Err(Error::InvalidSuperblock);
        }
        Ok(())
    }

    pub fn magic(&self) -> String {
        ascii_until_nul(&self.magic)
    }

    pub fn version(&self) -> String {
        ascii_until_nul(&self.version)
    }

    pub fn page_len(&self) -> u16 {
        self.page_len.get()
    }

    pub fn pages_per_cluster(&self) -> u16 {
        self.pages_per_cluster.get()
    }

    pub fn pages_per_block(&self) -> u16 {
        self.pages_per_block.get()
    }

    pub fn clusters_per_card(&self) -> u32 {
        self.clusters_per_card.get()
    }

    pub fn alloc_offset(&self) -> u32 {
        self.alloc_offset.get()
    }

    pub fn alloc_end(&self) -> u32 {
        self.alloc_end.get()
    }

    /// Relative to [`Superblock::alloc_offset`].
    pub fn rootdir_cluster(&self) -> u32 {
        self.rootdir_cluster.get()
    }

    pub fn backup_block1(&self) -> u32 {
        self.backup_block1.get()
    }

    pub fn backup_block2(&self) -> u32 {
        self.backup_block2.get()
    }

    /// Absolute cluster number of the `index`-th indirect FAT cluster.
    pub fn ifc(&self, index: usize) -> Option<u32> {
        self.ifc_list.get(index).map(|cluster| cluster.get())
    }

    /// Blocks recorded as bad, skipping unused slots.
    pub fn bad_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.bad_block_list
            .iter()
            .map(|block| block.get())
            .filter(|&block| block != 0xFFFFFFFF)
    }

    pub fn card_type(&self) -> u8 {
        self.card_type
    }

    pub fn card_flags(&self) -> u8 {
        self.card_flags
    }

    /// Logical bytes per cluster, spare areas excluded.
    pub fn cluster_len(&self) -> usize {
        self.page_len() as usize * self.pages_per_cluster() as usize
    }
}

fn ascii_until_nul(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&byte| byte != 0)
        .map(|&byte| if byte.is_ascii() { byte as char } else { '\u{FFFD}' })
        .collect()
}

#[cfg(test)]
mod tests {
    use zerocopy::IntoBytes;

    use super::*;

    /// Builds the 340-byte superblock of a nominal 8 MiB card.
    fn synthetic() -> Vec<u8> {
        let mut buffer = vec![0u8; SUPERBLOCK_SIZE];
        buffer[0x00..0x1C].copy_from_slice(MAGIC);
        buffer[0x1C..0x23].copy_from_slice(b"1.2.0.0");
        buffer[0x28..0x2A].copy_from_slice(&512u16.to_le_bytes());
        buffer[0x2A..0x2C].copy_from_slice(&2u16.to_le_bytes());
        buffer[0x2C..0x2E].copy_from_slice(&16u16.to_le_bytes());
        buffer[0x2E..0x30].copy_from_slice(&0xFF00u16.to_le_bytes());
        buffer[0x30..0x34].copy_from_slice(&8192u32.to_le_bytes());
        buffer[0x34..0x38].copy_from_slice(&41u32.to_le_bytes());
        buffer[0x38..0x3C].copy_from_slice(&8135u32.to_le_bytes());
        buffer[0x3C..0x40].copy_from_slice(&0u32.to_le_bytes());
        buffer[0x40..0x44].copy_from_slice(&1023u32.to_le_bytes());
        buffer[0x44..0x48].copy_from_slice(&1022u32.to_le_bytes());
        buffer[0x50..0x54].copy_from_slice(&8u32.to_le_bytes());
        for slot in 0..32 {
            let offset = 0xD0 + slot * 4;
            buffer[offset..offset + 4].copy_from_slice(&0xFFFFFFFFu32.to_le_bytes());
        }
        buffer[0x150] = 2;
        buffer[0x151] = 0x11;
        buffer
    }

    #[test]
    fn parse_round_trips() {
        let buffer = synthetic();
        let superblock = Superblock::parse(&buffer).unwrap();
        assert_eq!(superblock.as_bytes(), &buffer[..]);
    }

    #[test]
    fn parse_nominal_card() {
        let superblock = Superblock::parse(&synthetic()).unwrap();
        assert!(superblock.is_formatted());
        assert_eq!(superblock.magic(), "Sony PS2 Memory Card Format ");
        assert_eq!(superblock.version(), "1.2.0.0");
        assert_eq!(superblock.page_len(), 512);
        assert_eq!(superblock.pages_per_cluster(), 2);
        assert_eq!(superblock.pages_per_block(), 16);
        assert_eq!(superblock.clusters_per_card(), 8192);
        assert_eq!(superblock.alloc_offset(), 41);
        assert_eq!(superblock.alloc_end(), 8135);
        assert_eq!(superblock.rootdir_cluster(), 0);
        assert_eq!(superblock.ifc(0), Some(8));
        assert_eq!(superblock.bad_blocks().count(), 0);
        assert_eq!(superblock.card_type(), 2);
        assert_eq!(superblock.card_flags(), 0x11);
        superblock.validate().unwrap();
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert!(matches!(
            Superblock::parse(&[0u8; 339]),
            Err(Error::InvalidSuperblock)
        ));
    }

    #[test]
    fn validate_rejects_wrong_magic() {
        let mut buffer = synthetic();
        buffer[0] = b'X';
        let superblock = Superblock::parse(&buffer).unwrap();
        assert!(!superblock.is_formatted());
        assert!(superblock.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_alloc_area() {
        let mut buffer = synthetic();
        buffer[0x34..0x38].copy_from_slice(&9000u32.to_le_bytes());
        let superblock = Superblock::parse(&buffer).unwrap();
        assert!(superblock.validate().is_err());
    }
}
