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

//! Interpreter for the file system PS2 memory cards are formatted with.
//!
//! The card is divided into clusters of (nominally) 1024 logical bytes. A
//! file allocation table maps each cluster of the allocatable area to the
//! next one in its chain; the FAT itself is reached through two levels of
//! indirection starting at the superblock's indirect FAT cluster list.
//! Directories are cluster chains of 512-byte entries, two per cluster.

use std::fmt;

use log::error;
use ps2mc_card::{MemoryCard, Superblock};
use ps2mc_err::{Error, Result};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// Size of a serialized directory entry.
pub const DIR_ENTRY_SIZE: usize = 512;

/// Display name of the parent link entry outside the root directory.
pub const PARENT_DIRECTORY: &str = "<Parent Directory>";

pub const DF_EXISTS: u16 = 0x8000;
pub const DF_HIDDEN: u16 = 0x2000;
pub const DF_PSX: u16 = 0x1000;
pub const DF_POCKETSTN: u16 = 0x0800;
pub const DF_DIRECTORY: u16 = 0x0020;
pub const DF_FILE: u16 = 0x0010;

/// End-of-chain marker.
const FAT_EOC: u32 = 0xFFFFFFFF;
/// High bit of a FAT entry flags it as occupied; the low 31 bits are the
/// next relative cluster.
const FAT_OCCUPIED: u32 = 0x80000000;

pub struct FileSystemServer<MC: MemoryCard> {
    card: MC,
    superblock: Superblock,
    /// FAT words per cluster, 256 on nominally formatted cards.
    entries_per_fat_cluster: u32,
}

impl<MC: MemoryCard> FileSystemServer<MC> {
    pub fn new(mut card: MC) -> Result<Self> {
        let superblock = card.superblock()?;
        superblock.validate()?;

        let entries_per_fat_cluster = (superblock.cluster_len() / size_of::<u32>()) as u32;
        if entries_per_fat_cluster == 0 {
            error!("Cluster length ({}) shall hold FAT entries", superblock.cluster_len());
            return Err(Error::InvalidSuperblock);
        }

        Ok(Self {
            card,
            superblock,
            entries_per_fat_cluster,
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn card(&mut self) -> &mut MC {
        &mut self.card
    }

    pub fn into_card(self) -> MC {
        self.card
    }

    /// First cluster of the root directory, relative to the allocation
    /// offset.
    pub fn root_cluster(&self) -> u32 {
        self.superblock.rootdir_cluster()
    }

    /// Walks the chain starting at a relative cluster, yielding absolute
    /// cluster numbers.
    pub fn cluster_chain(&mut self, cluster: u32) -> ClusterChain<'_, MC> {
        ClusterChain {
            remaining: self.superblock.clusters_per_card(),
            fs: self,
            cluster: Some(cluster),
        }
    }

    /// Lists the directory whose chain starts at a relative cluster. The
    /// parent link `.` is renamed for display and suppressed at the root;
    /// `..` placeholders are never shown.
    pub fn directory(&mut self, cluster: u32) -> Result<Vec<DirEntry>> {
        let at_root = cluster == self.superblock.rootdir_cluster();
        let clusters = self.cluster_chain(cluster).collect::<Result<Vec<_>>>()?;

        let mut entries = Vec::new();
        for cluster in clusters {
            let data = self.card.read_cluster(cluster, false)?;
            for chunk in data.chunks_exact(DIR_ENTRY_SIZE) {
                let Some(mut entry) = DirEntry::decode(chunk) else {
                    continue;
                };
                if entry.name == ".." {
                    continue;
                }
                if entry.name == "." {
                    if at_root {
                        continue;
                    }
                    entry.name = PARENT_DIRECTORY.to_string();
                }
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Reads a file entry's data, honoring its byte length.
    pub fn read_file(&mut self, entry: &DirEntry) -> Result<Vec<u8>> {
        if !entry.is_file() {
            return Err(Error::InvalidArgument("entry is not a file"));
        }

        let clusters = self.cluster_chain(entry.cluster).collect::<Result<Vec<_>>>()?;
        let mut data = Vec::with_capacity(entry.length as usize);
        for cluster in clusters {
            if data.len() >= entry.length as usize {
                break;
            }
            let cluster = self.card.read_cluster(cluster, false)?;
            let length = cluster.len().min(entry.length as usize - data.len());
            data.extend_from_slice(&cluster[..length]);
        }
        Ok(data)
    }

    /// Resolves the FAT entry of a relative cluster through the indirect
    /// FAT cluster list.
    fn fat_entry(&mut self, fat_index: u32) -> Result<u32> {
        let (dbl_indirect_index, indirect_offset, fat_offset) =
            fat_position(fat_index, self.entries_per_fat_cluster);

        let indirect_cluster = self
            .superblock
            .ifc(dbl_indirect_index as usize)
            .filter(|&cluster| cluster != 0)
            .ok_or(Error::InvalidArgument("cluster beyond the FAT"))?;
        let fat_cluster = self.fat_word(indirect_cluster, indirect_offset)?;
        self.fat_word(fat_cluster, fat_offset)
    }

    /// The `index`-th little-endian word of an absolute cluster.
    fn fat_word(&mut self, cluster: u32, index: u32) -> Result<u32> {
        let data = self.card.read_cluster(cluster, false)?;
        let offset = index as usize * size_of::<u32>();
        let word = data
            .get(offset..offset + size_of::<u32>())
            .ok_or(Error::InvalidSuperblock)?;
        Ok(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
    }
}

/// Splits a FAT index into its doubly-indirect, indirect and direct parts.
fn fat_position(fat_index: u32, entries_per_cluster: u32) -> (u32, u32, u32) {
    let fat_offset = fat_index % entries_per_cluster;
    let indirect_index = fat_index / entries_per_cluster;
    let indirect_offset = indirect_index % entries_per_cluster;
    let dbl_indirect_index = indirect_index / entries_per_cluster;
    (dbl_indirect_index, indirect_offset, fat_offset)
}

pub struct ClusterChain<'fs, MC: MemoryCard> {
    fs: &'fs mut FileSystemServer<MC>,
    /// Next relative cluster, `None` once the chain has ended.
    cluster: Option<u32>,
    /// Hop bound; every well-formed chain terminates within the cluster
    /// count of the card.
    remaining: u32,
}

impl<MC: MemoryCard> Iterator for ClusterChain<'_, MC> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        let cluster = self.cluster?;
        if self.remaining == 0 {
            error!("Cluster chain does not terminate");
            self.cluster = None;
            return None;
        }
        self.remaining -= 1;

        let absolute = self.fs.superblock.alloc_offset() + cluster;
        match self.fs.fat_entry(cluster) {
            Ok(FAT_EOC) => self.cluster = None,
            Ok(entry) => {
                let next = entry & !FAT_OCCUPIED;
                let allocatable =
                    self.fs.superblock.alloc_end() - self.fs.superblock.alloc_offset();
                if entry & FAT_OCCUPIED == 0 || next >= allocatable {
                    error!("FAT entry {entry:#010x} does not continue the chain");
                    self.cluster = None;
                } else {
                    self.cluster = Some(next);
                }
            }
            Err(error) => {
                self.cluster = None;
                return Some(Err(error));
            }
        }
        Some(Ok(absolute))
    }
}

/// Serialized directory entry, two per cluster on nominal cards.
#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawDirEntry {
    mode: U16,
    reserved1: [u8; 2],
    /// Byte length for files, child entry count for directories.
    length: U32,
    created: [u8; 8],
    /// First cluster of the entry's data, relative to the allocation offset.
    cluster: U32,
    reserved2: [u8; 4],
    modified: [u8; 8],
    attr: U32,
    reserved3: [u8; 28],
    /// ASCII, NUL-padded.
    name: [u8; 32],
    reserved4: [u8; 416],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub mode: u16,
    /// Byte length for files, child entry count for directories.
    pub length: u32,
    /// First cluster of the entry's data, relative to the allocation offset.
    pub cluster: u32,
    pub attr: u32,
    pub created: Timestamp,
    pub modified: Timestamp,
}

impl DirEntry {
    /// Decodes one 512-byte entry; `None` when the slot holds no entry,
    /// which includes the mode patterns of never-written and erased flash.
    fn decode(buffer: &[u8]) -> Option<Self> {
        let raw = RawDirEntry::read_from_bytes(buffer).ok()?;
        let mode = raw.mode.get();
        if mode == 0x0000 || mode == 0xFFFF || mode == 0x7F7F {
            return None;
        }

        let name = raw
            .name
            .iter()
            .take_while(|&&byte| byte != 0)
            .filter(|byte| byte.is_ascii())
            .map(|&byte| byte as char)
            .collect();
        Some(Self {
            name,
            mode,
            length: raw.length.get(),
            cluster: raw.cluster.get(),
            attr: raw.attr.get(),
            created: Timestamp(raw.created),
            modified: Timestamp(raw.modified),
        })
    }

    pub fn exists(&self) -> bool {
        self.mode & DF_EXISTS != 0
    }

    pub fn is_directory(&self) -> bool {
        self.mode & DF_DIRECTORY != 0
    }

    pub fn is_file(&self) -> bool {
        self.mode & DF_FILE != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.mode & DF_HIDDEN != 0
    }

    pub fn is_psx(&self) -> bool {
        self.mode & DF_PSX != 0
    }

    pub fn is_pocketstation(&self) -> bool {
        self.mode & DF_POCKETSTN != 0
    }
}

/// On-card timestamp: `[reserved, sec, min, hour, day, month, year lo,
/// year hi]`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(pub [u8; 8]);

impl Timestamp {
    pub fn year(&self) -> u16 {
        u16::from_le_bytes([self.0[6], self.0[7]])
    }

    pub fn month(&self) -> u8 {
        self.0[5]
    }

    pub fn day(&self) -> u8 {
        self.0[4]
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.year() == 0 || self.month() == 0 || self.day() == 0 {
            return f.write_str("Unknown");
        }
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year(),
            self.month(),
            self.day(),
            self.0[3],
            self.0[2],
            self.0[1]
        )
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fat_position_splits_the_index() {
        assert_eq!(fat_position(0, 256), (0, 0, 0));
        assert_eq!(fat_position(255, 256), (0, 0, 255));
        assert_eq!(fat_position(256, 256), (0, 1, 0));
        // 70000 = (1 * 256 + 17) * 256 + 112
        assert_eq!(fat_position(70000, 256), (1, 17, 112));
    }

    fn raw_entry(mode: u16, length: u32, cluster: u32, name: &[u8]) -> Vec<u8> {
        let mut buffer = vec![0u8; DIR_ENTRY_SIZE];
        buffer[0..2].copy_from_slice(&mode.to_le_bytes());
        buffer[4..8].copy_from_slice(&length.to_le_bytes());
        buffer[8..16].copy_from_slice(&[0, 30, 15, 10, 21, 3, 0xD4, 0x07]);
        buffer[16..20].copy_from_slice(&cluster.to_le_bytes());
        buffer[64..64 + name.len()].copy_from_slice(name);
        buffer
    }

    #[test]
    fn decode_reads_an_existing_directory() {
        let entry =
            DirEntry::decode(&raw_entry(0x8427, 22528, 12, b"BASLUS-12345SAVE")).unwrap();
        assert_eq!(entry.name, "BASLUS-12345SAVE");
        assert_eq!(entry.length, 22528);
        assert_eq!(entry.cluster, 12);
        assert!(entry.exists());
        assert!(entry.is_directory());
        assert!(!entry.is_file());
        assert!(!entry.is_hidden());
        assert!(!entry.is_psx());
        assert!(!entry.is_pocketstation());
        assert_eq!(entry.created.to_string(), "2004-03-21 10:15:30");
    }

    #[test]
    fn decode_skips_absent_slots() {
        assert!(DirEntry::decode(&raw_entry(0x0000, 0, 0, b"")).is_none());
        assert!(DirEntry::decode(&raw_entry(0xFFFF, 0, 0, b"")).is_none());
        assert!(DirEntry::decode(&raw_entry(0x7F7F, 0, 0, b"")).is_none());
    }

    #[test]
    fn decode_strips_trailing_nuls() {
        let entry = DirEntry::decode(&raw_entry(0x8417, 64, 3, b"SAVE01")).unwrap();
        assert_eq!(entry.name, "SAVE01");
        assert!(entry.is_file());
    }

    #[test]
    fn zero_date_renders_unknown() {
        let timestamp = Timestamp([0, 1, 2, 3, 4, 0, 0xD4, 0x07]);
        assert_eq!(timestamp.to_string(), "Unknown");
        assert_eq!(Timestamp([0; 8]).to_string(), "Unknown");
    }
}
