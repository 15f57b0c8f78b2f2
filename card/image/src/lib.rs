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

//! Memory card backed by a flat `.ps2` image file.
//!
//! The image is the concatenation of all physical pages, each `page_len`
//! data bytes followed by the spare bytes on cards with ECC. There is no
//! header: the first 340 bytes of the image are the superblock itself.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use log::debug;
use ps2mc_card::{CardSpecs, MemoryCard, Page, Superblock, SUPERBLOCK_SIZE};
use ps2mc_err::{Error, Result};

pub struct MemoryCardServer {
    file: File,
    superblock: Option<Superblock>,
}

impl MemoryCardServer {
    /// Opens an image read-only, the usual mode for browsing and restoring
    /// from it.
    pub fn open(file_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: File::open(file_path)?,
            superblock: None,
        })
    }

    /// Opens an image for reading and writing, for use as a restore target.
    pub fn open_writable(file_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: OpenOptions::new().read(true).write(true).open(file_path)?,
            superblock: None,
        })
    }

    fn page_offset(&mut self, page: u32) -> Result<u64> {
        let specs = self.specs()?;
        if page >= specs.card_size {
            return Err(Error::InvalidArgument("page out of range"));
        }
        Ok(page as u64 * specs.spare_page_size() as u64)
    }
}

impl MemoryCard for MemoryCardServer {
    fn specs(&mut self) -> Result<CardSpecs> {
        let superblock = self.superblock()?;
        Ok(CardSpecs {
            card_size: superblock.clusters_per_card() * superblock.pages_per_cluster() as u32,
            block_size: superblock.pages_per_block(),
            page_size: superblock.page_len(),
            card_flags: superblock.card_flags(),
        })
    }

    fn superblock(&mut self) -> Result<Superblock> {
        if let Some(superblock) = &self.superblock {
            return Ok(superblock.clone());
        }

        let mut buffer = [0u8; SUPERBLOCK_SIZE];
        self.file.read_exact_at(&mut buffer, 0)?;
        let superblock = Superblock::parse(&buffer)?;
        self.superblock = Some(superblock.clone());
        Ok(superblock)
    }

    fn read_page(&mut self, page: u32) -> Result<Page> {
        let specs = self.specs()?;
        let offset = self.page_offset(page)?;

        let mut buffer = vec![0u8; specs.spare_page_size()];
        self.file.read_exact_at(&mut buffer, offset)?;
        let spare = buffer.split_off(specs.page_size as usize);
        Ok(Page {
            data: buffer,
            spare,
        })
    }

    fn write_page(&mut self, page: u32, data: &[u8], spare: &[u8]) -> Result<()> {
        let specs = self.specs()?;
        if data.len() != specs.page_size as usize {
            return Err(Error::InvalidArgument("page data length"));
        }
        if spare.len() != specs.ecc_size() {
            return Err(Error::InvalidArgument("spare area length"));
        }

        let offset = self.page_offset(page)?;
        self.file.write_all_at(data, offset)?;
        self.file.write_all_at(spare, offset + data.len() as u64)?;
        Ok(())
    }

    fn erase_block(&mut self, page: u32) -> Result<()> {
        let specs = self.specs()?;
        let block_size = specs.block_size.max(1) as u32;
        let first_page = page - page % block_size;
        debug!("Erasing block at page {first_page}");

        let block = vec![specs.erased_byte(); specs.spare_page_size() * block_size as usize];
        let offset = self.page_offset(first_page)?;
        self.file.write_all_at(&block, offset)?;

        // page 0 may just have been wiped
        self.superblock = None;
        Ok(())
    }

    fn read_cluster(&mut self, cluster: u32, include_spare: bool) -> Result<Vec<u8>> {
        let superblock = self.superblock()?;
        let specs = self.specs()?;
        if cluster >= superblock.clusters_per_card() {
            return Err(Error::InvalidArgument("cluster out of range"));
        }

        let pages_per_cluster = superblock.pages_per_cluster() as usize;
        let spare_page_size = specs.spare_page_size();
        let mut buffer = vec![0u8; pages_per_cluster * spare_page_size];
        let offset = cluster as u64 * buffer.len() as u64;
        self.file.read_exact_at(&mut buffer, offset)?;
        if include_spare || specs.ecc_size() == 0 {
            return Ok(buffer);
        }

        Ok(buffer
            .chunks(spare_page_size)
            .flat_map(|page| &page[..specs.page_size as usize])
            .copied()
            .collect())
    }
}
