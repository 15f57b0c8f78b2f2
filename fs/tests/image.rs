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

//! End-to-end walk of a synthetic 8 MiB card image: superblock, FAT
//! indirection, directory chains, file contents and a full dump.

use std::{fs::File, io::Write, path::PathBuf};

use ps2mc_card::{ecc, transfer::Dump, MemoryCard, SPARE_SIZE};
use ps2mc_card_image::MemoryCardServer;
use ps2mc_fs::{FileSystemServer, PARENT_DIRECTORY};

const PAGE_SIZE: usize = 512;
const PAGES_PER_CLUSTER: usize = 2;
const CLUSTERS_PER_CARD: u32 = 8192;
const ALLOC_OFFSET: u32 = 41;
const ALLOC_END: u32 = 8135;
/// Absolute cluster of the indirect FAT cluster list's only used entry.
const IFC_CLUSTER: u32 = 8;
/// Absolute cluster of the one FAT cluster the image needs.
const FAT_CLUSTER: u32 = 9;

const DATE: [u8; 8] = [0, 30, 15, 10, 21, 3, 0xD4, 0x07];

fn write_page(image: &mut [u8], page: usize, data: &[u8]) {
    let offset = page * (PAGE_SIZE + SPARE_SIZE);
    image[offset..offset + PAGE_SIZE].copy_from_slice(data);
    image[offset + PAGE_SIZE..offset + PAGE_SIZE + SPARE_SIZE]
        .copy_from_slice(&ecc::page_spare(data, SPARE_SIZE, 0x00));
}

fn write_cluster(image: &mut [u8], cluster: u32, data: &[u8]) {
    for (index, page) in data.chunks(PAGE_SIZE).enumerate() {
        write_page(image, cluster as usize * PAGES_PER_CLUSTER + index, page);
    }
}

fn dir_entry(mode: u16, length: u32, cluster: u32, name: &[u8], date: [u8; 8]) -> Vec<u8> {
    let mut entry = vec![0u8; 512];
    entry[0..2].copy_from_slice(&mode.to_le_bytes());
    entry[4..8].copy_from_slice(&length.to_le_bytes());
    entry[8..16].copy_from_slice(&date);
    entry[16..20].copy_from_slice(&cluster.to_le_bytes());
    entry[24..32].copy_from_slice(&date);
    entry[64..64 + name.len()].copy_from_slice(name);
    entry
}

fn file_contents() -> Vec<u8> {
    (0..1000u32).map(|index| (index % 251) as u8).collect()
}

fn build_image() -> Vec<u8> {
    let mut image =
        vec![0u8; CLUSTERS_PER_CARD as usize * PAGES_PER_CLUSTER * (PAGE_SIZE + SPARE_SIZE)];

    let mut superblock = vec![0u8; 1024];
    superblock[0x00..0x1C].copy_from_slice(ps2mc_card::MAGIC);
    superblock[0x1C..0x23].copy_from_slice(b"1.2.0.0");
    superblock[0x28..0x2A].copy_from_slice(&(PAGE_SIZE as u16).to_le_bytes());
    superblock[0x2A..0x2C].copy_from_slice(&(PAGES_PER_CLUSTER as u16).to_le_bytes());
    superblock[0x2C..0x2E].copy_from_slice(&16u16.to_le_bytes());
    superblock[0x2E..0x30].copy_from_slice(&0xFF00u16.to_le_bytes());
    superblock[0x30..0x34].copy_from_slice(&CLUSTERS_PER_CARD.to_le_bytes());
    superblock[0x34..0x38].copy_from_slice(&ALLOC_OFFSET.to_le_bytes());
    superblock[0x38..0x3C].copy_from_slice(&ALLOC_END.to_le_bytes());
    superblock[0x3C..0x40].copy_from_slice(&0u32.to_le_bytes());
    superblock[0x40..0x44].copy_from_slice(&1023u32.to_le_bytes());
    superblock[0x44..0x48].copy_from_slice(&1022u32.to_le_bytes());
    superblock[0x50..0x54].copy_from_slice(&IFC_CLUSTER.to_le_bytes());
    for slot in 0..32 {
        let offset = 0xD0 + slot * 4;
        superblock[offset..offset + 4].copy_from_slice(&0xFFFFFFFFu32.to_le_bytes());
    }
    superblock[0x150] = 2;
    superblock[0x151] = 0x11;
    write_cluster(&mut image, 0, &superblock);

    let mut ifc = vec![0u8; 1024];
    ifc[0..4].copy_from_slice(&FAT_CLUSTER.to_le_bytes());
    write_cluster(&mut image, IFC_CLUSTER, &ifc);

    // root chain 0 -> 1, single-cluster file at 2, subdirectory at 3, and a
    // spare chain 4 -> 7
    let mut fat = [0x7FFFFFFFu32; 256];
    fat[0] = 0x80000001;
    fat[1] = 0xFFFFFFFF;
    fat[2] = 0xFFFFFFFF;
    fat[3] = 0xFFFFFFFF;
    fat[4] = 0x80000007;
    fat[7] = 0xFFFFFFFF;
    let mut fat_bytes = Vec::with_capacity(1024);
    for word in fat {
        fat_bytes.extend_from_slice(&word.to_le_bytes());
    }
    write_cluster(&mut image, FAT_CLUSTER, &fat_bytes);

    let mut root0 = dir_entry(0x8427, 4, 0, b".", DATE);
    root0.extend_from_slice(&dir_entry(0x8427, 0, 0, b"..", [0; 8]));
    write_cluster(&mut image, ALLOC_OFFSET, &root0);

    let mut root1 = dir_entry(0x8427, 2, 3, b"BASLUS-12345SAVE", DATE);
    root1.extend_from_slice(&dir_entry(0x8417, 1000, 2, b"SAVE01", DATE));
    write_cluster(&mut image, ALLOC_OFFSET + 1, &root1);

    let mut contents = file_contents();
    contents.resize(1024, 0);
    write_cluster(&mut image, ALLOC_OFFSET + 2, &contents);

    let mut subdir = dir_entry(0x8427, 2, 0, b".", DATE);
    subdir.extend_from_slice(&dir_entry(0x8427, 0, 0, b"..", [0; 8]));
    write_cluster(&mut image, ALLOC_OFFSET + 3, &subdir);

    image
}

fn temp_image(name: &str) -> PathBuf {
    let path =
        std::env::temp_dir().join(format!("ps2mc_fs_{}_{name}.ps2", std::process::id()));
    File::create(&path)
        .unwrap()
        .write_all(&build_image())
        .unwrap();
    path
}

fn server(path: &PathBuf) -> FileSystemServer<MemoryCardServer> {
    FileSystemServer::new(MemoryCardServer::open(path).unwrap()).unwrap()
}

#[test]
fn formatted_card_reports_its_version() {
    let path = temp_image("version");
    let mut card = MemoryCardServer::open(&path).unwrap();
    assert!(card.is_formatted().unwrap());
    let superblock = card.superblock().unwrap();
    assert_eq!(superblock.magic(), "Sony PS2 Memory Card Format ");
    assert_eq!(superblock.version(), "1.2.0.0");
    let specs = card.specs().unwrap();
    assert_eq!(specs.erased_byte(), 0x00);
    assert!(specs.has_ecc());
}

#[test]
fn root_listing_hides_parent_links() {
    let path = temp_image("root");
    let mut fs = server(&path);
    assert_eq!(fs.root_cluster(), 0);

    let entries = fs.directory(fs.root_cluster()).unwrap();
    let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names, ["BASLUS-12345SAVE", "SAVE01"]);

    let save = &entries[0];
    assert!(save.exists());
    assert!(save.is_directory());
    assert!(!save.is_hidden());
    assert_eq!(save.cluster, 3);
    assert_eq!(save.modified.to_string(), "2004-03-21 10:15:30");

    let file = &entries[1];
    assert!(file.is_file());
    assert_eq!(file.length, 1000);
}

#[test]
fn subdirectory_listing_renames_the_parent_link() {
    let path = temp_image("subdir");
    let mut fs = server(&path);
    let entries = fs.directory(3).unwrap();
    let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names, [PARENT_DIRECTORY]);
}

#[test]
fn cluster_chains_resolve_through_the_fat() {
    let path = temp_image("chains");
    let mut fs = server(&path);

    let chain: Vec<_> = fs.cluster_chain(0).collect::<Result<_, _>>().unwrap();
    assert_eq!(chain, [41, 42]);

    // entry 0x80000007 continues at relative cluster 7, absolute 48
    let chain: Vec<_> = fs.cluster_chain(4).collect::<Result<_, _>>().unwrap();
    assert_eq!(chain, [45, 48]);
}

#[test]
fn file_data_is_read_to_its_recorded_length() {
    let path = temp_image("read");
    let mut fs = server(&path);
    let entries = fs.directory(fs.root_cluster()).unwrap();
    let save = entries.iter().find(|entry| entry.name == "SAVE01").unwrap();
    assert_eq!(fs.read_file(save).unwrap(), file_contents());
}

#[test]
fn dump_reproduces_the_image_byte_for_byte() {
    let path = temp_image("dump");
    let image = std::fs::read(&path).unwrap();

    let mut card = MemoryCardServer::open(&path).unwrap();
    let mut dumped = Vec::with_capacity(image.len());
    for page in Dump::new(&mut card, &mut dumped).unwrap() {
        page.unwrap();
    }
    assert_eq!(dumped.len(), image.len());
    assert!(dumped == image);

    // the dump is itself a valid card with the same listing
    let copy_path = path.with_extension("copy.ps2");
    File::create(&copy_path).unwrap().write_all(&dumped).unwrap();
    let mut original = server(&path);
    let mut copy = server(&copy_path);
    assert_eq!(
        original.superblock().magic(),
        copy.superblock().magic()
    );
    assert_eq!(
        original.directory(0).unwrap(),
        copy.directory(0).unwrap()
    );
}
